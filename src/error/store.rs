//! Classification of relational-store failures.
//!
//! Structured driver information (the `sqlx` error kind and the SQLite
//! extended result code) decides first. Message markers are only consulted
//! when the driver reports nothing more specific than a generic code.

use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::error::{DatabaseError, ErrorKind};
use sqlx::Error as SqlxError;

const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;
/// Postgres `lock_not_available`.
const SQLSTATE_LOCK_NOT_AVAILABLE: &str = "55P03";

static FOREIGN_KEY_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)foreign key constraint (fails|failed)|violates foreign key constraint")
        .expect("valid foreign key regex")
});
static LOCK_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)lock wait timeout|database (table )?is locked|database is busy")
        .expect("valid lock regex")
});
static SCHEMA_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)no such (table|column)|unknown column|doesn't exist")
        .expect("valid schema regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    ForeignKey,
    LockTimeout,
    Schema,
    Other,
}

impl StoreErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreErrorKind::ForeignKey => "foreign_key",
            StoreErrorKind::LockTimeout => "lock_timeout",
            StoreErrorKind::Schema => "schema",
            StoreErrorKind::Other => "other",
        }
    }
}

pub fn classify(err: &SqlxError) -> StoreErrorKind {
    match err {
        SqlxError::ColumnNotFound(_) => StoreErrorKind::Schema,
        SqlxError::Database(db) => {
            structured_kind(db.as_ref()).unwrap_or_else(|| classify_message(db.message()))
        }
        _ => StoreErrorKind::Other,
    }
}

fn structured_kind(db: &dyn DatabaseError) -> Option<StoreErrorKind> {
    if matches!(db.kind(), ErrorKind::ForeignKeyViolation) {
        return Some(StoreErrorKind::ForeignKey);
    }
    let code = db.code()?;
    if let Ok(extended) = code.parse::<i64>() {
        // Extended result codes carry the primary code in the low byte.
        let primary = extended & 0xff;
        if primary == SQLITE_BUSY || primary == SQLITE_LOCKED {
            return Some(StoreErrorKind::LockTimeout);
        }
    } else if code == SQLSTATE_LOCK_NOT_AVAILABLE {
        return Some(StoreErrorKind::LockTimeout);
    }
    None
}

/// Fallback for drivers that only expose error text.
pub fn classify_message(message: &str) -> StoreErrorKind {
    if FOREIGN_KEY_MARKER.is_match(message) {
        StoreErrorKind::ForeignKey
    } else if LOCK_MARKER.is_match(message) {
        StoreErrorKind::LockTimeout
    } else if SCHEMA_MARKER.is_match(message) {
        StoreErrorKind::Schema
    } else {
        StoreErrorKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_markers() {
        assert_eq!(
            classify_message("Cannot delete or update a parent row: a foreign key constraint fails"),
            StoreErrorKind::ForeignKey
        );
        assert_eq!(
            classify_message("FOREIGN KEY constraint failed"),
            StoreErrorKind::ForeignKey
        );
        assert_eq!(
            classify_message("Lock wait timeout exceeded; try restarting transaction"),
            StoreErrorKind::LockTimeout
        );
        assert_eq!(classify_message("database is locked"), StoreErrorKind::LockTimeout);
        assert_eq!(classify_message("no such table: tickets"), StoreErrorKind::Schema);
        assert_eq!(classify_message("injected failure"), StoreErrorKind::Other);
    }

    #[test]
    fn non_database_errors_are_other() {
        assert_eq!(classify(&SqlxError::RowNotFound), StoreErrorKind::Other);
        assert_eq!(classify(&SqlxError::PoolTimedOut), StoreErrorKind::Other);
        assert_eq!(
            classify(&SqlxError::ColumnNotFound("x".into())),
            StoreErrorKind::Schema
        );
    }
}
