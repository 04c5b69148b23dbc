//! Structured errors returned by the library and printed by the CLI.
//!
//! Every failure carries a stable `AREA/REASON` code, a readable message and
//! string context. Store failures keep their classification under the
//! `class` context key so callers can tell lock contention from constraint
//! violations without parsing messages.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::Error as SqlxError;

pub mod store;

pub use store::{classify, StoreErrorKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
    /// Underlying failure, kept when a domain error wraps a store error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<AppError>>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if !self.context.is_empty() {
            let mut pairs: Vec<_> = self.context.iter().collect();
            pairs.sort();
            let rendered: Vec<String> = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
            write!(f, " ({})", rendered.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

fn store_code(class: StoreErrorKind, error: &SqlxError) -> &'static str {
    match class {
        StoreErrorKind::ForeignKey => "STORE/FOREIGN_KEY",
        StoreErrorKind::LockTimeout => "STORE/LOCKED",
        StoreErrorKind::Schema => "STORE/SCHEMA",
        StoreErrorKind::Other => match error {
            SqlxError::RowNotFound => "STORE/ROW_NOT_FOUND",
            SqlxError::PoolTimedOut => "STORE/POOL_TIMEOUT",
            SqlxError::PoolClosed => "STORE/POOL_CLOSED",
            SqlxError::Io(_) => "STORE/IO",
            SqlxError::ColumnDecode { .. } | SqlxError::Decode(_) => "STORE/DECODE",
            _ => "STORE/ERROR",
        },
    }
}

impl From<SqlxError> for AppError {
    fn from(error: SqlxError) -> Self {
        let class = classify(&error);
        let code = store_code(class, &error);
        let mut app_error = match &error {
            SqlxError::Database(db) => {
                let mut app_error = AppError::new(code, db.message());
                if let Some(sqlite_code) = db.code() {
                    app_error = app_error.with_context("sqlite_code", sqlite_code);
                }
                if let Some(constraint) = db.constraint() {
                    app_error = app_error.with_context("constraint", constraint);
                }
                app_error
            }
            SqlxError::ColumnDecode { index, source } => {
                AppError::new(code, source.to_string()).with_context("column", index.as_str())
            }
            other => AppError::new(code, other.to_string()),
        };
        if class != StoreErrorKind::Other {
            app_error = app_error.with_context("class", class.as_str());
        }
        app_error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_failure_keeps_store_cause() {
        let error = AppError::new("HISTORY/LOCK_TIMEOUT", "store stayed locked")
            .with_context("ticket_id", "42")
            .with_context("attempts", "3")
            .with_cause(SqlxError::PoolTimedOut);

        assert_eq!(
            error.to_string(),
            "[HISTORY/LOCK_TIMEOUT] store stayed locked (attempts=3, ticket_id=42)"
        );
        let cause = error.cause().expect("cause present");
        assert_eq!(cause.code(), "STORE/POOL_TIMEOUT");
        assert!(std::error::Error::source(&error).is_some());
    }

    #[test]
    fn missing_row_is_not_classified() {
        let app_error = AppError::from(SqlxError::RowNotFound);
        assert_eq!(app_error.code(), "STORE/ROW_NOT_FOUND");
        assert!(app_error.context().get("class").is_none());
    }

    #[test]
    fn unknown_column_is_a_schema_failure() {
        let app_error = AppError::from(SqlxError::ColumnNotFound("assigned_to".into()));
        assert_eq!(app_error.code(), "STORE/SCHEMA");
        assert_eq!(app_error.context().get("class"), Some(&"schema".to_string()));
    }

    #[test]
    fn serializes_without_empty_fields() {
        let error = AppError::new("LINK/TICKET_NOT_FOUND", "ticket 9 does not exist")
            .with_context("ticket_id", "9");
        let value = serde_json::to_value(&error).expect("serialize app error");
        assert_eq!(value["code"], "LINK/TICKET_NOT_FOUND");
        assert_eq!(value["context"]["ticket_id"], "9");
        assert!(value.get("cause").is_none());

        let bare = serde_json::to_value(AppError::new("CASCADE/NOT_STARTED", "idle"))
            .expect("serialize app error");
        assert!(bare.get("context").is_none());
    }
}
