//! Schema introspection over SQLite's table-valued pragmas.
//!
//! Cascade steps interpolate table and column names into SQL, so every name
//! is checked here against the live schema before a statement is built, and
//! is always emitted through [`quote_ident`].

use std::collections::BTreeMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sqlx::{Executor, Row, Sqlite};

static PLAIN_IDENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

/// A foreign key declared on `table.column` pointing at another table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
    pub references_table: String,
    pub references_column: Option<String>,
}

impl fmt::Display for ForeignKeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.references_column {
            Some(col) => write!(
                f,
                "{}.{} -> {}.{}",
                self.table, self.column, self.references_table, col
            ),
            None => write!(f, "{}.{} -> {}", self.table, self.column, self.references_table),
        }
    }
}

/// True when `name` needs no quoting. Anything else is rejected before it
/// reaches the schema lookup.
pub fn is_plain_identifier(name: &str) -> bool {
    PLAIN_IDENT.is_match(name)
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub async fn table_exists<'e, E>(executor: E, table: &str) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let found: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_optional(executor)
            .await?;
    Ok(found.is_some())
}

/// Column names in declaration order. Empty when the table does not exist.
pub async fn columns<'e, E>(executor: E, table: &str) -> Result<Vec<String>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar("SELECT name FROM pragma_table_info(?) ORDER BY cid")
        .bind(table)
        .fetch_all(executor)
        .await
}

/// The first primary-key column, if the table declares one.
pub async fn primary_key<'e, E>(executor: E, table: &str) -> Result<Option<String>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_scalar("SELECT name FROM pragma_table_info(?) WHERE pk = 1")
        .bind(table)
        .fetch_optional(executor)
        .await
}

pub async fn column_types<'e, E>(
    executor: E,
    table: &str,
) -> Result<BTreeMap<String, String>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query("SELECT name, type FROM pragma_table_info(?)")
        .bind(table)
        .fetch_all(executor)
        .await?;
    let mut out = BTreeMap::new();
    for row in rows {
        let name: String = row.try_get("name")?;
        let ty: String = row.try_get("type")?;
        out.insert(name, ty);
    }
    Ok(out)
}

/// Every foreign key, across all tables, that points at `table`.
pub async fn referencing_foreign_keys<'e, E>(
    executor: E,
    table: &str,
) -> Result<Vec<ForeignKeyRef>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        r#"
        SELECT m.name AS from_table, f."from" AS from_column, f."table" AS to_table, f."to" AS to_column
        FROM sqlite_master AS m, pragma_foreign_key_list(m.name) AS f
        WHERE m.type = 'table' AND f."table" = ?
        ORDER BY m.name, f.id, f.seq
        "#,
    )
    .bind(table)
    .fetch_all(executor)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(ForeignKeyRef {
            table: row.try_get("from_table")?,
            column: row.try_get("from_column")?,
            references_table: row.try_get("to_table")?,
            references_column: row.try_get("to_column")?,
        });
    }
    Ok(out)
}
