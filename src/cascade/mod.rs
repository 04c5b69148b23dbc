//! Cascading deletion.
//!
//! A [`CascadePlan`] lists the steps that remove one entity row together with
//! the rows that depend on it. Plans run either atomically in a single
//! transaction ([`atomic`]) or one confirmed step at a time with progress kept
//! in session state ([`stepwise`]).

use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use thiserror::Error;

use crate::db::schema;
use crate::entity::EntityType;
use crate::error::{classify, StoreErrorKind};
use crate::AppError;

pub mod atomic;
pub mod plan;
pub mod stepwise;

pub use atomic::{
    execute_atomic_cascade, run_atomic_cascade, CascadeOutcome, CascadeReport, StepReport,
};
pub use plan::{
    check_plan_schema, plan_for, plan_for_table, registered_plans, CascadePlan, CascadeStep,
    PlanError,
};
pub use stepwise::{CascadeProgress, StepwiseCascade, StepwiseState};

pub const FOREIGN_KEY_HINT: &str =
    "Other rows still reference this record. Use interactive deletion to confirm each step, or delete the dependent rows manually first.";

/// The row a cascade removes: `table.id_column = id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeTarget {
    pub table: String,
    pub id_column: String,
    pub id: i64,
}

impl CascadeTarget {
    pub fn new(table: impl Into<String>, id_column: impl Into<String>, id: i64) -> Self {
        Self {
            table: table.into(),
            id_column: id_column.into(),
            id,
        }
    }

    pub fn entity(entity: EntityType, id: i64) -> Self {
        Self::new(entity.table(), "id", id)
    }

    pub fn entity_type(&self) -> Option<EntityType> {
        EntityType::from_table(&self.table)
    }

    pub fn plan(&self) -> CascadePlan {
        plan_for_table(&self.table)
    }
}

fn schema_subject(table: &str, column: &Option<String>) -> String {
    match column {
        Some(column) => format!("column `{column}` does not exist on `{table}`"),
        None => format!("table `{table}` does not exist"),
    }
}

fn step_label(step: &Option<usize>) -> String {
    match step {
        Some(index) => format!(" at step {}", index + 1),
        None => String::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CascadeError {
    #[error("schema mismatch: {}", schema_subject(.table, .column))]
    Schema { table: String, column: Option<String> },
    #[error("step {} ({description}) is blocked by a foreign key constraint: {message}", .step + 1)]
    ForeignKeyConstraint {
        step: usize,
        description: String,
        message: String,
        blocking: Vec<String>,
    },
    #[error("lock wait timeout{}: {message}", step_label(.step))]
    LockTimeout { step: Option<usize>, message: String },
    #[error("transaction failed{}: {message}", step_label(.step))]
    Transaction { step: Option<usize>, message: String },
    #[error("no interactive deletion is in progress")]
    NoActiveCascade,
    #[error("saved progress for `{table}` has {stored_total} steps, its plan has {plan_total}")]
    StaleProgress {
        table: String,
        stored_total: usize,
        plan_total: usize,
    },
    #[error("session state unavailable: {0}")]
    Session(String),
}

impl CascadeError {
    /// Classifies a failure raised while `step` (at `index`) was running.
    pub(crate) fn from_step_failure(
        index: usize,
        step: &CascadeStep,
        target: &CascadeTarget,
        err: sqlx::Error,
    ) -> Self {
        match classify(&err) {
            StoreErrorKind::ForeignKey => CascadeError::ForeignKeyConstraint {
                step: index,
                description: step.describe(target),
                message: store_message(&err),
                blocking: Vec::new(),
            },
            StoreErrorKind::LockTimeout => CascadeError::LockTimeout {
                step: Some(index),
                message: store_message(&err),
            },
            StoreErrorKind::Schema => CascadeError::Schema {
                table: step.table(target).to_string(),
                column: None,
            },
            StoreErrorKind::Other => CascadeError::Transaction {
                step: Some(index),
                message: store_message(&err),
            },
        }
    }

    /// Classifies a failure outside any single step (begin, commit, pool).
    pub(crate) fn from_store(err: sqlx::Error) -> Self {
        match classify(&err) {
            StoreErrorKind::LockTimeout => CascadeError::LockTimeout {
                step: None,
                message: store_message(&err),
            },
            _ => CascadeError::Transaction {
                step: None,
                message: store_message(&err),
            },
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            CascadeError::ForeignKeyConstraint { .. } => Some(FOREIGN_KEY_HINT),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            CascadeError::Schema { .. } => "CASCADE/SCHEMA",
            CascadeError::ForeignKeyConstraint { .. } => "CASCADE/FOREIGN_KEY",
            CascadeError::LockTimeout { .. } => "CASCADE/LOCK_TIMEOUT",
            CascadeError::Transaction { .. } => "CASCADE/TRANSACTION",
            CascadeError::NoActiveCascade => "CASCADE/NOT_STARTED",
            CascadeError::StaleProgress { .. } => "CASCADE/STALE_PROGRESS",
            CascadeError::Session(_) => "CASCADE/SESSION",
        }
    }

    fn with_blocking(self, relationships: Vec<String>) -> Self {
        match self {
            CascadeError::ForeignKeyConstraint {
                step,
                description,
                message,
                ..
            } => CascadeError::ForeignKeyConstraint {
                step,
                description,
                message,
                blocking: relationships,
            },
            other => other,
        }
    }
}

fn store_message(err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db) => db.message().to_string(),
        other => other.to_string(),
    }
}

impl From<CascadeError> for AppError {
    fn from(error: CascadeError) -> Self {
        let mut app_error = AppError::new(error.code(), error.to_string());
        match &error {
            CascadeError::Schema { table, column } => {
                app_error = app_error.with_context("table", table.clone());
                if let Some(column) = column {
                    app_error = app_error.with_context("column", column.clone());
                }
            }
            CascadeError::ForeignKeyConstraint {
                step,
                description,
                blocking,
                ..
            } => {
                app_error = app_error
                    .with_context("step", (step + 1).to_string())
                    .with_context("description", description.clone());
                if !blocking.is_empty() {
                    app_error = app_error.with_context("blocking", blocking.join("; "));
                }
            }
            CascadeError::LockTimeout { step, .. } | CascadeError::Transaction { step, .. } => {
                if let Some(step) = step {
                    app_error = app_error.with_context("step", (step + 1).to_string());
                }
            }
            CascadeError::StaleProgress { table, .. } => {
                app_error = app_error.with_context("table", table.clone());
            }
            CascadeError::NoActiveCascade | CascadeError::Session(_) => {}
        }
        if let Some(hint) = error.hint() {
            app_error = app_error.with_context("hint", hint);
        }
        app_error
    }
}

/// Runs one step against an open connection or transaction and returns the
/// number of rows it touched. Names must already be checked against the schema.
pub(crate) async fn apply_step(
    conn: &mut SqliteConnection,
    step: &CascadeStep,
    target: &CascadeTarget,
) -> Result<u64, sqlx::Error> {
    let sql = step.statement(target);
    let result = sqlx::query(&sql).bind(target.id).execute(conn).await?;
    Ok(result.rows_affected())
}

/// Which incoming foreign keys count as blocking when a step is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockingScope {
    /// Keys the plan does not handle. Used after a rolled-back atomic run,
    /// where every planned step was undone.
    Unplanned,
    /// Keys that still have rows pointing at the target. Earlier steps of an
    /// interactive deletion may have been skipped, so planned keys can block.
    StillReferenced,
}

/// Incoming foreign keys on the table a failed step touched that are the
/// likely reason the statement was refused.
pub(crate) async fn blocking_relationships(
    pool: &SqlitePool,
    plan: &CascadePlan,
    step: &CascadeStep,
    target: &CascadeTarget,
    scope: BlockingScope,
) -> Vec<String> {
    let table = step.table(target);
    let refs = match schema::referencing_foreign_keys(pool, table).await {
        Ok(refs) => refs,
        Err(err) => {
            tracing::warn!(
                target: "ticketdesk",
                event = "cascade_blocking_lookup_failed",
                table = %table,
                error = %err
            );
            return Vec::new();
        }
    };
    if table != target.table {
        return refs.into_iter().map(|fk| fk.to_string()).collect();
    }

    let mut blocking = Vec::new();
    for fk in refs {
        let unplanned = !plan.handles(&fk.table, &fk.column);
        let keyed_on_target = fk
            .references_column
            .as_deref()
            .map_or(true, |column| column == target.id_column);
        let blocks = match scope {
            BlockingScope::StillReferenced if keyed_on_target => {
                still_referenced(pool, &fk.table, &fk.column, target.id)
                    .await
                    .unwrap_or(unplanned)
            }
            _ => unplanned,
        };
        if blocks {
            blocking.push(fk.to_string());
        }
    }
    blocking
}

async fn still_referenced(pool: &SqlitePool, table: &str, column: &str, id: i64) -> Option<bool> {
    if !schema::is_plain_identifier(table) || !schema::is_plain_identifier(column) {
        return None;
    }
    let sql = format!(
        "SELECT EXISTS (SELECT 1 FROM {} WHERE {} = ?)",
        schema::quote_ident(table),
        schema::quote_ident(column)
    );
    match sqlx::query_scalar::<_, i64>(&sql).bind(id).fetch_one(pool).await {
        Ok(found) => Some(found != 0),
        Err(err) => {
            tracing::warn!(
                target: "ticketdesk",
                event = "cascade_blocking_lookup_failed",
                table = %table,
                error = %err
            );
            None
        }
    }
}

/// Attaches blocking relationships to foreign-key failures.
pub(crate) async fn explain_failure(
    pool: &SqlitePool,
    plan: &CascadePlan,
    index: usize,
    target: &CascadeTarget,
    err: sqlx::Error,
    scope: BlockingScope,
) -> CascadeError {
    let Some(step) = plan.steps.get(index) else {
        return CascadeError::from_store(err);
    };
    let failure = CascadeError::from_step_failure(index, step, target, err);
    if matches!(failure, CascadeError::ForeignKeyConstraint { .. }) {
        let blocking = blocking_relationships(pool, plan, step, target, scope).await;
        failure.with_blocking(blocking)
    } else {
        failure
    }
}
