use futures::FutureExt;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use super::plan::check_plan_schema;
use super::{apply_step, explain_failure, BlockingScope, CascadeError, CascadeTarget};
use crate::db::{count_rows, run_in_tx};
use crate::AppError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub description: String,
    pub rows_affected: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CascadeReport {
    pub target: CascadeTarget,
    pub steps: Vec<StepReport>,
}

/// Result shape handed to callers that want a flat success flag rather than a
/// `Result`.
#[derive(Debug, Clone, Serialize)]
pub struct CascadeOutcome {
    pub success: bool,
    pub target: CascadeTarget,
    /// Rows left in the target table afterwards, when it could be counted.
    pub updated_row_count: Option<i64>,
    pub steps: Vec<StepReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AppError>,
}

enum StepFailure {
    Step { index: usize, source: sqlx::Error },
    Store(sqlx::Error),
}

impl From<sqlx::Error> for StepFailure {
    fn from(err: sqlx::Error) -> Self {
        StepFailure::Store(err)
    }
}

/// Runs every step of the target's plan inside one transaction. Either all
/// steps commit or none of them do.
pub async fn execute_atomic_cascade(
    pool: &SqlitePool,
    target: &CascadeTarget,
) -> Result<CascadeReport, CascadeError> {
    let plan = target.plan();
    {
        let mut conn = pool.acquire().await.map_err(CascadeError::from_store)?;
        check_plan_schema(&mut conn, &plan, target).await?;
    }

    info!(
        target: "ticketdesk",
        event = "cascade_atomic_start",
        table = %target.table,
        id = target.id,
        steps = plan.len()
    );

    let owned = target.clone();
    let result = run_in_tx(pool, move |tx| {
        async move {
            let mut reports = Vec::with_capacity(plan.len());
            for (index, step) in plan.steps.iter().enumerate() {
                let rows_affected = apply_step(&mut **tx, step, &owned)
                    .await
                    .map_err(|source| StepFailure::Step { index, source })?;
                debug!(
                    target: "ticketdesk",
                    event = "cascade_step_applied",
                    table = %owned.table,
                    id = owned.id,
                    step = index + 1,
                    rows_affected
                );
                reports.push(StepReport {
                    index,
                    description: step.describe(&owned),
                    rows_affected,
                });
            }
            Ok::<_, StepFailure>(reports)
        }
        .boxed()
    })
    .await;

    match result {
        Ok(steps) => {
            info!(
                target: "ticketdesk",
                event = "cascade_atomic_committed",
                table = %target.table,
                id = target.id
            );
            Ok(CascadeReport {
                target: target.clone(),
                steps,
            })
        }
        Err(failure) => {
            let err = match failure {
                StepFailure::Step { index, source } => {
                    let scope = BlockingScope::Unplanned;
                    explain_failure(pool, &plan, index, target, source, scope).await
                }
                StepFailure::Store(source) => CascadeError::from_store(source),
            };
            warn!(
                target: "ticketdesk",
                event = "cascade_atomic_rolled_back",
                table = %target.table,
                id = target.id,
                code = err.code(),
                error = %err
            );
            Err(err)
        }
    }
}

/// Deletes `table.id_column = id` with its dependents and reports the outcome
/// without returning an error.
pub async fn run_atomic_cascade(
    pool: &SqlitePool,
    table: &str,
    id_column: &str,
    id: i64,
) -> CascadeOutcome {
    let target = CascadeTarget::new(table, id_column, id);
    let result = execute_atomic_cascade(pool, &target).await;
    let updated_row_count = remaining_rows(pool, &target).await;
    match result {
        Ok(report) => CascadeOutcome {
            success: true,
            target,
            updated_row_count,
            steps: report.steps,
            error: None,
        },
        Err(err) => CascadeOutcome {
            success: false,
            target,
            updated_row_count,
            steps: Vec::new(),
            error: Some(err.into()),
        },
    }
}

async fn remaining_rows(pool: &SqlitePool, target: &CascadeTarget) -> Option<i64> {
    if !crate::db::schema::is_plain_identifier(&target.table) {
        return None;
    }
    match count_rows(pool, &target.table).await {
        Ok(count) => Some(count),
        Err(err) => {
            debug!(
                target: "ticketdesk",
                event = "cascade_row_count_unavailable",
                table = %target.table,
                error = %err
            );
            None
        }
    }
}
