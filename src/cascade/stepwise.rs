//! Interactive deletion: one confirmed step at a time.
//!
//! Progress lives in the caller's session under fixed keys, so a deletion can
//! be resumed by a later request or process. Each confirmed step commits on
//! its own; earlier steps are never undone by a later failure or a cancel.

use std::collections::HashMap;
use std::str::FromStr;

use futures::FutureExt;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use super::plan::{check_step_schema, CascadePlan};
use super::{apply_step, explain_failure, BlockingScope, CascadeError, CascadeTarget};
use crate::db::run_in_tx;
use crate::session::SessionHandle;

pub const DELETE_STEP_KEY: &str = "deleteStep";
pub const DELETE_STEPS_TOTAL_KEY: &str = "deleteStepsTotal";
pub const DELETE_STEPS_INFO_KEY: &str = "deleteStepsInfo";
pub const DELETE_TABLE_KEY: &str = "deleteTable";
pub const DELETE_ID_COLUMN_KEY: &str = "deleteIdColumn";
pub const DELETE_ID_VALUE_KEY: &str = "deleteIdValue";

const PROGRESS_KEYS: [&str; 6] = [
    DELETE_STEP_KEY,
    DELETE_STEPS_TOTAL_KEY,
    DELETE_STEPS_INFO_KEY,
    DELETE_TABLE_KEY,
    DELETE_ID_COLUMN_KEY,
    DELETE_ID_VALUE_KEY,
];

/// Saved position of an interactive deletion. `step` is the zero-based index
/// of the next step awaiting a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CascadeProgress {
    pub table: String,
    pub id_column: String,
    pub id: i64,
    pub step: usize,
    pub total: usize,
    pub steps_info: Vec<String>,
}

impl CascadeProgress {
    pub fn target(&self) -> CascadeTarget {
        CascadeTarget::new(self.table.clone(), self.id_column.clone(), self.id)
    }

    /// Description of the step awaiting a decision.
    pub fn current_description(&self) -> Option<&str> {
        self.steps_info.get(self.step).map(String::as_str)
    }

    pub fn load(session: &SessionHandle) -> Result<Option<Self>, CascadeError> {
        let Some(table) = session.get(DELETE_TABLE_KEY) else {
            return Ok(None);
        };
        let id_column = required(session, DELETE_ID_COLUMN_KEY)?;
        let id = parsed(session, DELETE_ID_VALUE_KEY)?;
        let step = parsed(session, DELETE_STEP_KEY)?;
        let total = parsed(session, DELETE_STEPS_TOTAL_KEY)?;
        let steps_info = match session.get(DELETE_STEPS_INFO_KEY) {
            Some(raw) => serde_json::from_str(&raw).map_err(|err| {
                CascadeError::Session(format!("{DELETE_STEPS_INFO_KEY} is not valid: {err}"))
            })?,
            None => Vec::new(),
        };
        Ok(Some(Self {
            table,
            id_column,
            id,
            step,
            total,
            steps_info,
        }))
    }

    pub fn save(&self, session: &SessionHandle) -> Result<(), CascadeError> {
        let info = serde_json::to_string(&self.steps_info)
            .map_err(|err| CascadeError::Session(err.to_string()))?;
        session.set(DELETE_TABLE_KEY, &self.table);
        session.set(DELETE_ID_COLUMN_KEY, &self.id_column);
        session.set(DELETE_ID_VALUE_KEY, &self.id.to_string());
        session.set(DELETE_STEP_KEY, &self.step.to_string());
        session.set(DELETE_STEPS_TOTAL_KEY, &self.total.to_string());
        session.set(DELETE_STEPS_INFO_KEY, &info);
        persist(session)
    }

    pub fn clear(session: &SessionHandle) -> Result<(), CascadeError> {
        for key in PROGRESS_KEYS {
            session.remove(key);
        }
        persist(session)
    }
}

fn required(session: &SessionHandle, key: &str) -> Result<String, CascadeError> {
    session
        .get(key)
        .ok_or_else(|| CascadeError::Session(format!("{key} is missing")))
}

fn parsed<T: FromStr>(session: &SessionHandle, key: &str) -> Result<T, CascadeError> {
    let raw = required(session, key)?;
    raw.trim()
        .parse()
        .map_err(|_| CascadeError::Session(format!("{key} holds `{raw}`")))
}

fn persist(session: &SessionHandle) -> Result<(), CascadeError> {
    session
        .persist()
        .map_err(|err| CascadeError::Session(format!("{err:#}")))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StepwiseState {
    Idle,
    AwaitingConfirmation {
        progress: CascadeProgress,
    },
    Completed {
        target: CascadeTarget,
        total_steps: usize,
    },
    Cancelled {
        target: CascadeTarget,
        steps_done: usize,
        total_steps: usize,
    },
}

impl StepwiseState {
    pub fn progress(&self) -> Option<&CascadeProgress> {
        match self {
            StepwiseState::AwaitingConfirmation { progress } => Some(progress),
            _ => None,
        }
    }
}

/// Drives an interactive deletion for one session.
pub struct StepwiseCascade<'a> {
    pool: &'a SqlitePool,
    session: &'a SessionHandle,
}

impl<'a> StepwiseCascade<'a> {
    pub fn new(pool: &'a SqlitePool, session: &'a SessionHandle) -> Self {
        Self { pool, session }
    }

    pub fn state(&self) -> Result<StepwiseState, CascadeError> {
        Ok(match CascadeProgress::load(self.session)? {
            Some(progress) => StepwiseState::AwaitingConfirmation { progress },
            None => StepwiseState::Idle,
        })
    }

    /// Starts an interactive deletion of `target`, replacing any pending one.
    pub async fn begin(&self, target: CascadeTarget) -> Result<StepwiseState, CascadeError> {
        let plan = target.plan();
        {
            let mut conn = self
                .pool
                .acquire()
                .await
                .map_err(CascadeError::from_store)?;
            super::check_plan_schema(&mut conn, &plan, &target).await?;
        }

        match CascadeProgress::load(self.session) {
            Ok(Some(previous)) => warn!(
                target: "ticketdesk",
                event = "cascade_stepwise_replaced",
                session = %self.session.session_id(),
                table = %previous.table,
                id = previous.id,
                step = previous.step + 1,
                total = previous.total
            ),
            Ok(None) => {}
            Err(err) => warn!(
                target: "ticketdesk",
                event = "cascade_stepwise_replaced",
                session = %self.session.session_id(),
                error = %err
            ),
        }

        let progress = CascadeProgress {
            table: target.table.clone(),
            id_column: target.id_column.clone(),
            id: target.id,
            step: 0,
            total: plan.len(),
            steps_info: plan.descriptions(&target),
        };
        progress.save(self.session)?;
        info!(
            target: "ticketdesk",
            event = "cascade_stepwise_begin",
            session = %self.session.session_id(),
            table = %target.table,
            id = target.id,
            total = progress.total
        );
        Ok(StepwiseState::AwaitingConfirmation { progress })
    }

    /// Executes the current step in its own transaction. A failed step leaves
    /// the position unchanged.
    pub async fn confirm_step(&self) -> Result<StepwiseState, CascadeError> {
        let (progress, plan) = self.load_active()?;
        let index = progress.step;
        let step = plan.steps[index];
        let target = progress.target();
        {
            let mut conn = self
                .pool
                .acquire()
                .await
                .map_err(CascadeError::from_store)?;
            check_step_schema(&mut conn, &step, &target, &mut HashMap::new()).await?;
        }

        let owned = target.clone();
        let result = run_in_tx(self.pool, move |tx| {
            async move { apply_step(&mut **tx, &step, &owned).await }.boxed()
        })
        .await;

        match result {
            Ok(rows_affected) => {
                info!(
                    target: "ticketdesk",
                    event = "cascade_step_confirmed",
                    session = %self.session.session_id(),
                    table = %target.table,
                    id = target.id,
                    step = index + 1,
                    total = progress.total,
                    description = %step.describe(&target),
                    rows_affected
                );
                self.advance(progress)
            }
            Err(source) => {
                let err = explain_failure(
                    self.pool,
                    &plan,
                    index,
                    &target,
                    source,
                    BlockingScope::StillReferenced,
                )
                .await;
                warn!(
                    target: "ticketdesk",
                    event = "cascade_step_failed",
                    session = %self.session.session_id(),
                    table = %target.table,
                    id = target.id,
                    step = index + 1,
                    description = %step.describe(&target),
                    steps_already_applied = index,
                    code = err.code(),
                    error = %err
                );
                Err(err)
            }
        }
    }

    /// Moves past the current step without running it.
    pub fn skip_step(&self) -> Result<StepwiseState, CascadeError> {
        let (progress, _) = self.load_active()?;
        info!(
            target: "ticketdesk",
            event = "cascade_step_skipped",
            session = %self.session.session_id(),
            table = %progress.table,
            id = progress.id,
            step = progress.step + 1,
            total = progress.total,
            description = progress.current_description().unwrap_or_default()
        );
        self.advance(progress)
    }

    /// Abandons the deletion. Steps already confirmed stay applied. Progress
    /// that can no longer be read is discarded and reported as idle.
    pub fn cancel_all(&self) -> Result<StepwiseState, CascadeError> {
        let progress = match CascadeProgress::load(self.session) {
            Ok(Some(progress)) => progress,
            Ok(None) => return Err(CascadeError::NoActiveCascade),
            Err(CascadeError::Session(reason)) => {
                CascadeProgress::clear(self.session)?;
                warn!(
                    target: "ticketdesk",
                    event = "cascade_stepwise_discarded",
                    session = %self.session.session_id(),
                    reason = %reason
                );
                return Ok(StepwiseState::Idle);
            }
            Err(err) => return Err(err),
        };
        CascadeProgress::clear(self.session)?;
        info!(
            target: "ticketdesk",
            event = "cascade_stepwise_cancelled",
            session = %self.session.session_id(),
            table = %progress.table,
            id = progress.id,
            steps_done = progress.step,
            total = progress.total
        );
        Ok(StepwiseState::Cancelled {
            target: progress.target(),
            steps_done: progress.step,
            total_steps: progress.total,
        })
    }

    fn load_active(&self) -> Result<(CascadeProgress, CascadePlan), CascadeError> {
        let progress = CascadeProgress::load(self.session)?
            .ok_or(CascadeError::NoActiveCascade)?;
        let plan = progress.target().plan();
        if plan.len() != progress.total || progress.step >= progress.total {
            return Err(CascadeError::StaleProgress {
                table: progress.table,
                stored_total: progress.total,
                plan_total: plan.len(),
            });
        }
        Ok((progress, plan))
    }

    fn advance(&self, mut progress: CascadeProgress) -> Result<StepwiseState, CascadeError> {
        progress.step += 1;
        if progress.step >= progress.total {
            CascadeProgress::clear(self.session)?;
            info!(
                target: "ticketdesk",
                event = "cascade_stepwise_completed",
                session = %self.session.session_id(),
                table = %progress.table,
                id = progress.id,
                total = progress.total
            );
            return Ok(StepwiseState::Completed {
                target: progress.target(),
                total_steps: progress.total,
            });
        }
        progress.save(self.session)?;
        Ok(StepwiseState::AwaitingConfirmation { progress })
    }
}
