use std::collections::HashMap;

use serde::Serialize;
use sqlx::SqliteConnection;
use thiserror::Error;

use super::{CascadeError, CascadeTarget};
use crate::db::schema::{self, quote_ident};
use crate::entity::EntityType;

/// One ordered action in a cascade plan. Dependent steps are keyed by the
/// foreign-key column holding the target id. [`CascadeStep::DeleteSelf`]
/// removes the target row itself and always runs last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CascadeStep {
    DeleteRows {
        table: &'static str,
        foreign_key_column: &'static str,
    },
    NullifyColumn {
        table: &'static str,
        column: &'static str,
        foreign_key_column: &'static str,
    },
    DeleteSelf,
}

impl CascadeStep {
    pub fn table<'a>(&self, target: &'a CascadeTarget) -> &'a str {
        match *self {
            CascadeStep::DeleteRows { table, .. } | CascadeStep::NullifyColumn { table, .. } => {
                table
            }
            CascadeStep::DeleteSelf => target.table.as_str(),
        }
    }

    /// Columns the step reads or writes on its table.
    fn columns<'a>(&self, target: &'a CascadeTarget) -> Vec<&'a str> {
        match *self {
            CascadeStep::DeleteRows {
                foreign_key_column, ..
            } => vec![foreign_key_column],
            CascadeStep::NullifyColumn {
                column,
                foreign_key_column,
                ..
            } => {
                if column == foreign_key_column {
                    vec![column]
                } else {
                    vec![column, foreign_key_column]
                }
            }
            CascadeStep::DeleteSelf => vec![target.id_column.as_str()],
        }
    }

    pub fn describe(&self, target: &CascadeTarget) -> String {
        match self {
            CascadeStep::DeleteRows {
                table,
                foreign_key_column,
            } => format!(
                "Delete rows from {table} where {foreign_key_column} = {}",
                target.id
            ),
            CascadeStep::NullifyColumn {
                table,
                column,
                foreign_key_column,
            } => format!(
                "Set {table}.{column} to NULL where {foreign_key_column} = {}",
                target.id
            ),
            CascadeStep::DeleteSelf => format!(
                "Delete the {} row where {} = {}",
                target.table, target.id_column, target.id
            ),
        }
    }

    /// Parameterised statement for this step; the target id binds as `?`.
    pub(crate) fn statement(&self, target: &CascadeTarget) -> String {
        match self {
            CascadeStep::DeleteRows {
                table,
                foreign_key_column,
            } => format!(
                "DELETE FROM {} WHERE {} = ?",
                quote_ident(table),
                quote_ident(foreign_key_column)
            ),
            CascadeStep::NullifyColumn {
                table,
                column,
                foreign_key_column,
            } => format!(
                "UPDATE {} SET {} = NULL WHERE {} = ?",
                quote_ident(table),
                quote_ident(column),
                quote_ident(foreign_key_column)
            ),
            CascadeStep::DeleteSelf => format!(
                "DELETE FROM {} WHERE {} = ?",
                quote_ident(&target.table),
                quote_ident(&target.id_column)
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("plan has no steps")]
    Empty,
    #[error("plan does not end by deleting the target row")]
    MissingDeleteSelf,
    #[error("step {} deletes the target row before later steps run", .0 + 1)]
    DeleteSelfNotLast(usize),
    #[error("step {} repeats an earlier step", .0 + 1)]
    DuplicateStep(usize),
    #[error("{table}.{column} is nullified and also deleted")]
    NullifiedAndDeleted { table: String, column: String },
}

/// The ordered steps for one entity type. Entity types without a registered
/// plan get the default plan, which only deletes the target row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CascadePlan {
    pub entity: Option<EntityType>,
    pub steps: &'static [CascadeStep],
}

impl CascadePlan {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn is_default(&self) -> bool {
        self.steps == DEFAULT_STEPS
    }

    /// True when a dependent step covers rows of `table` keyed by `column`.
    pub fn handles(&self, table: &str, column: &str) -> bool {
        self.steps.iter().any(|step| match step {
            CascadeStep::DeleteRows {
                table: t,
                foreign_key_column,
            } => *t == table && *foreign_key_column == column,
            CascadeStep::NullifyColumn {
                table: t, column: c, ..
            } => *t == table && *c == column,
            CascadeStep::DeleteSelf => false,
        })
    }

    pub fn descriptions(&self, target: &CascadeTarget) -> Vec<String> {
        self.steps.iter().map(|step| step.describe(target)).collect()
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        let Some(last) = self.steps.last() else {
            return Err(PlanError::Empty);
        };
        if *last != CascadeStep::DeleteSelf {
            return Err(PlanError::MissingDeleteSelf);
        }
        for (index, step) in self.steps.iter().enumerate() {
            if *step == CascadeStep::DeleteSelf && index + 1 != self.steps.len() {
                return Err(PlanError::DeleteSelfNotLast(index));
            }
            if self.steps[..index].contains(step) {
                return Err(PlanError::DuplicateStep(index));
            }
            if let CascadeStep::NullifyColumn { table, column, .. } = step {
                let deleted = self.steps.iter().any(|other| {
                    matches!(other, CascadeStep::DeleteRows { table: t, .. } if t == table)
                });
                if deleted {
                    return Err(PlanError::NullifiedAndDeleted {
                        table: table.to_string(),
                        column: column.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

const DEFAULT_STEPS: &[CascadeStep] = &[CascadeStep::DeleteSelf];

const TICKET_STEPS: &[CascadeStep] = &[
    CascadeStep::DeleteRows {
        table: "comments",
        foreign_key_column: "ticket_id",
    },
    CascadeStep::DeleteRows {
        table: "history",
        foreign_key_column: "ticket_id",
    },
    CascadeStep::DeleteRows {
        table: "ticket_employee",
        foreign_key_column: "ticket_id",
    },
    CascadeStep::DeleteRows {
        table: "ticket_category",
        foreign_key_column: "ticket_id",
    },
    CascadeStep::DeleteSelf,
];

const EMPLOYEE_STEPS: &[CascadeStep] = &[
    CascadeStep::DeleteRows {
        table: "ticket_employee",
        foreign_key_column: "employee_id",
    },
    CascadeStep::NullifyColumn {
        table: "history",
        column: "changed_by",
        foreign_key_column: "changed_by",
    },
    CascadeStep::NullifyColumn {
        table: "ticket",
        column: "assigned_employee_id",
        foreign_key_column: "assigned_employee_id",
    },
    CascadeStep::NullifyColumn {
        table: "comments",
        column: "employee_id",
        foreign_key_column: "employee_id",
    },
    CascadeStep::DeleteSelf,
];

const CUSTOMER_STEPS: &[CascadeStep] = &[
    CascadeStep::NullifyColumn {
        table: "ticket",
        column: "customer_id",
        foreign_key_column: "customer_id",
    },
    CascadeStep::DeleteSelf,
];

const CATEGORY_STEPS: &[CascadeStep] = &[
    CascadeStep::DeleteRows {
        table: "ticket_category",
        foreign_key_column: "category_id",
    },
    CascadeStep::DeleteSelf,
];

const STATUS_STEPS: &[CascadeStep] = &[
    CascadeStep::NullifyColumn {
        table: "ticket",
        column: "status_id",
        foreign_key_column: "status_id",
    },
    CascadeStep::DeleteSelf,
];

const ROLE_STEPS: &[CascadeStep] = &[
    CascadeStep::NullifyColumn {
        table: "employee",
        column: "role_id",
        foreign_key_column: "role_id",
    },
    CascadeStep::DeleteSelf,
];

const REGISTRY: &[(EntityType, &[CascadeStep])] = &[
    (EntityType::Ticket, TICKET_STEPS),
    (EntityType::Employee, EMPLOYEE_STEPS),
    (EntityType::Customer, CUSTOMER_STEPS),
    (EntityType::Category, CATEGORY_STEPS),
    (EntityType::Status, STATUS_STEPS),
    (EntityType::Role, ROLE_STEPS),
];

pub fn plan_for(entity: EntityType) -> CascadePlan {
    let steps = REGISTRY
        .iter()
        .find(|(registered, _)| *registered == entity)
        .map(|(_, steps)| *steps)
        .unwrap_or(DEFAULT_STEPS);
    CascadePlan {
        entity: Some(entity),
        steps,
    }
}

pub fn plan_for_table(table: &str) -> CascadePlan {
    match EntityType::from_table(table) {
        Some(entity) => plan_for(entity),
        None => CascadePlan {
            entity: None,
            steps: DEFAULT_STEPS,
        },
    }
}

pub fn registered_plans() -> impl Iterator<Item = CascadePlan> {
    REGISTRY.iter().map(|(entity, steps)| CascadePlan {
        entity: Some(*entity),
        steps: *steps,
    })
}

/// Confirms that every table and column `plan` names exists before any
/// statement is built from them.
pub async fn check_plan_schema(
    conn: &mut SqliteConnection,
    plan: &CascadePlan,
    target: &CascadeTarget,
) -> Result<(), CascadeError> {
    let mut known: HashMap<String, Vec<String>> = HashMap::new();
    for step in plan.steps {
        check_step_schema(conn, step, target, &mut known).await?;
    }
    Ok(())
}

pub(crate) async fn check_step_schema(
    conn: &mut SqliteConnection,
    step: &CascadeStep,
    target: &CascadeTarget,
    known: &mut HashMap<String, Vec<String>>,
) -> Result<(), CascadeError> {
    let table = step.table(target);
    if !schema::is_plain_identifier(table) {
        return Err(CascadeError::Schema {
            table: table.to_string(),
            column: None,
        });
    }
    if !known.contains_key(table) {
        let columns = schema::columns(&mut *conn, table)
            .await
            .map_err(CascadeError::from_store)?;
        known.insert(table.to_string(), columns);
    }
    let columns = known.get(table).map(Vec::as_slice).unwrap_or_default();
    if columns.is_empty() {
        return Err(CascadeError::Schema {
            table: table.to_string(),
            column: None,
        });
    }
    for column in step.columns(target) {
        if !columns.iter().any(|c| c == column) {
            return Err(CascadeError::Schema {
                table: table.to_string(),
                column: Some(column.to_string()),
            });
        }
    }
    Ok(())
}
