use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use sqlx::SqlitePool;

use ticketdesk_lib::cascade::{plan_for_table, registered_plans, CascadePlan};
use ticketdesk_lib::history::FieldChange;
use ticketdesk_lib::{
    db, ensure_ticket_category_link, ensure_ticket_employee_link, logging, migrate,
    run_atomic_cascade, AppError, CascadeTarget, Config, HistoryLogger, SessionHandle,
    StepwiseCascade,
};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("TICKETDESK_GIT_HASH"),
    ")"
);

#[derive(Parser)]
#[command(
    name = "ticketdesk",
    about = "Ticket desk maintenance tool",
    version,
    long_version = LONG_VERSION
)]
struct Cli {
    /// Database file (overrides TICKETDESK_DB)
    #[arg(long, value_name = "PATH", global = true)]
    db: Option<PathBuf>,

    /// Session state file for interactive deletion (overrides TICKETDESK_SESSION_FILE)
    #[arg(long, value_name = "PATH", global = true)]
    session_file: Option<PathBuf>,

    /// Session id that owns interactive deletion progress
    #[arg(long, value_name = "ID", global = true, default_value = "cli")]
    session: String,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Database maintenance
    #[command(subcommand)]
    Db(DbCmd),
    /// Show the cascade plan for a table, or every registered plan
    Plan { table: Option<String> },
    /// Delete a row and its dependents in one transaction
    Delete {
        table: String,
        id: i64,
        #[arg(long, default_value = "id")]
        id_column: String,
    },
    /// Interactive deletion, one confirmed step at a time
    #[command(subcommand)]
    Step(StepCmd),
    /// Ticket change history
    #[command(subcommand)]
    History(HistoryCmd),
    /// Ticket relation links
    #[command(subcommand)]
    Link(LinkCmd),
}

#[derive(Subcommand)]
enum DbCmd {
    /// Apply pending migrations
    Migrate,
}

#[derive(Subcommand)]
enum StepCmd {
    /// Start an interactive deletion, replacing any pending one
    Begin {
        table: String,
        id: i64,
        #[arg(long, default_value = "id")]
        id_column: String,
    },
    /// Run the current step
    Confirm,
    /// Move past the current step without running it
    Skip,
    /// Abandon the deletion; confirmed steps stay applied
    Cancel,
    /// Show the saved progress
    Status,
}

#[derive(Subcommand)]
enum HistoryCmd {
    /// Record a field change on a ticket
    Log {
        ticket: i64,
        field: String,
        #[arg(long)]
        old: Option<String>,
        #[arg(long)]
        new: Option<String>,
        /// Employee id making the change
        #[arg(long)]
        actor: Option<i64>,
    },
    /// List recorded changes for a ticket
    List { ticket: i64 },
}

#[derive(Subcommand)]
enum LinkCmd {
    /// Link an employee to a ticket
    Employee { ticket: i64, employee: i64 },
    /// Link a category to a ticket
    Category { ticket: i64, category: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    let _log_guard = logging::init(&config.log_filter, config.log_dir.as_deref())?;

    let db_path = cli.db.clone().unwrap_or_else(|| config.database_path.clone());
    let pool = db::open_sqlite_pool(&db_path).await?;
    let applied = migrate::apply_migrations(&pool)
        .await
        .with_context(|| format!("migrate {}", db_path.display()))?;

    let result = run(&cli, &config, &pool, &applied).await;
    pool.close().await;
    result
}

async fn run(cli: &Cli, config: &Config, pool: &SqlitePool, applied: &[&str]) -> Result<()> {
    match &cli.cmd {
        Cmd::Db(DbCmd::Migrate) => {
            let known: Vec<&str> = migrate::migration_names().collect();
            print_json(&json!({ "applied": applied, "migrations": known }))
        }
        Cmd::Plan { table } => match table {
            Some(table) => print_json(&plan_view(table, plan_for_table(table))),
            None => {
                let plans: Vec<_> = registered_plans()
                    .filter_map(|plan| plan.entity.map(|entity| plan_view(entity.table(), plan)))
                    .collect();
                print_json(&plans)
            }
        },
        Cmd::Delete {
            table,
            id,
            id_column,
        } => {
            let outcome = run_atomic_cascade(pool, table, id_column, *id).await;
            print_json(&outcome)?;
            if !outcome.success {
                bail!("cascade delete of {table} {id} failed");
            }
            Ok(())
        }
        Cmd::Step(step) => {
            let session_path = cli
                .session_file
                .clone()
                .unwrap_or_else(|| config.session_path.clone());
            let session = SessionHandle::json_file(session_path, cli.session.clone())?;
            let cascade = StepwiseCascade::new(pool, &session);
            let state = match step {
                StepCmd::Begin {
                    table,
                    id,
                    id_column,
                } => {
                    cascade
                        .begin(CascadeTarget::new(table.as_str(), id_column.as_str(), *id))
                        .await
                }
                StepCmd::Confirm => cascade.confirm_step().await,
                StepCmd::Skip => cascade.skip_step(),
                StepCmd::Cancel => cascade.cancel_all(),
                StepCmd::Status => cascade.state(),
            };
            report(state.map_err(AppError::from))
        }
        Cmd::History(HistoryCmd::Log {
            ticket,
            field,
            old,
            new,
            actor,
        }) => {
            let logger = HistoryLogger::with_policy(pool.clone(), config.history_retry);
            let change = FieldChange::new(field.as_str(), old.as_deref(), new.as_deref());
            let writes = logger.log_changes(*ticket, &[change], *actor).await;
            report(writes.map(|writes| json!({ "ticket_id": ticket, "writes": writes })))
        }
        Cmd::History(HistoryCmd::List { ticket }) => {
            let logger = HistoryLogger::with_policy(pool.clone(), config.history_retry);
            let entries = logger.entries(*ticket).await.map(|entries| {
                entries
                    .iter()
                    .map(|entry| {
                        json!({
                            "id": entry.id,
                            "field_name": entry.field_name,
                            "old_value": entry.old_value,
                            "new_value": entry.new_value,
                            "changed_by": entry.changed_by,
                            "changed_at": entry.changed_at_utc().map(|at| at.to_rfc3339()),
                        })
                    })
                    .collect::<Vec<_>>()
            });
            report(entries)
        }
        Cmd::Link(LinkCmd::Employee { ticket, employee }) => {
            report(ensure_ticket_employee_link(pool, *ticket, *employee).await)
        }
        Cmd::Link(LinkCmd::Category { ticket, category }) => {
            report(ensure_ticket_category_link(pool, *ticket, *category).await)
        }
    }
}

fn plan_view(table: &str, plan: CascadePlan) -> serde_json::Value {
    json!({
        "table": table,
        "registered": plan.entity.is_some(),
        "steps": plan.steps,
    })
}

/// Prints the value, or the error as `{"error": ...}`, and fails on error.
fn report<T: Serialize>(result: Result<T, AppError>) -> Result<()> {
    match result {
        Ok(value) => print_json(&value),
        Err(err) => {
            print_json(&json!({ "error": err }))?;
            Err(err.into())
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{text}");
    Ok(())
}
