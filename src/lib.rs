//! Ticket desk core: cascading deletion, change history and relation links
//! over a SQLite store.

pub mod cascade;
pub mod config;
pub mod db;
pub mod entity;
pub mod error;
pub mod history;
pub mod links;
pub mod logging;
pub mod migrate;
pub mod session;

pub use cascade::{
    execute_atomic_cascade, run_atomic_cascade, CascadeError, CascadeOutcome, CascadePlan,
    CascadeProgress, CascadeReport, CascadeStep, CascadeTarget, StepReport, StepwiseCascade,
    StepwiseState,
};
pub use config::Config;
pub use entity::EntityType;
pub use error::{AppError, AppResult};
pub use history::{FieldChange, HistoryEntry, HistoryLogger, HistoryWrite, RetryPolicy};
pub use links::{
    ensure_ticket_category_link, ensure_ticket_employee_link, ensure_ticket_links, LinkKind,
    LinkOutcome, LinkResult,
};
pub use session::{JsonFileSessionStore, MemorySessionStore, SessionHandle, SessionStore};
