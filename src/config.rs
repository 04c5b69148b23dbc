//! Runtime configuration read from `TICKETDESK_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context};

use crate::history::RetryPolicy;
use crate::logging::DEFAULT_FILTER;

pub const DATA_DIR_VAR: &str = "TICKETDESK_DATA_DIR";
pub const DB_VAR: &str = "TICKETDESK_DB";
pub const SESSION_FILE_VAR: &str = "TICKETDESK_SESSION_FILE";
pub const LOG_VAR: &str = "TICKETDESK_LOG";
pub const LOG_DIR_VAR: &str = "TICKETDESK_LOG_DIR";
pub const HISTORY_ATTEMPTS_VAR: &str = "TICKETDESK_HISTORY_ATTEMPTS";
pub const HISTORY_PAUSE_MS_VAR: &str = "TICKETDESK_HISTORY_PAUSE_MS";

pub const DB_FILE_NAME: &str = "ticketdesk.sqlite3";
pub const SESSION_FILE_NAME: &str = "session.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    pub session_path: PathBuf,
    pub log_filter: String,
    pub log_dir: Option<PathBuf>,
    pub history_retry: RetryPolicy,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let data_dir = match get(DATA_DIR_VAR) {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir()?,
        };
        let database_path = get(DB_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join(DB_FILE_NAME));
        let session_path = get(SESSION_FILE_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join(SESSION_FILE_NAME));
        let log_filter = get(LOG_VAR).unwrap_or_else(|| DEFAULT_FILTER.to_string());
        let log_dir = get(LOG_DIR_VAR).map(PathBuf::from);

        let mut history_retry = RetryPolicy::default();
        if let Some(raw) = get(HISTORY_ATTEMPTS_VAR) {
            history_retry.max_attempts = raw.trim().parse().with_context(|| {
                format!("{HISTORY_ATTEMPTS_VAR} must be a whole number, got `{raw}`")
            })?;
        }
        if let Some(raw) = get(HISTORY_PAUSE_MS_VAR) {
            let millis: u64 = raw.trim().parse().with_context(|| {
                format!("{HISTORY_PAUSE_MS_VAR} must be milliseconds, got `{raw}`")
            })?;
            history_retry.pause = Duration::from_millis(millis);
        }

        Ok(Self {
            data_dir,
            database_path,
            session_path,
            log_filter,
            log_dir,
            history_retry,
        })
    }
}

fn default_data_dir() -> anyhow::Result<PathBuf> {
    let base = match dirs::data_dir() {
        Some(dir) => dir,
        None => std::env::current_dir()
            .map_err(|err| anyhow!("no data directory available: {err}"))?,
    };
    Ok(base.join("ticketdesk"))
}
