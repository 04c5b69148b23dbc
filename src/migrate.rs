use sha2::{Digest, Sha256};
use sqlx::{Executor, Row, SqlitePool};
use std::collections::HashMap;

use tracing::{error, info};

fn preview(sql: &str) -> String {
    let one_line = sql.replace(['\n', '\t'], " ");
    let trimmed = one_line.trim();
    if trimmed.chars().count() > 160 {
        let cut: String = trimmed.chars().take(160).collect();
        format!("{cut}…")
    } else {
        trimmed.to_string()
    }
}

static MIGRATIONS: &[(&str, &str)] = &[
    (
        "202510190900_core_tables.sql",
        include_str!("../migrations/202510190900_core_tables.sql"),
    ),
    (
        "202510190910_ticket_relations.sql",
        include_str!("../migrations/202510190910_ticket_relations.sql"),
    ),
];

/// Strips blank lines and `--` comments so the checksum only tracks statements.
fn cleaned(raw_sql: &str) -> String {
    raw_sql
        .lines()
        .filter(|line| {
            let t = line.trim_start();
            !(t.is_empty() || t.starts_with("--"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn migration_names() -> impl Iterator<Item = &'static str> {
    MIGRATIONS.iter().map(|(name, _)| *name)
}

/// Applies every embedded migration not yet recorded and returns the names of
/// the ones applied by this call.
pub async fn apply_migrations(pool: &SqlitePool) -> anyhow::Result<Vec<&'static str>> {
    pool.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (\
           version   TEXT PRIMARY KEY,\
           applied_at INTEGER NOT NULL,\
           checksum TEXT NOT NULL\
         )",
    )
    .await?;

    let rows = sqlx::query("SELECT version, checksum FROM schema_migrations")
        .fetch_all(pool)
        .await?;
    let mut applied: HashMap<String, String> = HashMap::new();
    for r in rows {
        if let (Ok(v), Ok(c)) = (
            r.try_get::<String, _>("version"),
            r.try_get::<String, _>("checksum"),
        ) {
            applied.insert(v, c);
        }
    }

    let mut newly_applied = Vec::new();
    for (filename, raw_sql) in MIGRATIONS {
        let cleaned = cleaned(raw_sql);
        let checksum = format!("{:x}", Sha256::digest(cleaned.as_bytes()));

        if let Some(stored) = applied.get(*filename) {
            if stored != &checksum {
                anyhow::bail!("migration {} edited after application", filename);
            }
            info!(target: "ticketdesk", event = "migration_skip_file", file = %filename);
            continue;
        }

        let mut tx = pool.begin().await?;
        for stmt in cleaned.split(';') {
            let s = stmt.trim();
            if s.is_empty() {
                continue;
            }
            info!(
                target: "ticketdesk",
                event = "migration_stmt",
                file = %filename,
                sql = %preview(s)
            );
            if let Err(e) = sqlx::query(s).execute(&mut *tx).await {
                error!(
                    target: "ticketdesk",
                    event = "migration_stmt_error",
                    file = %filename,
                    sql = %preview(s),
                    error = %e
                );
                return Err(e.into());
            }
        }

        sqlx::query(
            "INSERT INTO schema_migrations (version, applied_at, checksum) \
             VALUES (?, CAST((julianday('now') - 2440587.5) * 86400000.0 AS INTEGER), ?)",
        )
        .bind(*filename)
        .bind(&checksum)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(target: "ticketdesk", event = "migration_file_applied", file = %filename);
        newly_applied.push(*filename);
    }

    Ok(newly_applied)
}
