//! Idempotent ticket relation links.
//!
//! Links to employees and categories are created on demand. Linking twice is
//! a no-op, and a link to a missing employee or category is skipped.

use futures::FutureExt;
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::db::run_in_tx;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    Employee,
    Category,
}

impl LinkKind {
    fn link_table(self) -> &'static str {
        match self {
            LinkKind::Employee => "ticket_employee",
            LinkKind::Category => "ticket_category",
        }
    }

    fn link_column(self) -> &'static str {
        match self {
            LinkKind::Employee => "employee_id",
            LinkKind::Category => "category_id",
        }
    }

    fn referenced_table(self) -> &'static str {
        match self {
            LinkKind::Employee => "employee",
            LinkKind::Category => "category",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LinkOutcome {
    Linked,
    AlreadyLinked,
    /// The referenced row does not exist; nothing was written.
    Skipped { missing: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkResult {
    pub kind: LinkKind,
    pub id: i64,
    #[serde(flatten)]
    pub outcome: LinkOutcome,
}

pub async fn ensure_ticket_employee_link(
    pool: &SqlitePool,
    ticket_id: i64,
    employee_id: i64,
) -> AppResult<LinkOutcome> {
    let mut conn = pool.acquire().await?;
    ensure_link(&mut conn, LinkKind::Employee, ticket_id, employee_id).await
}

pub async fn ensure_ticket_category_link(
    pool: &SqlitePool,
    ticket_id: i64,
    category_id: i64,
) -> AppResult<LinkOutcome> {
    let mut conn = pool.acquire().await?;
    ensure_link(&mut conn, LinkKind::Category, ticket_id, category_id).await
}

/// Ensures every requested link for one ticket inside a single transaction.
pub async fn ensure_ticket_links(
    pool: &SqlitePool,
    ticket_id: i64,
    employee_ids: &[i64],
    category_ids: &[i64],
) -> AppResult<Vec<LinkResult>> {
    let requested: Vec<(LinkKind, i64)> = employee_ids
        .iter()
        .map(|id| (LinkKind::Employee, *id))
        .chain(category_ids.iter().map(|id| (LinkKind::Category, *id)))
        .collect();
    run_in_tx(pool, move |tx| {
        async move {
            let mut results = Vec::with_capacity(requested.len());
            for (kind, id) in requested {
                let outcome = ensure_link(&mut **tx, kind, ticket_id, id).await?;
                results.push(LinkResult { kind, id, outcome });
            }
            Ok::<_, AppError>(results)
        }
        .boxed()
    })
    .await
}

async fn ensure_link(
    conn: &mut SqliteConnection,
    kind: LinkKind,
    ticket_id: i64,
    other_id: i64,
) -> AppResult<LinkOutcome> {
    let table = kind.link_table();
    let column = kind.link_column();
    let referenced = kind.referenced_table();
    let sql = format!(
        "INSERT INTO {table} (ticket_id, {column}) \
         SELECT ?1, ?2 \
         WHERE EXISTS (SELECT 1 FROM ticket WHERE id = ?1) \
           AND EXISTS (SELECT 1 FROM {referenced} WHERE id = ?2) \
         ON CONFLICT (ticket_id, {column}) DO NOTHING"
    );
    let inserted = sqlx::query(&sql)
        .bind(ticket_id)
        .bind(other_id)
        .execute(&mut *conn)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "ensure_link")
                .with_context("table", table)
        })?
        .rows_affected();

    if inserted > 0 {
        info!(
            target: "ticketdesk",
            event = "ticket_link_created",
            table,
            ticket_id,
            id = other_id
        );
        return Ok(LinkOutcome::Linked);
    }

    let probe = format!(
        "SELECT EXISTS (SELECT 1 FROM ticket WHERE id = ?1), \
                EXISTS (SELECT 1 FROM {referenced} WHERE id = ?2)"
    );
    let (ticket_exists, other_exists): (bool, bool) = sqlx::query_as(&probe)
        .bind(ticket_id)
        .bind(other_id)
        .fetch_one(&mut *conn)
        .await?;

    if !ticket_exists {
        return Err(AppError::new("LINK/TICKET_NOT_FOUND", "Ticket not found")
            .with_context("ticket_id", ticket_id.to_string())
            .with_context("table", table));
    }
    if !other_exists {
        debug!(
            target: "ticketdesk",
            event = "ticket_link_skipped",
            table,
            ticket_id,
            missing = referenced,
            id = other_id
        );
        return Ok(LinkOutcome::Skipped {
            missing: referenced,
        });
    }
    debug!(
        target: "ticketdesk",
        event = "ticket_link_exists",
        table,
        ticket_id,
        id = other_id
    );
    Ok(LinkOutcome::AlreadyLinked)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_result_serializes_flat() {
        let result = LinkResult {
            kind: LinkKind::Category,
            id: 9,
            outcome: LinkOutcome::Skipped {
                missing: "category",
            },
        };
        let value = serde_json::to_value(result).unwrap();
        assert_eq!(value["kind"], "category");
        assert_eq!(value["outcome"], "skipped");
        assert_eq!(value["missing"], "category");
    }
}
