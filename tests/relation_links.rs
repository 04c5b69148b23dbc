#![allow(clippy::unwrap_used, clippy::expect_used)]

use anyhow::Result;
use ticketdesk_lib::{
    ensure_ticket_category_link, ensure_ticket_employee_link, ensure_ticket_links, LinkKind,
    LinkOutcome,
};

#[path = "util.rs"]
mod util;

async fn link_count(
    pool: &sqlx::SqlitePool,
    table: &str,
    column: &str,
    ticket: i64,
    id: i64,
) -> i64 {
    let sql = format!("SELECT COUNT(*) FROM {table} WHERE ticket_id = ? AND {column} = ?");
    sqlx::query_scalar(&sql)
        .bind(ticket)
        .bind(id)
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn linking_twice_keeps_one_row() -> Result<()> {
    let pool = util::seeded_pool().await;

    let first = ensure_ticket_category_link(&pool, 43, 3).await?;
    let second = ensure_ticket_category_link(&pool, 43, 3).await?;
    assert_eq!(first, LinkOutcome::Linked);
    assert_eq!(second, LinkOutcome::AlreadyLinked);
    assert_eq!(link_count(&pool, "ticket_category", "category_id", 43, 3).await, 1);

    let existing = ensure_ticket_employee_link(&pool, 42, 7).await?;
    assert_eq!(existing, LinkOutcome::AlreadyLinked);
    assert_eq!(link_count(&pool, "ticket_employee", "employee_id", 42, 7).await, 1);
    Ok(())
}

#[tokio::test]
async fn missing_referenced_rows_are_skipped() -> Result<()> {
    let pool = util::seeded_pool().await;

    let category = ensure_ticket_category_link(&pool, 42, 999).await?;
    assert_eq!(category, LinkOutcome::Skipped { missing: "category" });
    let employee = ensure_ticket_employee_link(&pool, 42, 999).await?;
    assert_eq!(employee, LinkOutcome::Skipped { missing: "employee" });

    assert_eq!(util::count_where(&pool, "ticket_category", "category_id", 999).await, 0);
    assert_eq!(util::count_where(&pool, "ticket_employee", "employee_id", 999).await, 0);
    Ok(())
}

#[tokio::test]
async fn missing_ticket_is_an_error() -> Result<()> {
    let pool = util::seeded_pool().await;

    let err = ensure_ticket_employee_link(&pool, 999, 7).await.unwrap_err();
    assert_eq!(err.code(), "LINK/TICKET_NOT_FOUND");
    assert_eq!(err.context().get("ticket_id"), Some(&"999".to_string()));
    assert_eq!(util::count_where(&pool, "ticket_employee", "ticket_id", 999).await, 0);
    Ok(())
}

#[tokio::test]
async fn batch_links_report_each_outcome() -> Result<()> {
    let pool = util::seeded_pool().await;

    let results = ensure_ticket_links(&pool, 43, &[7, 8, 404], &[2, 3]).await?;
    let summary: Vec<(LinkKind, i64, LinkOutcome)> = results
        .iter()
        .map(|result| (result.kind, result.id, result.outcome))
        .collect();
    assert_eq!(
        summary,
        vec![
            (LinkKind::Employee, 7, LinkOutcome::AlreadyLinked),
            (LinkKind::Employee, 8, LinkOutcome::Linked),
            (LinkKind::Employee, 404, LinkOutcome::Skipped { missing: "employee" }),
            (LinkKind::Category, 2, LinkOutcome::AlreadyLinked),
            (LinkKind::Category, 3, LinkOutcome::Linked),
        ]
    );
    assert_eq!(util::count_where(&pool, "ticket_employee", "ticket_id", 43).await, 2);
    assert_eq!(util::count_where(&pool, "ticket_category", "ticket_id", 43).await, 2);
    Ok(())
}

#[tokio::test]
async fn batch_for_missing_ticket_writes_nothing() -> Result<()> {
    let pool = util::seeded_pool().await;
    let before = util::count_all(&pool, "ticket_employee").await;

    let err = ensure_ticket_links(&pool, 999, &[7], &[1]).await.unwrap_err();
    assert_eq!(err.code(), "LINK/TICKET_NOT_FOUND");
    assert_eq!(util::count_all(&pool, "ticket_employee").await, before);
    Ok(())
}
