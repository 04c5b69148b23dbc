#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::{Duration, Instant};

use anyhow::Result;
use proptest::prelude::*;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection, Executor};
use ticketdesk_lib::history::{FieldChange, HistoryWrite, RetryPolicy};
use ticketdesk_lib::{migrate, HistoryLogger};

#[path = "util.rs"]
mod util;

#[tokio::test]
async fn records_a_change_with_actor_and_timestamp() -> Result<()> {
    let pool = util::seeded_pool().await;
    let logger = HistoryLogger::new(pool.clone());

    let write = logger
        .log_change(43, "status", Some("closed"), Some(" open "), Some(8))
        .await?;
    assert_eq!(write, HistoryWrite::Recorded);

    let entries = logger.entries(43).await?;
    let last = entries.last().expect("entry recorded");
    assert_eq!(entries.len(), 2);
    assert_eq!(last.field_name, "status");
    assert_eq!(last.old_value, "closed");
    assert_eq!(last.new_value, "open");
    assert_eq!(last.changed_by, Some(8));
    assert!(last.changed_at > 0);
    assert!(last.changed_at_utc().is_some());
    Ok(())
}

#[tokio::test]
async fn equal_values_after_trimming_write_nothing() -> Result<()> {
    let pool = util::seeded_pool().await;
    let logger = HistoryLogger::new(pool.clone());
    let before = util::count_all(&pool, "history").await;

    let cases: [(Option<&str>, Option<&str>); 4] = [
        (Some("open"), Some(" open ")),
        (None, Some("")),
        (None, Some("   ")),
        (None, None),
    ];
    for (old, new) in cases {
        let write = logger.log_change(42, "title", old, new, Some(7)).await?;
        assert_eq!(write, HistoryWrite::Unchanged, "{old:?} -> {new:?}");
    }
    assert_eq!(util::count_all(&pool, "history").await, before);
    Ok(())
}

#[tokio::test]
async fn blank_field_name_is_rejected() -> Result<()> {
    let pool = util::seeded_pool().await;
    let logger = HistoryLogger::new(pool);
    let err = logger
        .log_change(42, "  ", Some("a"), Some("b"), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "HISTORY/FIELD_REQUIRED");
    Ok(())
}

#[tokio::test]
async fn log_changes_records_only_real_changes() -> Result<()> {
    let pool = util::seeded_pool().await;
    let logger = HistoryLogger::new(pool.clone());
    let changes = [
        FieldChange::new("title", Some("Printer on fire"), Some("Printer fixed")),
        FieldChange::new("description", None, Some("")),
        FieldChange::new("status", Some("open"), Some("closed")),
    ];

    let writes = logger.log_changes(42, &changes, Some(7)).await?;
    assert_eq!(
        writes,
        vec![
            HistoryWrite::Recorded,
            HistoryWrite::Unchanged,
            HistoryWrite::Recorded
        ]
    );
    assert_eq!(util::count_where(&pool, "history", "ticket_id", 42).await, 3);
    Ok(())
}

#[tokio::test]
async fn non_lock_failures_are_not_retried() -> Result<()> {
    let pool = util::seeded_pool().await;
    let logger = HistoryLogger::new(pool);

    let started = Instant::now();
    let err = logger
        .log_change(999, "status", Some("open"), Some("closed"), None)
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(err.context().get("class"), Some(&"foreign_key".to_string()));
    assert_eq!(err.context().get("ticket_id"), Some(&"999".to_string()));
    Ok(())
}

#[tokio::test]
async fn lock_contention_gives_up_after_three_attempts() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("desk.sqlite3");
    let pool = util::file_pool(&path, Duration::ZERO).await;
    migrate::apply_migrations(&pool).await?;
    util::seed_desk(&pool).await;

    let mut locker = SqliteConnectOptions::new().filename(&path).connect().await?;
    locker.execute("BEGIN IMMEDIATE").await?;

    let logger = HistoryLogger::new(pool.clone());
    let started = Instant::now();
    let err = logger
        .log_change(42, "status", Some("open"), Some("closed"), Some(7))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.code(), "HISTORY/LOCK_TIMEOUT");
    assert_eq!(err.context().get("attempts"), Some(&"3".to_string()));
    assert!(elapsed >= Duration::from_millis(1000), "elapsed {elapsed:?}");
    let cause = err.cause().expect("store error kept as cause");
    assert_eq!(cause.context().get("class"), Some(&"lock_timeout".to_string()));

    locker.execute("ROLLBACK").await?;
    locker.close().await?;
    assert_eq!(util::count_where(&pool, "history", "ticket_id", 42).await, 1);
    Ok(())
}

#[tokio::test]
async fn lock_released_between_attempts_is_recorded() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("desk.sqlite3");
    let pool = util::file_pool(&path, Duration::ZERO).await;
    migrate::apply_migrations(&pool).await?;
    util::seed_desk(&pool).await;

    let mut locker = SqliteConnectOptions::new().filename(&path).connect().await?;
    locker.execute("BEGIN IMMEDIATE").await?;
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        locker.execute("ROLLBACK").await.unwrap();
        locker.close().await.unwrap();
    });

    let logger = HistoryLogger::with_policy(
        pool.clone(),
        RetryPolicy {
            max_attempts: 3,
            pause: Duration::from_millis(300),
        },
    );
    let write = logger
        .log_change(42, "status", Some("open"), Some("closed"), Some(7))
        .await?;
    assert_eq!(write, HistoryWrite::Recorded);
    release.await?;
    assert_eq!(util::count_where(&pool, "history", "ticket_id", 42).await, 2);
    Ok(())
}

fn padded(value: &str, left: usize, right: usize) -> String {
    format!("{}{}{}", " ".repeat(left), value, "\t".repeat(right))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn values_equal_after_trimming_never_write(
        value in "[a-zA-Z0-9 ]{0,12}",
        left in 0usize..3,
        right in 0usize..3,
        absent_old in any::<bool>(),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let pool = util::seeded_pool().await;
            let logger = HistoryLogger::new(pool.clone());
            let before = util::count_all(&pool, "history").await;

            let trimmed = value.trim().to_string();
            let old = if absent_old && trimmed.is_empty() { None } else { Some(trimmed) };
            let new = padded(&value, left, right);
            let write = logger
                .log_change(42, "title", old.as_deref(), Some(&new), None)
                .await
                .unwrap();

            prop_assert_eq!(write, HistoryWrite::Unchanged);
            prop_assert_eq!(util::count_all(&pool, "history").await, before);
            Ok(())
        })?;
    }
}
