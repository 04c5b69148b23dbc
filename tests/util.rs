#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

pub async fn temp_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("connect sqlite::memory:");
    sqlx::query("PRAGMA foreign_keys=ON;")
        .execute(&pool)
        .await
        .unwrap();
    pool
}

pub async fn migrated_pool() -> SqlitePool {
    let pool = temp_pool().await;
    ticketdesk_lib::migrate::apply_migrations(&pool)
        .await
        .expect("apply migrations");
    pool
}

/// Migrated pool with the desk fixture loaded.
pub async fn seeded_pool() -> SqlitePool {
    let pool = migrated_pool().await;
    seed_desk(&pool).await;
    pool
}

/// File-backed pool whose connections give up on a lock after `busy_timeout`.
pub async fn file_pool(path: &Path, busy_timeout: Duration) -> SqlitePool {
    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(busy_timeout);
    SqlitePoolOptions::new()
        .max_connections(2)
        .connect_with(opts)
        .await
        .expect("open file pool")
}

/// Two tickets (42 and 43) with comments, history and links, plus the
/// employees, customers, categories, statuses and roles they point at.
pub async fn seed_desk(pool: &SqlitePool) {
    let statements = [
        "INSERT INTO role (id, name) VALUES (1, 'agent'), (2, 'lead')",
        "INSERT INTO status (id, name) VALUES (1, 'open'), (2, 'closed')",
        "INSERT INTO customer (id, name) VALUES (1, 'Acme'), (2, 'Globex')",
        "INSERT INTO employee (id, name, role_id) VALUES (7, 'Ada', 1), (8, 'Grace', 2)",
        "INSERT INTO category (id, name) VALUES (1, 'billing'), (2, 'outage'), (3, 'hardware')",
        "INSERT INTO ticket (id, title, status_id, customer_id, assigned_employee_id) \
         VALUES (42, 'Printer on fire', 1, 1, 7), (43, 'Invoice typo', 2, 2, 8)",
        "INSERT INTO comments (ticket_id, employee_id, body) \
         VALUES (42, 7, 'Looking now'), (42, 8, 'Extinguisher fetched'), (43, 7, 'Fixed')",
        "INSERT INTO history (ticket_id, field_name, old_value, new_value, changed_by) \
         VALUES (42, 'status', 'open', 'closed', 7), (43, 'title', 'Invoice', 'Invoice typo', 8)",
        "INSERT INTO ticket_employee (ticket_id, employee_id) VALUES (42, 7), (42, 8), (43, 7)",
        "INSERT INTO ticket_category (ticket_id, category_id) VALUES (42, 1), (42, 2), (43, 2)",
    ];
    for sql in statements {
        sqlx::query(sql).execute(pool).await.expect(sql);
    }
}

pub async fn count_where(pool: &SqlitePool, table: &str, column: &str, id: i64) -> i64 {
    let sql = format!("SELECT COUNT(*) FROM {table} WHERE {column} = ?");
    sqlx::query_scalar(&sql)
        .bind(id)
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn count_all(pool: &SqlitePool, table: &str) -> i64 {
    let sql = format!("SELECT COUNT(*) FROM {table}");
    sqlx::query_scalar(&sql).fetch_one(pool).await.unwrap()
}
