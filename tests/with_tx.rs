use anyhow::Result;
use futures::FutureExt;
use ticketdesk_lib::db::run_in_tx;

#[path = "util.rs"]
mod util;

#[tokio::test]
async fn commit_happy_path() -> Result<()> {
    let pool = util::temp_pool().await;
    sqlx::query("CREATE TABLE t (val TEXT UNIQUE);")
        .execute(&pool)
        .await?;
    run_in_tx(&pool, |tx| {
        async move {
            sqlx::query("INSERT INTO t (val) VALUES ('ok');")
                .execute(&mut **tx)
                .await?;
            Ok::<_, sqlx::Error>(())
        }
        .boxed()
    })
    .await?;
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM t;")
        .fetch_one(&pool)
        .await?;
    assert_eq!(count, 1);
    Ok(())
}

#[tokio::test]
async fn rollback_on_unique_violation() -> Result<()> {
    let pool = util::temp_pool().await;
    sqlx::query("CREATE TABLE t (val TEXT UNIQUE);")
        .execute(&pool)
        .await?;
    let res = run_in_tx(&pool, |tx| {
        async move {
            sqlx::query("INSERT INTO t (val) VALUES ('dup');")
                .execute(&mut **tx)
                .await?;
            sqlx::query("INSERT INTO t (val) VALUES ('dup');")
                .execute(&mut **tx)
                .await?;
            Ok::<_, sqlx::Error>(())
        }
        .boxed()
    })
    .await;
    assert!(res.is_err());
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM t;")
        .fetch_one(&pool)
        .await?;
    assert_eq!(count, 0);
    Ok(())
}

#[tokio::test]
async fn returns_value_from_closure() -> Result<()> {
    let pool = util::temp_pool().await;
    sqlx::query("CREATE TABLE t (id INTEGER PRIMARY KEY, val TEXT);")
        .execute(&pool)
        .await?;
    let label = String::from("owned");
    let id = run_in_tx(&pool, move |tx| {
        async move {
            let done = sqlx::query("INSERT INTO t (val) VALUES (?);")
                .bind(label)
                .execute(&mut **tx)
                .await?;
            Ok::<_, sqlx::Error>(done.last_insert_rowid())
        }
        .boxed()
    })
    .await?;
    assert_eq!(id, 1);
    Ok(())
}
