//! End-to-end tests against a real PostgreSQL server.
//!
//! Requires PostgreSQL on localhost:5432. Run:
//! `podman run -d --name stratum-pg -e POSTGRES_USER=stratum -e POSTGRES_PASSWORD=stratum -e POSTGRES_DB=stratum_test -p 5432:5432 postgres:17`
//! Then: `cargo test --test live -- --ignored --test-threads=1`

mod support;

use std::sync::Arc;
use std::time::Duration;

use stratum::{Error, Executor, Impatient, Param, Pool, Retry, Spy, Stash, StashConfig, Rows, Wire};

fn wire() -> Wire {
    Wire::direct(
        "127.0.0.1",
        5432,
        "stratum_test",
        "stratum",
        Some("stratum".to_string()),
    )
}

async fn fresh_pool(n: usize) -> Arc<Pool> {
    support::init_tracing();
    let pool = Arc::new(Pool::new(wire()));
    pool.start(n).await.expect("pool start");
    pool.exec("DROP TABLE IF EXISTS book", &[], Default::default())
        .await
        .expect("drop");
    pool.exec(
        "CREATE TABLE book (id serial PRIMARY KEY, title text NOT NULL)",
        &[],
        Default::default(),
    )
    .await
    .expect("create");
    pool
}

#[tokio::test]
#[ignore]
async fn version_is_a_single_token() {
    let pool = Arc::new(Pool::new(wire()));
    pool.start(1).await.unwrap();
    let version = pool.version().await.unwrap();
    assert!(!version.is_empty());
    assert!(!version.contains(char::is_whitespace));
    // Memoized: second call answers without a checkout.
    assert_eq!(pool.version().await.unwrap(), version);
}

#[tokio::test]
#[ignore]
async fn text_mode_rows_round_trip() {
    let pool = fresh_pool(2).await;
    pool.exec(
        "INSERT INTO book (title) VALUES ($1)",
        &[Param::from("Dune")],
        Default::default(),
    )
    .await
    .unwrap();
    let rows = pool
        .exec("SELECT title FROM book", &[], Default::default())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows.get(0).unwrap().get_str_by_name("title"), Some("Dune"));
}

#[tokio::test]
#[ignore]
async fn pool_recovers_after_a_failing_statement() {
    let pool = fresh_pool(1).await;
    let err = pool
        .exec("SELECT nope FROM book", &[], Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Query { .. }));
    // The same pool keeps working.
    let rows = pool
        .exec("SELECT count(*) FROM book", &[], Default::default())
        .await
        .unwrap();
    assert_eq!(rows.get(0).unwrap().get_i64(0), Some(0));
}

#[tokio::test]
#[ignore]
async fn transaction_rollback_leaves_no_rows() {
    let pool = fresh_pool(2).await;
    let executor: Arc<dyn Executor> = pool.clone();

    let err = executor
        .transaction(Box::new(|tx| {
            Box::pin(async move {
                tx.query("INSERT INTO book (title) VALUES ($1)", &[Param::from("A")])
                    .await?;
                // Bad column name fails the transaction.
                tx.query("INSERT INTO book (tile) VALUES ($1)", &[Param::from("B")])
                    .await?;
                Ok(())
            })
        }))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Query { .. }));

    let rows = pool
        .exec("SELECT * FROM book", &[], Default::default())
        .await
        .unwrap();
    assert!(rows.is_empty());

    // Writes outside the failed transaction still succeed.
    pool.exec(
        "INSERT INTO book (title) VALUES ($1)",
        &[Param::from("C")],
        Default::default(),
    )
    .await
    .unwrap();
}

#[tokio::test]
#[ignore]
async fn impatient_interrupts_a_slow_query() {
    let pool = fresh_pool(1).await;
    let impatient = Impatient::new(pool.clone(), Duration::from_millis(10));
    let err = impatient
        .exec(
            "SELECT COUNT(*) FROM generate_series(1,100000000)",
            &[],
            Default::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TooSlow { .. }));

    // The pool replaced the abandoned connection and keeps serving.
    let rows = pool
        .exec("SELECT count(*) FROM book", &[], Default::default())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
#[ignore]
async fn impatient_exemption_lets_the_query_finish() {
    let pool = fresh_pool(1).await;
    let impatient =
        Impatient::with_exemptions(pool.clone(), Duration::from_millis(10), &["^SELECT"]).unwrap();
    let rows = impatient
        .exec(
            "SELECT COUNT(*) FROM generate_series(1,1000000)",
            &[],
            Default::default(),
        )
        .await
        .unwrap();
    assert_eq!(rows.get(0).unwrap().get_i64(0), Some(1_000_000));
}

#[tokio::test]
#[ignore]
async fn statement_timeout_applies_inside_transactions() {
    let pool = fresh_pool(1).await;
    let impatient = Arc::new(Impatient::new(pool.clone(), Duration::from_millis(50)));
    let executor: Arc<dyn Executor> = impatient;

    let err = executor
        .transaction(Box::new(|tx| {
            Box::pin(async move {
                let rows = tx.query("SHOW statement_timeout", &[]).await?;
                assert_eq!(rows.get(0).unwrap().get_str(0), Some("50ms"));
                tx.query("SELECT pg_sleep(10)", &[]).await?;
                Ok(())
            })
        }))
        .await
        .unwrap_err();
    // Either our deadline or the server's statement_timeout fires first;
    // both surface as an error, never a hang.
    match err {
        Error::TooSlow { .. } | Error::Query { .. } => {}
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
#[ignore]
async fn full_stack_caches_and_invalidates() {
    let pool = fresh_pool(4).await;
    let stash = Arc::new(Stash::new(
        pool.clone(),
        StashConfig::default()
            .refill_interval(Some(Duration::from_millis(100)))
            .cap_interval(None)
            .retire_interval(None),
    ));
    let retry = Arc::new(Retry::new(stash.clone()));
    let spy: Arc<dyn Executor> = Arc::new(Spy::new(retry, |sql, elapsed| {
        tracing::debug!(%sql, ?elapsed, "observed");
    }));

    let first = spy
        .query("SELECT count(*) FROM book", &[])
        .await
        .unwrap();
    let second = spy
        .query("SELECT count(*) FROM book", &[])
        .await
        .unwrap();
    assert!(Rows::ptr_eq(&first, &second));

    spy.query("INSERT INTO book (title) VALUES ($1)", &[Param::from("X")])
        .await
        .unwrap();
    let third = spy
        .query("SELECT count(*) FROM book", &[])
        .await
        .unwrap();
    assert!(!Rows::ptr_eq(&second, &third));
    let before: i64 = second.get(0).and_then(|r| r.get_i64(0)).unwrap();
    let after: i64 = third.get(0).and_then(|r| r.get_i64(0)).unwrap();
    assert_eq!(after, before + 1);
    stash.shutdown();
}

#[tokio::test]
#[ignore]
async fn dump_snapshots_the_pool() {
    let pool = fresh_pool(3).await;
    pool.version().await.unwrap();
    let dump = pool.dump().await.unwrap();
    assert!(dump.contains("idle connection"));
    assert!(dump.contains("pid="));
}
