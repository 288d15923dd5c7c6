mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rewind_core::backend::{InMemoryBackend, Rpc};
use rewind_core::{
    ConnectionError, ConnectionState, ExhaustionPolicy, RuntimeConfig, StatementOptions,
    StatementResult, Statement, TimeoutOutcome,
};

use common::{backend, runtime, runtime_with};

fn single_session(policy: ExhaustionPolicy, acquire_timeout_ms: u64) -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.pool.max_exclusive_sessions = 1;
    config.pool.exhaustion_policy = policy;
    config.pool.acquire_timeout_ms = acquire_timeout_ms;
    config
}

#[tokio::test]
async fn autocommit_reads_share_one_session() -> Result<()> {
    let backend = backend();
    let runtime = runtime(&backend).await?;
    let mut first = runtime.connection();
    let mut second = runtime.connection();

    first.execute_sql("SELECT 1").await?;
    second.execute_sql("SELECT 2").await?;

    let sessions: Vec<_> = backend
        .requests_for(Rpc::ExecuteQuery)
        .into_iter()
        .filter_map(|request| request.session)
        .collect();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0], sessions[1]);
    assert_eq!(runtime.pool_snapshot().in_use, 0);
    assert!(runtime.pool_snapshot().multiplexed);
    assert_eq!(backend.call_count(Rpc::BeginTransaction), 0);
    Ok(())
}

#[tokio::test]
async fn reads_fall_back_to_exclusive_sessions() -> Result<()> {
    let backend = Arc::new(InMemoryBackend::new().without_multiplexed_sessions());
    let runtime = runtime(&backend).await?;
    let mut conn = runtime.connection();

    conn.execute_sql("SELECT 1").await?;
    let snapshot = runtime.pool_snapshot();
    assert!(!snapshot.multiplexed);
    assert_eq!(snapshot.in_use, 0);
    assert_eq!(snapshot.idle, 1);
    Ok(())
}

#[tokio::test]
async fn fail_fast_rejects_second_writer() -> Result<()> {
    let backend = backend();
    let runtime = runtime_with(&backend, single_session(ExhaustionPolicy::FailFast, 0)).await?;
    let mut holder = runtime.connection();
    let mut other = runtime.connection();

    holder.execute_sql("BEGIN").await?;
    holder.execute_sql("UPDATE t SET v = 1").await?;
    assert_eq!(runtime.pool_snapshot().in_use, 1);

    let err = other
        .execute_sql("UPDATE t SET v = 2")
        .await
        .expect_err("pool is exhausted");
    assert!(matches!(err, ConnectionError::ResourceExhausted(_)));
    // reads still go through the shared session
    other.execute_sql("SELECT v FROM t").await?;

    holder.execute_sql("COMMIT").await?;
    assert_eq!(runtime.pool_snapshot().in_use, 0);
    other.execute_sql("UPDATE t SET v = 2").await?;
    assert_eq!(backend.committed_writes().len(), 2);
    Ok(())
}

#[tokio::test]
async fn blocking_writer_waits_for_release() -> Result<()> {
    let backend = backend();
    let runtime = runtime_with(&backend, single_session(ExhaustionPolicy::Block, 5_000)).await?;
    let mut holder = runtime.connection();
    let mut waiter = runtime.connection();

    holder.execute_sql("BEGIN").await?;
    holder.execute_sql("UPDATE t SET v = 1").await?;

    let task = tokio::spawn(async move {
        let result = waiter.execute_sql("UPDATE t SET v = 2").await;
        (waiter, result)
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());
    assert_eq!(backend.call_count(Rpc::ExecuteDml), 1);

    holder.execute_sql("COMMIT").await?;
    let (_waiter, result) = task.await?;
    result?;
    assert_eq!(backend.call_count(Rpc::ExecuteDml), 2);
    assert_eq!(runtime.pool_snapshot().in_use, 0);
    Ok(())
}

#[tokio::test]
async fn blocking_writer_gives_up_after_acquire_timeout() -> Result<()> {
    let backend = backend();
    let runtime = runtime_with(&backend, single_session(ExhaustionPolicy::Block, 30)).await?;
    let mut holder = runtime.connection();
    let mut other = runtime.connection();

    holder.execute_sql("BEGIN").await?;
    holder.execute_sql("INSERT INTO t (id) VALUES (1)").await?;
    let err = other
        .execute_sql("INSERT INTO t (id) VALUES (2)")
        .await
        .expect_err("no session within the acquire timeout");
    assert!(matches!(err, ConnectionError::ResourceExhausted(_)));
    assert_eq!(runtime.pool_snapshot().in_use, 1);
    holder.rollback().await?;
    assert_eq!(runtime.pool_snapshot().in_use, 0);
    Ok(())
}

#[tokio::test]
async fn cancelled_wait_does_not_leak_a_session() -> Result<()> {
    let backend = backend();
    let runtime = runtime_with(&backend, single_session(ExhaustionPolicy::Block, 5_000)).await?;
    let mut holder = runtime.connection();
    let mut other = runtime.connection();

    holder.execute_sql("BEGIN").await?;
    holder.execute_sql("UPDATE t SET v = 1").await?;

    let err = other
        .execute(
            Statement::new("UPDATE t SET v = 2"),
            StatementOptions::with_timeout(Duration::from_millis(20)),
        )
        .await
        .expect_err("statement times out while waiting");
    assert!(matches!(
        err,
        ConnectionError::Timeout {
            outcome: TimeoutOutcome::Unknown,
            ..
        }
    ));

    holder.execute_sql("COMMIT").await?;
    assert_eq!(runtime.pool_snapshot().in_use, 0);
    other.execute_sql("UPDATE t SET v = 2").await?;
    assert_eq!(runtime.pool_snapshot().in_use, 0);
    Ok(())
}

#[tokio::test]
async fn read_timeout_is_reported_as_not_executed() -> Result<()> {
    let backend = backend();
    let runtime = runtime(&backend).await?;
    let mut conn = runtime.connection();
    backend.set_latency(Duration::from_millis(200));

    let err = conn
        .execute(
            Statement::new("SELECT * FROM big_table"),
            StatementOptions::with_timeout(Duration::from_millis(20)),
        )
        .await
        .expect_err("query times out");
    assert_eq!(err.kind(), rewind_core::ErrorKind::Timeout);
    assert!(matches!(
        err,
        ConnectionError::Timeout {
            outcome: TimeoutOutcome::NotExecuted,
            ..
        }
    ));
    backend.set_latency(Duration::ZERO);
    assert_eq!(runtime.pool_snapshot().in_use, 0);
    conn.execute_sql("SELECT 1").await?;
    Ok(())
}

#[tokio::test]
async fn write_timeout_in_transaction_requires_rollback() -> Result<()> {
    let backend = backend();
    let runtime = runtime(&backend).await?;
    let mut conn = runtime.connection();

    conn.execute_sql("BEGIN").await?;
    conn.execute_sql("INSERT INTO t (id) VALUES (1)").await?;
    backend.set_latency(Duration::from_millis(200));
    let err = conn
        .execute(
            Statement::new("INSERT INTO t (id) VALUES (2)"),
            StatementOptions::with_timeout(Duration::from_millis(20)),
        )
        .await
        .expect_err("write times out");
    assert!(matches!(
        err,
        ConnectionError::Timeout {
            outcome: TimeoutOutcome::Unknown,
            ..
        }
    ));
    backend.set_latency(Duration::ZERO);

    assert!(matches!(
        conn.execute_sql("COMMIT").await,
        Err(ConnectionError::FailedPrecondition(_))
    ));
    conn.execute_sql("ROLLBACK").await?;
    assert!(backend.committed_writes().is_empty());
    assert_eq!(runtime.pool_snapshot().in_use, 0);
    Ok(())
}

#[tokio::test]
async fn closed_connection_releases_its_session() -> Result<()> {
    let backend = backend();
    let runtime = runtime(&backend).await?;
    let mut conn = runtime.connection();

    conn.execute_sql("BEGIN").await?;
    conn.execute_sql("UPDATE t SET v = 1").await?;
    assert_eq!(runtime.pool_snapshot().in_use, 1);
    conn.close().await;

    assert!(conn.is_closed());
    assert_eq!(runtime.pool_snapshot().in_use, 0);
    assert_eq!(backend.call_count(Rpc::Rollback), 1);
    assert!(matches!(
        conn.execute_sql("SELECT 1").await,
        Err(ConnectionError::FailedPrecondition(_))
    ));

    runtime.close().await;
    assert_eq!(backend.live_sessions(), 0);
    Ok(())
}

#[tokio::test]
async fn cancelled_autocommit_write_returns_to_idle() -> Result<()> {
    let backend = backend();
    let runtime = runtime(&backend).await?;
    let mut conn = runtime.connection();

    backend.set_latency(Duration::from_millis(200));
    let cancelled = tokio::time::timeout(
        Duration::from_millis(20),
        conn.execute_sql("INSERT INTO t (id) VALUES (1)"),
    )
    .await;
    assert!(cancelled.is_err());
    backend.set_latency(Duration::ZERO);

    assert_eq!(conn.state(), ConnectionState::Idle);
    assert_eq!(runtime.pool_snapshot().in_use, 0);

    conn.execute_sql("START BATCH DML").await?;
    conn.execute_sql("INSERT INTO t (id) VALUES (2)").await?;
    assert_eq!(
        conn.execute_sql("RUN BATCH").await?,
        StatementResult::UpdateCounts(vec![1])
    );
    assert_eq!(conn.state(), ConnectionState::Idle);
    Ok(())
}
