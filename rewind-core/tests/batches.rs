mod common;

use anyhow::Result;
use rewind_core::backend::{Fault, Rpc};
use rewind_core::{
    ConnectionError, ConnectionState, RuntimeConfig, Statement, StatementResult,
};
use tonic::Status;

use common::{backend, runtime, runtime_with, sql_of};

#[tokio::test]
async fn failed_batch_reports_partial_counts_and_clears_buffer() -> Result<()> {
    let backend = backend();
    backend.set_update_count("SET flagged", 4);
    backend.inject(Fault::FailStatement {
        sql_contains: "INTO orders".to_string(),
        status: Status::already_exists("row already exists"),
    });
    let runtime = runtime(&backend).await?;
    let mut conn = runtime.connection();

    conn.add_to_batch(Statement::new("UPDATE customers SET flagged = true"))?;
    conn.add_to_batch(Statement::new("DELETE FROM carts WHERE id = 7"))?;
    conn.add_to_batch(Statement::new("INSERT INTO orders (id) VALUES (7)"))?;
    let err = conn.execute_batch().await.expect_err("third statement fails");

    assert_eq!(err.partial_update_counts(), Some(&[4, 1][..]));
    match &err {
        ConnectionError::BatchUpdate { source, .. } => {
            assert!(matches!(**source, ConnectionError::AlreadyExists(_)));
        }
        other => panic!("unexpected error {other}"),
    }
    // autocommit rolled the partial batch back
    assert!(backend.committed_writes().is_empty());
    assert_eq!(backend.call_count(Rpc::Rollback), 1);

    assert_eq!(conn.execute_batch().await?, Vec::<i64>::new());
    assert_eq!(backend.call_count(Rpc::ExecuteBatchDml), 1);
    assert_eq!(runtime.pool_snapshot().in_use, 0);
    Ok(())
}

#[tokio::test]
async fn batch_failure_inside_transaction_requires_rollback() -> Result<()> {
    let backend = backend();
    backend.inject(Fault::FailStatement {
        sql_contains: "bad".to_string(),
        status: Status::invalid_argument("no such column: bad"),
    });
    let runtime = runtime(&backend).await?;
    let mut conn = runtime.connection();

    conn.begin().await?;
    conn.add_to_batch(Statement::new("UPDATE t SET v = 1"))?;
    conn.add_to_batch(Statement::new("UPDATE t SET bad = 1"))?;
    let err = conn.execute_batch().await.expect_err("second statement fails");
    assert_eq!(err.partial_update_counts(), Some(&[1][..]));

    assert!(matches!(
        conn.execute_sql("UPDATE t SET v = 2").await,
        Err(ConnectionError::FailedPrecondition(_))
    ));
    conn.rollback().await?;
    conn.execute_sql("UPDATE t SET v = 2").await?;
    assert_eq!(backend.committed_writes().len(), 1);
    Ok(())
}

#[tokio::test]
async fn narrow_counts_reject_large_values() -> Result<()> {
    let backend = backend();
    backend.set_update_count("huge", 3_000_000_000);
    let runtime = runtime(&backend).await?;
    let mut conn = runtime.connection();

    conn.add_to_batch(Statement::new("UPDATE small SET v = 1"))?;
    assert_eq!(conn.execute_batch_narrow().await?, vec![1]);

    conn.add_to_batch(Statement::new("UPDATE huge SET v = 1"))?;
    assert!(matches!(
        conn.execute_batch_narrow().await,
        Err(ConnectionError::OutOfRange(_))
    ));
    assert!(matches!(
        conn.execute_update_narrow(Statement::new("UPDATE huge SET v = 2")).await,
        Err(ConnectionError::OutOfRange(_))
    ));
    assert_eq!(
        conn.execute_update(Statement::new("UPDATE huge SET v = 3")).await?,
        3_000_000_000
    );
    Ok(())
}

#[tokio::test]
async fn only_dml_can_be_batched() -> Result<()> {
    let backend = backend();
    let runtime = runtime(&backend).await?;
    let mut conn = runtime.connection();
    assert!(matches!(
        conn.add_to_batch(Statement::new("SELECT 1")),
        Err(ConnectionError::InvalidArgument(_))
    ));
    assert!(matches!(
        conn.add_to_batch(Statement::new("CREATE TABLE t (id INT64)")),
        Err(ConnectionError::InvalidArgument(_))
    ));
    Ok(())
}

#[tokio::test]
async fn dml_batch_statements_are_sent_together() -> Result<()> {
    let backend = backend();
    let runtime = runtime(&backend).await?;
    let mut conn = runtime.connection();

    conn.execute_sql("START BATCH DML").await?;
    assert_eq!(conn.state(), ConnectionState::DmlBatch);
    assert_eq!(
        conn.execute_sql("INSERT INTO t (id) VALUES (1)").await?,
        StatementResult::NoResult
    );
    conn.execute_sql("INSERT INTO t (id) VALUES (2)").await?;
    assert!(matches!(
        conn.execute_sql("SELECT * FROM t").await,
        Err(ConnectionError::FailedPrecondition(_))
    ));
    assert_eq!(backend.call_count(Rpc::ExecuteDml), 0);

    let result = conn.execute_sql("RUN BATCH").await?;
    assert_eq!(result, StatementResult::UpdateCounts(vec![1, 1]));
    assert_eq!(conn.state(), ConnectionState::Idle);
    assert_eq!(
        sql_of(&backend, Rpc::ExecuteBatchDml),
        vec!["INSERT INTO t (id) VALUES (1)", "INSERT INTO t (id) VALUES (2)"]
    );
    assert_eq!(backend.committed_writes().len(), 2);
    Ok(())
}

#[tokio::test]
async fn aborted_dml_batch_sends_nothing() -> Result<()> {
    let backend = backend();
    let runtime = runtime(&backend).await?;
    let mut conn = runtime.connection();

    conn.execute_sql("START BATCH DML").await?;
    conn.execute_sql("UPDATE t SET v = 1").await?;
    conn.execute_sql("ABORT BATCH").await?;
    assert_eq!(conn.state(), ConnectionState::Idle);
    assert_eq!(backend.call_count(Rpc::ExecuteBatchDml), 0);
    assert!(matches!(
        conn.execute_sql("RUN BATCH").await,
        Err(ConnectionError::FailedPrecondition(_))
    ));
    Ok(())
}

fn fast_ddl() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.ddl.poll_interval_ms = 1;
    config
}

#[tokio::test]
async fn ddl_batch_runs_as_one_operation() -> Result<()> {
    let backend = std::sync::Arc::new(rewind_core::backend::InMemoryBackend::new().with_ddl_polls(2));
    let runtime = runtime_with(&backend, fast_ddl()).await?;
    let mut conn = runtime.connection();

    conn.execute_sql("START BATCH DDL").await?;
    assert_eq!(conn.state(), ConnectionState::DdlBatch);
    assert_eq!(runtime.pool_snapshot().in_use, 1);
    conn.execute_sql("CREATE TABLE singers (id INT64) PRIMARY KEY (id)").await?;
    conn.execute_sql("CREATE INDEX singers_by_id ON singers (id)").await?;
    assert!(matches!(
        conn.execute_sql("INSERT INTO singers (id) VALUES (1)").await,
        Err(ConnectionError::FailedPrecondition(_))
    ));
    assert!(backend.applied_ddl().is_empty());

    conn.execute_sql("RUN BATCH").await?;
    assert_eq!(conn.state(), ConnectionState::Idle);
    assert_eq!(backend.call_count(Rpc::UpdateDdl), 1);
    assert_eq!(backend.call_count(Rpc::GetOperation), 2);
    assert_eq!(
        backend.applied_ddl(),
        vec![
            "CREATE TABLE singers (id INT64) PRIMARY KEY (id)",
            "CREATE INDEX singers_by_id ON singers (id)",
        ]
    );
    assert_eq!(runtime.pool_snapshot().in_use, 0);
    Ok(())
}

#[tokio::test]
async fn failed_ddl_batch_returns_to_idle() -> Result<()> {
    let backend = backend();
    backend.inject(Fault::FailDdl(Status::failed_precondition("duplicate table")));
    let runtime = runtime_with(&backend, fast_ddl()).await?;
    let mut conn = runtime.connection();

    conn.start_batch_ddl().await?;
    conn.execute_sql("CREATE TABLE t (id INT64) PRIMARY KEY (id)").await?;
    let err = conn.run_batch().await.expect_err("operation fails");
    assert!(matches!(err, ConnectionError::FailedPrecondition(_)));
    assert_eq!(conn.state(), ConnectionState::Idle);
    assert_eq!(runtime.pool_snapshot().in_use, 0);
    Ok(())
}

#[tokio::test]
async fn ddl_is_rejected_after_writes_in_a_transaction() -> Result<()> {
    let backend = backend();
    let runtime = runtime_with(&backend, fast_ddl()).await?;
    let mut conn = runtime.connection();

    conn.execute_sql("CREATE TABLE t (id INT64) PRIMARY KEY (id)").await?;
    assert_eq!(backend.applied_ddl().len(), 1);

    conn.execute_sql("BEGIN").await?;
    conn.execute_sql("INSERT INTO t (id) VALUES (1)").await?;
    assert!(matches!(
        conn.execute_sql("ALTER TABLE t ADD COLUMN v STRING(MAX)").await,
        Err(ConnectionError::FailedPrecondition(_))
    ));
    assert!(matches!(
        conn.execute_sql("START BATCH DDL").await,
        Err(ConnectionError::FailedPrecondition(_))
    ));
    conn.execute_sql("ROLLBACK").await?;
    assert_eq!(backend.applied_ddl().len(), 1);
    Ok(())
}
