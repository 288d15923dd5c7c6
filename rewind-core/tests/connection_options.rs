mod common;

use std::time::Duration;

use anyhow::Result;
use rewind_core::backend::{AppliedWrite, Rpc};
use rewind_core::{
    ConnectionError, ConnectionState, IsolationLevel, Mutation, OptionLayer, RpcPriority,
    RuntimeConfig, Savepoint, Statement, StatementOptions, StatementResult, Value,
};

use rewind_core::sql::Variable;

use common::{backend, runtime, runtime_with};

fn first_value(result: StatementResult) -> Option<Value> {
    result
        .into_result_set()
        .and_then(|rows| rows.rows().first().and_then(|row| row.first().cloned()))
}

#[tokio::test]
async fn statement_options_override_connection_and_environment() -> Result<()> {
    let backend = backend();
    let mut config = RuntimeConfig::default();
    config.defaults.optimizer_version = Some("1".to_string());
    config.defaults.optimizer_statistics_package = Some("auto_20240101".to_string());
    let runtime = runtime_with(&backend, config).await?;
    let mut conn = runtime.connection();

    conn.execute_sql("SELECT 1").await?;
    conn.execute_sql("SET OPTIMIZER_VERSION = '20'").await?;
    conn.execute_sql("SELECT 2").await?;
    conn.execute_sql("@{OPTIMIZER_STATISTICS_PACKAGE=user-defined} SELECT 3")
        .await?;
    conn.execute(
        Statement::new("/*@ OPTIMIZER_VERSION=30 */ SELECT 4"),
        StatementOptions::with_overrides(OptionLayer::new().with_optimizer_version("40")),
    )
    .await?;
    conn.execute_sql("SELECT 5").await?;

    let seen: Vec<_> = backend
        .requests_for(Rpc::ExecuteQuery)
        .into_iter()
        .map(|r| (r.options.optimizer_version, r.options.optimizer_statistics_package))
        .collect();
    let expect = |version: &str, package: &str| (version.to_string(), package.to_string());
    assert_eq!(
        seen,
        vec![
            expect("1", "auto_20240101"),
            expect("20", "auto_20240101"),
            expect("20", "user-defined"),
            expect("40", "auto_20240101"),
            expect("20", "auto_20240101"),
        ]
    );
    assert_eq!(
        first_value(conn.execute_sql("SHOW VARIABLE OPTIMIZER_VERSION").await?),
        Some(Value::from("20"))
    );
    Ok(())
}

#[tokio::test]
async fn hints_are_stripped_before_sending() -> Result<()> {
    let backend = backend();
    let runtime = runtime(&backend).await?;
    let mut conn = runtime.connection();

    conn.execute_sql("@{RPC_PRIORITY=HIGH} UPDATE t SET v = 1").await?;
    let request = backend
        .requests_for(Rpc::ExecuteDml)
        .pop()
        .ok_or_else(|| anyhow::anyhow!("missing DML request"))?;
    assert_eq!(request.sql, vec!["UPDATE t SET v = 1"]);
    assert_eq!(request.options.priority, RpcPriority::High);
    Ok(())
}

#[tokio::test]
async fn statement_tag_applies_to_one_statement() -> Result<()> {
    let backend = backend();
    let runtime = runtime(&backend).await?;
    let mut conn = runtime.connection();

    conn.execute_sql("SET STATEMENT_TAG = 'nightly-report'").await?;
    assert_eq!(conn.statement_tag(), "nightly-report");
    conn.execute_sql("SELECT * FROM orders").await?;
    conn.execute_sql("SELECT * FROM orders").await?;
    assert_eq!(conn.statement_tag(), "");

    let tags: Vec<_> = backend
        .requests_for(Rpc::ExecuteQuery)
        .into_iter()
        .map(|r| r.options.request_tag)
        .collect();
    assert_eq!(tags, vec!["nightly-report".to_string(), String::new()]);
    Ok(())
}

#[tokio::test]
async fn transaction_tag_lasts_until_commit() -> Result<()> {
    let backend = backend();
    let runtime = runtime(&backend).await?;
    let mut conn = runtime.connection();

    conn.set_transaction_tag("checkout")?;
    conn.execute_sql("BEGIN").await?;
    conn.execute_sql("INSERT INTO orders (id) VALUES (1)").await?;
    conn.execute_sql("UPDATE stock SET n = n - 1").await?;
    conn.execute_sql("COMMIT").await?;
    assert_eq!(conn.transaction_tag(), "");

    conn.execute_sql("BEGIN").await?;
    conn.execute_sql("INSERT INTO orders (id) VALUES (2)").await?;
    conn.execute_sql("COMMIT").await?;

    let dml_tags: Vec<_> = backend
        .requests_for(Rpc::ExecuteDml)
        .into_iter()
        .map(|r| r.options.transaction_tag)
        .collect();
    assert_eq!(dml_tags, vec!["checkout", "checkout", ""]);
    let commit_tags: Vec<_> = backend
        .requests_for(Rpc::Commit)
        .into_iter()
        .map(|r| r.options.transaction_tag)
        .collect();
    assert_eq!(commit_tags, vec!["checkout", ""]);
    let begin_tags: Vec<_> = backend
        .requests_for(Rpc::BeginTransaction)
        .into_iter()
        .map(|r| r.options.transaction_tag)
        .collect();
    assert_eq!(begin_tags, vec!["checkout", ""]);
    Ok(())
}

#[tokio::test]
async fn transaction_tag_is_fixed_once_work_started() -> Result<()> {
    let backend = backend();
    let runtime = runtime(&backend).await?;
    let mut conn = runtime.connection();

    conn.execute_sql("BEGIN").await?;
    conn.execute_sql("SET TRANSACTION_TAG = 'late-but-ok'").await?;
    assert_eq!(conn.transaction_tag(), "late-but-ok");
    conn.execute_sql("INSERT INTO t (id) VALUES (1)").await?;
    assert!(matches!(
        conn.set_transaction_tag("too-late"),
        Err(ConnectionError::FailedPrecondition(_))
    ));
    conn.execute_sql("ROLLBACK").await?;
    assert_eq!(conn.transaction_tag(), "");
    Ok(())
}

#[tokio::test]
async fn empty_transaction_commits_without_rpcs() -> Result<()> {
    let backend = backend();
    let runtime = runtime(&backend).await?;
    let mut conn = runtime.connection();

    conn.execute_sql("BEGIN").await?;
    assert_eq!(conn.state(), ConnectionState::ExplicitTransaction);
    conn.execute_sql("COMMIT").await?;
    assert_eq!(conn.state(), ConnectionState::Idle);
    assert_eq!(backend.call_count(Rpc::BeginTransaction), 0);
    assert_eq!(backend.call_count(Rpc::Commit), 0);
    assert!(conn.commit_response().is_none());

    // commit and rollback without a transaction are no-ops
    conn.commit().await?;
    conn.rollback().await?;
    assert_eq!(backend.requests().len(), 0);
    Ok(())
}

#[tokio::test]
async fn read_only_mode_rejects_writes() -> Result<()> {
    let backend = backend();
    let runtime = runtime(&backend).await?;
    let mut conn = runtime.connection();

    conn.execute_sql("SET READONLY = TRUE").await?;
    assert!(matches!(
        conn.execute_sql("INSERT INTO t (id) VALUES (1)").await,
        Err(ConnectionError::FailedPrecondition(_))
    ));
    assert!(matches!(
        conn.buffer_write(Mutation::insert("t").columns(["id"]).row(vec![Value::Int64(1)]))
            .await,
        Err(ConnectionError::FailedPrecondition(_))
    ));
    assert!(matches!(
        conn.execute_sql("START BATCH DML").await,
        Err(ConnectionError::FailedPrecondition(_))
    ));

    conn.execute_sql("BEGIN").await?;
    conn.execute_sql("SELECT * FROM t").await?;
    assert!(matches!(
        conn.execute_sql("UPDATE t SET v = 1").await,
        Err(ConnectionError::FailedPrecondition(_))
    ));
    conn.execute_sql("ROLLBACK").await?;

    conn.execute_sql("BEGIN").await?;
    conn.execute_sql("SELECT * FROM t").await?;
    conn.execute_sql("COMMIT").await?;
    assert_eq!(backend.call_count(Rpc::Commit), 0);
    assert_eq!(backend.call_count(Rpc::Rollback), 0);
    assert_eq!(runtime.pool_snapshot().sessions_created, 0);
    Ok(())
}

#[tokio::test]
async fn autocommit_off_starts_transactions_implicitly() -> Result<()> {
    let backend = backend();
    let runtime = runtime(&backend).await?;
    let mut conn = runtime.connection();

    conn.execute_sql("SET AUTOCOMMIT = FALSE").await?;
    assert!(!conn.autocommit());
    conn.execute_sql("INSERT INTO t (id) VALUES (1)").await?;
    assert!(conn.is_in_transaction());
    assert!(matches!(
        conn.set_autocommit(true),
        Err(ConnectionError::FailedPrecondition(_))
    ));
    assert!(backend.committed_writes().is_empty());

    conn.execute_sql("COMMIT").await?;
    assert!(!conn.is_in_transaction());
    assert_eq!(backend.committed_writes().len(), 1);
    conn.set_autocommit(true)?;
    Ok(())
}

#[tokio::test]
async fn isolation_level_applies_to_the_next_transaction() -> Result<()> {
    let backend = backend();
    let runtime = runtime(&backend).await?;
    let mut conn = runtime.connection();

    conn.execute_sql("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE").await?;
    conn.execute_sql("BEGIN").await?;
    conn.execute_sql("UPDATE t SET v = 1").await?;
    conn.execute_sql("COMMIT").await?;

    conn.execute_sql("BEGIN ISOLATION LEVEL REPEATABLE READ").await?;
    conn.execute_sql("UPDATE t SET v = 2").await?;
    conn.execute_sql("COMMIT").await?;

    conn.execute_sql("BEGIN").await?;
    conn.execute_sql("UPDATE t SET v = 3").await?;
    assert!(matches!(
        conn.execute_sql("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE").await,
        Err(ConnectionError::FailedPrecondition(_))
    ));
    conn.execute_sql("ROLLBACK").await?;

    let levels: Vec<_> = backend
        .requests_for(Rpc::BeginTransaction)
        .into_iter()
        .filter_map(|r| r.isolation_level)
        .collect();
    assert_eq!(
        levels,
        vec![
            IsolationLevel::Serializable,
            IsolationLevel::RepeatableRead,
            IsolationLevel::Default,
        ]
    );
    Ok(())
}

#[tokio::test]
async fn commit_settings_and_response() -> Result<()> {
    let backend = backend();
    let runtime = runtime(&backend).await?;
    let mut conn = runtime.connection();

    assert_eq!(
        first_value(conn.execute_sql("SHOW VARIABLE COMMIT_TIMESTAMP").await?),
        Some(Value::Null)
    );
    conn.execute_sql("SET MAX_COMMIT_DELAY = '50ms'").await?;
    conn.execute_sql("SET RETURN_COMMIT_STATS = TRUE").await?;
    conn.execute_sql("BEGIN").await?;
    conn.execute_sql("INSERT INTO singers (id) VALUES (1)").await?;
    conn.buffer_write(
        Mutation::insert("albums")
            .columns(["id", "title"])
            .row(vec![Value::Int64(1), Value::from("Blue")])
            .row(vec![Value::Int64(2), Value::from("Red")]),
    )
    .await?;
    conn.execute_sql("COMMIT").await?;

    let commit = backend
        .requests_for(Rpc::Commit)
        .pop()
        .ok_or_else(|| anyhow::anyhow!("missing commit"))?;
    assert_eq!(commit.max_commit_delay, Some(Duration::from_millis(50)));

    let response = conn
        .commit_response()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("missing commit response"))?;
    assert_eq!(
        response.commit_stats.map(|stats| stats.mutation_count),
        Some(3)
    );
    let shown = conn
        .execute_sql("SHOW VARIABLE COMMIT_RESPONSE")
        .await?
        .into_result_set()
        .ok_or_else(|| anyhow::anyhow!("SHOW returns rows"))?;
    assert_eq!(shown.columns(), ["COMMIT_TIMESTAMP", "MUTATION_COUNT"]);
    assert_eq!(
        shown.rows()[0],
        vec![Value::Timestamp(response.commit_timestamp), Value::Int64(3)]
    );

    let writes = backend.committed_writes();
    assert!(matches!(writes[1], AppliedWrite::Mutation(ref m) if m.table == "albums"));
    Ok(())
}

#[tokio::test]
async fn autocommit_mutations_commit_immediately() -> Result<()> {
    let backend = backend();
    let runtime = runtime(&backend).await?;
    let mut conn = runtime.connection();

    conn.buffer_write(Mutation::delete("albums").columns(["id"]).row(vec![Value::Int64(7)]))
        .await?;
    assert_eq!(backend.call_count(Rpc::Commit), 1);
    assert_eq!(backend.committed_writes().len(), 1);
    assert!(conn.commit_response().is_some());
    Ok(())
}

#[tokio::test]
async fn show_and_set_variables() -> Result<()> {
    let backend = backend();
    let runtime = runtime(&backend).await?;
    let mut conn = runtime.connection();

    assert_eq!(
        first_value(conn.execute_sql("SHOW VARIABLE AUTOCOMMIT").await?),
        Some(Value::Bool(true))
    );
    conn.execute_sql("SET STATEMENT_TIMEOUT = '2s'").await?;
    assert_eq!(
        first_value(conn.execute_sql("SHOW VARIABLE STATEMENT_TIMEOUT").await?),
        Some(Value::from("2000ms"))
    );
    conn.execute_sql("SET RPC_PRIORITY = 'LOW'").await?;
    assert_eq!(
        first_value(conn.execute_sql("SHOW VARIABLE RPC_PRIORITY").await?),
        Some(Value::from("LOW"))
    );
    assert_eq!(
        first_value(conn.execute_sql("SHOW VARIABLE RETRY_COUNT").await?),
        Some(Value::Int64(0))
    );

    assert!(matches!(
        conn.execute_sql("SET COMMIT_TIMESTAMP = 'now'").await,
        Err(ConnectionError::InvalidArgument(_))
    ));
    assert!(matches!(
        conn.execute_sql("SHOW VARIABLE NO_SUCH_THING").await,
        Err(ConnectionError::InvalidArgument(_))
    ));
    assert!(matches!(
        conn.execute_sql("FROBNICATE everything").await,
        Err(ConnectionError::InvalidStatement(_))
    ));
    assert!(matches!(
        conn.execute_sql("SET AUTOCOMMIT = maybe").await,
        Err(ConnectionError::InvalidArgument(_))
    ));
    assert_eq!(backend.requests().len(), 0);
    Ok(())
}

#[tokio::test]
async fn programmatic_savepoints() -> Result<()> {
    let backend = backend();
    let runtime = runtime(&backend).await?;
    let mut conn = runtime.connection();

    assert!(matches!(
        conn.set_savepoint(None).await,
        Err(ConnectionError::FailedPrecondition(_))
    ));

    conn.begin().await?;
    conn.execute_sql("INSERT INTO t (id) VALUES (1)").await?;
    let unnamed = conn.set_savepoint(None).await?;
    assert!(matches!(unnamed, Savepoint::Unnamed(_)));
    let named = conn.set_savepoint(Some("second")).await?;
    conn.execute_sql("INSERT INTO t (id) VALUES (2)").await?;
    conn.release_savepoint(&named).await?;
    conn.rollback_to_savepoint(&unnamed).await?;
    conn.commit().await?;

    assert_eq!(
        backend.committed_writes(),
        vec![AppliedWrite::Dml(Statement::new("INSERT INTO t (id) VALUES (1)"))]
    );
    Ok(())
}

#[tokio::test]
async fn statement_transaction_tag_applies_to_open_transaction() -> Result<()> {
    let backend = backend();
    let runtime = runtime(&backend).await?;
    let mut conn = runtime.connection();

    conn.execute_sql("BEGIN").await?;
    conn.execute_sql("@{TRANSACTION_TAG=hinted} INSERT INTO t (id) VALUES (1)")
        .await?;
    assert_eq!(conn.transaction_tag(), "hinted");
    assert!(matches!(
        conn.execute_sql("@{TRANSACTION_TAG=other} INSERT INTO t (id) VALUES (2)")
            .await,
        Err(ConnectionError::FailedPrecondition(_))
    ));
    conn.execute_sql("ROLLBACK").await?;

    let dml_tags: Vec<_> = backend
        .requests_for(Rpc::ExecuteDml)
        .into_iter()
        .map(|r| r.options.transaction_tag)
        .collect();
    assert_eq!(dml_tags, vec!["hinted"]);
    let begin_tags: Vec<_> = backend
        .requests_for(Rpc::BeginTransaction)
        .into_iter()
        .map(|r| r.options.transaction_tag)
        .collect();
    assert_eq!(begin_tags, vec!["hinted"]);
    Ok(())
}

#[tokio::test]
async fn read_only_variables_reject_programmatic_set() -> Result<()> {
    let backend = backend();
    let runtime = runtime(&backend).await?;
    let mut conn = runtime.connection();

    for variable in [
        Variable::CommitTimestamp,
        Variable::CommitResponse,
        Variable::RetryCount,
    ] {
        assert!(matches!(
            conn.set_variable(variable, "1"),
            Err(ConnectionError::InvalidArgument(_))
        ));
    }
    conn.set_variable(Variable::StatementTag, "report")?;
    assert_eq!(conn.statement_tag(), "report");
    Ok(())
}
