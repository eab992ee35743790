//! Tests for the rdbc-pool transaction layer

mod common;

use common::{stub_pool, stub_source};
use rdbc_pool::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

// ==================== Local transactions ====================

#[tokio::test]
async fn test_local_transaction_lazy_open_applies_settings() {
    let (source, driver) = stub_source(|c| c);
    let mut tx = LocalTransaction::new(
        Arc::new(source),
        Some(IsolationLevel::Serializable),
        false,
        false,
    );

    assert_eq!(driver.opened(), 0, "connection is acquired lazily");
    tx.connection().await.expect("open");
    tx.connection().await.expect("cached");
    assert_eq!(driver.opened(), 1, "second call reuses the cached handle");

    let state = driver.connection_state(0);
    assert_eq!(
        *state.isolation.lock().unwrap(),
        Some(IsolationLevel::Serializable)
    );
    assert!(!state.auto_commit.load(Ordering::SeqCst));

    tx.close().await.expect("close");
}

#[tokio::test]
async fn test_local_commit_and_rollback_drive_the_driver() {
    let (source, driver) = stub_source(|c| c);
    let mut tx = LocalTransaction::new(Arc::new(source), None, false, false);

    tx.connection()
        .await
        .expect("open")
        .execute("UPDATE t SET x = 1")
        .await
        .expect("execute");
    tx.commit().await.expect("commit");
    tx.commit().await.expect("commit again");
    tx.rollback().await.expect("rollback");

    let state = driver.connection_state(0);
    assert_eq!(state.commits.load(Ordering::SeqCst), 2);
    assert_eq!(state.rollbacks.load(Ordering::SeqCst), 1);

    tx.close().await.expect("close");
    assert!(state.closed.load(Ordering::SeqCst));
    // Auto-commit was reset to true before the close.
    assert!(state.auto_commit.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_local_commit_is_noop_under_auto_commit() {
    let (source, driver) = stub_source(|c| c);
    let mut tx = LocalTransaction::new(Arc::new(source), None, true, false);

    tx.connection().await.expect("open");
    tx.commit().await.expect("commit");
    tx.rollback().await.expect("rollback");

    let state = driver.connection_state(0);
    assert_eq!(state.commits.load(Ordering::SeqCst), 0);
    assert_eq!(state.rollbacks.load(Ordering::SeqCst), 0);
    tx.close().await.expect("close");
}

#[tokio::test]
async fn test_local_commit_is_noop_before_open() {
    let (source, driver) = stub_source(|c| c);
    let mut tx = LocalTransaction::new(Arc::new(source), None, false, false);

    tx.commit().await.expect("commit without connection");
    tx.rollback().await.expect("rollback without connection");
    tx.close().await.expect("close without connection");
    assert_eq!(driver.opened(), 0);
}

#[tokio::test]
async fn test_local_close_skips_auto_commit_reset_when_asked() {
    let (source, driver) = stub_source(|c| c);
    let mut tx = LocalTransaction::new(Arc::new(source), None, false, true);

    tx.connection().await.expect("open");
    tx.close().await.expect("close");

    let state = driver.connection_state(0);
    assert!(state.closed.load(Ordering::SeqCst));
    assert!(
        !state.auto_commit.load(Ordering::SeqCst),
        "auto-commit left untouched on close"
    );
}

#[tokio::test]
async fn test_local_close_twice_is_noop() {
    let (source, _driver) = stub_source(|c| c);
    let mut tx = LocalTransaction::new(Arc::new(source), None, false, false);

    tx.connection().await.expect("open");
    tx.close().await.expect("first close");
    tx.close().await.expect("second close is a no-op");
}

#[tokio::test]
async fn test_local_auto_commit_negotiation_failure() {
    let (source, driver) = stub_source(|c| c);
    driver.open_refusing_auto_commit.store(true, Ordering::SeqCst);

    let mut tx = LocalTransaction::new(Arc::new(source), None, false, false);
    let err = tx.connection().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AutoCommitConfig);
    assert!(
        std::error::Error::source(&err).is_some(),
        "driver cause is wrapped"
    );
    tx.close().await.expect("close without a connection is a no-op");
}

#[tokio::test]
async fn test_pre_supplied_connection_skips_negotiation() {
    let (source, driver) = stub_source(|c| c);
    let conn = source.connection().await.expect("pre-open");
    driver
        .connection_state(0)
        .fail_set_auto_commit
        .store(true, Ordering::SeqCst);

    // The pre-supplied route performs no connection setup at all.
    let mut tx = LocalTransaction::from_connection(conn);
    tx.connection().await.expect("pre-supplied connection");
    tx.close().await.expect("close");
    assert!(driver.connection_state(0).closed.load(Ordering::SeqCst));
}

// ==================== Managed transactions ====================

#[tokio::test]
async fn test_managed_commit_and_rollback_never_touch_the_driver() {
    let (source, driver) = stub_source(|c| c);
    let mut tx = ManagedTransaction::new(Arc::new(source), None, true);

    tx.connection().await.expect("open");
    tx.commit().await.expect("commit");
    tx.rollback().await.expect("rollback");

    let state = driver.connection_state(0);
    assert_eq!(state.commits.load(Ordering::SeqCst), 0);
    assert_eq!(state.rollbacks.load(Ordering::SeqCst), 0);

    tx.close().await.expect("close");
    assert!(state.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_managed_close_respects_close_connection_flag() {
    let (source, driver) = stub_source(|c| c);
    let mut tx = ManagedTransaction::new(Arc::new(source), None, false);

    tx.connection().await.expect("open");
    tx.close().await.expect("close");

    let state = driver.connection_state(0);
    assert!(
        !state.closed.load(Ordering::SeqCst),
        "outer controller owns the connection lifecycle"
    );
}

#[tokio::test]
async fn test_managed_applies_isolation_on_open() {
    let (source, driver) = stub_source(|c| c);
    let mut tx = ManagedTransaction::new(
        Arc::new(source),
        Some(IsolationLevel::RepeatableRead),
        true,
    );

    tx.connection().await.expect("open");
    assert_eq!(
        *driver.connection_state(0).isolation.lock().unwrap(),
        Some(IsolationLevel::RepeatableRead)
    );
    tx.close().await.expect("close");
}

#[tokio::test]
async fn test_transaction_timeout_is_absent() {
    let (source, _driver) = stub_source(|c| c);
    let mut local = LocalTransaction::new(Arc::new(source), None, true, false);
    assert_eq!(local.timeout().await.expect("timeout"), None);

    let (source, _driver) = stub_source(|c| c);
    let mut managed = ManagedTransaction::new(Arc::new(source), None, true);
    assert_eq!(managed.timeout().await.expect("timeout"), None);
}

// ==================== Factories ====================

#[tokio::test]
async fn test_local_factory_builds_configured_transactions() {
    let (source, driver) = stub_source(|c| c);
    let mut factory = LocalTransactionFactory::new();
    let mut props = HashMap::new();
    props.insert("skipSetAutoCommitOnClose".to_string(), "true".to_string());
    factory.set_properties(&props).expect("valid properties");

    let mut tx = factory.new_transaction_from_data_source(
        Arc::new(source),
        Some(IsolationLevel::ReadCommitted),
        false,
    );
    tx.connection().await.expect("open");
    tx.close().await.expect("close");

    let state = driver.connection_state(0);
    assert!(state.closed.load(Ordering::SeqCst));
    assert!(
        !state.auto_commit.load(Ordering::SeqCst),
        "skipSetAutoCommitOnClose suppressed the reset"
    );
}

#[tokio::test]
async fn test_managed_factory_ignores_auto_commit() {
    let (source, driver) = stub_source(|c| c);
    let mut factory = ManagedTransactionFactory::new();
    let mut props = HashMap::new();
    props.insert("closeConnection".to_string(), "false".to_string());
    factory.set_properties(&props).expect("valid properties");

    let mut tx =
        factory.new_transaction_from_data_source(Arc::new(source), None, false);
    tx.connection().await.expect("open");
    tx.commit().await.expect("commit is a no-op");
    tx.close().await.expect("close");

    let state = driver.connection_state(0);
    // auto_commit was never negotiated and the connection stays open.
    assert!(state.auto_commit.load(Ordering::SeqCst));
    assert!(!state.closed.load(Ordering::SeqCst));
    assert_eq!(state.commits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_factory_route_from_existing_connection() {
    let (source, driver) = stub_source(|c| c);
    let conn = source.connection().await.expect("open");

    let factory = LocalTransactionFactory::new();
    let mut tx = factory.new_transaction(conn);
    tx.connection().await.expect("pre-supplied connection");
    tx.close().await.expect("close");
    assert!(driver.connection_state(0).closed.load(Ordering::SeqCst));
}

// ==================== Transactions over the pool ====================

#[tokio::test]
async fn test_local_transaction_over_pooled_datasource() {
    let (pool, driver) = stub_pool(PoolConfig::default());

    let mut tx = LocalTransaction::new(Arc::new(pool.clone()), None, false, false);
    tx.connection()
        .await
        .expect("open")
        .execute("INSERT INTO t VALUES (1)")
        .await
        .expect("execute");
    tx.commit().await.expect("commit");
    tx.close().await.expect("close");

    // Closing the transaction returned the logical connection to the pool.
    assert_eq!(pool.active_connection_count().await, 0);
    assert_eq!(pool.idle_connection_count().await, 1);
    assert_eq!(driver.connection_state(0).commits.load(Ordering::SeqCst), 1);
    assert!(
        !driver.connection_state(0).closed.load(Ordering::SeqCst),
        "physical connection survives for reuse"
    );
}
