// End-to-end XA branch lifecycle against the in-memory backend:
// sequential transactions on one logical session, two-phase commit with
// post-transaction sanitization, and prepared-branch pinning.

use std::sync::Arc;
use std::time::Duration;

use ojp::backend::memory::MemoryXaDataSource;
use ojp::backend::{
    ConnectionSettings, IsolationLevel, XaEndFlags, XaStartFlags, XaVote, Xid,
};
use ojp::config::{DiagnosticsConfig, LeakDetectionConfig, PropertySource, ServerConfig};
use ojp::engine::ProxyEngine;
use ojp::pool::{PoolSettings, XaBackendPool, XaSessionPool};
use ojp::xa::{TxRegistry, TxState};
use uuid::Uuid;

fn quiet_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.leak_detection.interval = Duration::ZERO;
    config.session_cleanup.enabled = false;
    config
}

fn xid(tag: &[u8]) -> Xid {
    Xid::new(0x4F4A50, tag.to_vec(), vec![1])
}

#[tokio::test]
async fn sequential_xa_transactions_on_one_logical_session() {
    let engine = ProxyEngine::with_default_providers(quiet_config(), PropertySource::default());
    let session = engine
        .connect(Uuid::new_v4(), "jdbc:mem:bank", "app", "secret", None, true)
        .await
        .unwrap();
    let conn_hash = engine
        .sessions()
        .get(&session)
        .unwrap()
        .conn_hash()
        .as_str()
        .to_string();

    let mut backend_session_ids = Vec::new();
    for tag in [b"t1", b"t2", b"t3", b"t4"] {
        let x = xid(tag);
        engine
            .xa_start(session, &x, XaStartFlags::NoFlags)
            .await
            .unwrap();
        engine
            .execute_update(session, Some(&x), "INSERT INTO ledger VALUES (1)", &[])
            .await
            .unwrap();
        engine.xa_end(session, &x, XaEndFlags::Success).await.unwrap();
        assert_eq!(engine.xa_prepare(session, &x).await.unwrap(), XaVote::Ok);
        backend_session_ids.push(
            engine
                .tx_registry()
                .snapshot(&x)
                .await
                .unwrap()
                .backend_session_id,
        );
        engine.xa_commit(session, &x, false).await.unwrap();

        // One physical XA connection serves the whole sequence.
        let stats = engine.pool_statistics(&conn_hash).unwrap();
        assert_eq!(stats.active, 1);
    }

    backend_session_ids.dedup();
    assert_eq!(backend_session_ids.len(), 1, "backend session must be reused");
}

#[tokio::test]
async fn two_phase_commit_sanitizes_between_transactions() {
    let engine = ProxyEngine::with_default_providers(quiet_config(), PropertySource::default());
    let session = engine
        .connect(Uuid::new_v4(), "jdbc:mem:bank", "app", "secret", None, true)
        .await
        .unwrap();

    let x1 = xid(b"first");
    engine
        .xa_start(session, &x1, XaStartFlags::NoFlags)
        .await
        .unwrap();
    // The client skews isolation mid-transaction.
    engine
        .set_transaction_isolation(session, IsolationLevel::Serializable)
        .await
        .unwrap();
    engine.xa_end(session, &x1, XaEndFlags::Success).await.unwrap();
    assert_eq!(engine.xa_prepare(session, &x1).await.unwrap(), XaVote::Ok);
    engine.xa_commit(session, &x1, false).await.unwrap();
    assert_eq!(engine.tx_registry().state(&x1).await, TxState::Committed);

    // Sanitization restored the configured default on the same handle.
    let guard = engine.sessions().get(&session).unwrap();
    let backend = guard.backend().lock().await;
    let logical = backend.as_ref().unwrap().connection();
    assert_eq!(logical.transaction_isolation(), IsolationLevel::ReadCommitted);
    drop(backend);

    // A second transaction starts cleanly; no protocol error surfaces.
    let x2 = xid(b"second");
    engine
        .xa_start(session, &x2, XaStartFlags::NoFlags)
        .await
        .unwrap();
    engine.xa_end(session, &x2, XaEndFlags::Success).await.unwrap();
    engine.xa_commit(session, &x2, true).await.unwrap();
    assert_eq!(engine.tx_registry().state(&x2).await, TxState::Committed);
}

#[tokio::test]
async fn prepared_branch_pins_backend_session() {
    // Aggressive recycling settings: anything unpinned and idle would be
    // destroyed by the sweep below.
    let mut settings = PoolSettings::new(ConnectionSettings::new("jdbc:mem:xa", "app", "s"));
    settings.max_pool_size = 2;
    settings.min_idle = 0;
    settings.idle_timeout = Duration::from_millis(1);
    settings.max_lifetime = Duration::from_millis(1);
    settings.idle_before_recycle = Duration::ZERO;
    settings.connection_timeout = Duration::from_millis(100);

    // Housekeeping runs every few milliseconds so eviction sweeps and
    // validation actually fire while the branch sits prepared.
    let pool = XaBackendPool::open(
        "pinning",
        Arc::new(MemoryXaDataSource::new("jdbc:mem:xa")),
        settings,
        LeakDetectionConfig {
            interval: Duration::from_millis(2),
            timeout: Duration::from_secs(300),
            enhanced: false,
        },
        DiagnosticsConfig {
            enabled: false,
            interval: Duration::from_secs(60),
        },
    )
    .await
    .unwrap();

    let registry = TxRegistry::new();
    let entry = pool.borrow().await.unwrap();
    let backend_session = Arc::clone(entry.resource());
    let logical = backend_session.logical();

    let x = xid(b"pinned");
    registry
        .start(&x, XaStartFlags::NoFlags, &entry, Uuid::new_v4(), None)
        .await
        .unwrap();
    registry.end(&x, XaEndFlags::Success).await.unwrap();
    registry.prepare(&x).await.unwrap();
    assert!(backend_session.is_pinned());

    // A return attempt while prepared is refused outright.
    pool.give_back(Arc::clone(&entry)).await;
    assert_eq!(pool.statistics().active, 1);
    assert_eq!(pool.statistics().idle, 0);

    tokio::time::sleep(Duration::from_millis(10)).await;
    // The session survived recycling pressure: still open, still valid.
    assert!(logical.is_valid(Duration::from_secs(1)).await);
    assert_eq!(pool.statistics().destroyed, 0);

    // Resolution unpins; the session becomes eligible for pool return.
    registry.rollback(&x).await.unwrap();
    assert_eq!(registry.state(&x).await, TxState::RolledBack);
    assert!(!backend_session.is_pinned());
    pool.give_back(entry).await;
    assert_eq!(pool.statistics().active, 0);
}

#[tokio::test]
async fn terminal_branch_rejects_further_operations() {
    let engine = ProxyEngine::with_default_providers(quiet_config(), PropertySource::default());
    let session = engine
        .connect(Uuid::new_v4(), "jdbc:mem:bank", "app", "secret", None, true)
        .await
        .unwrap();

    let x = xid(b"done");
    engine
        .xa_start(session, &x, XaStartFlags::NoFlags)
        .await
        .unwrap();
    engine.xa_end(session, &x, XaEndFlags::Success).await.unwrap();
    engine.xa_commit(session, &x, true).await.unwrap();

    let err = engine.xa_commit(session, &x, true).await.unwrap_err();
    assert_eq!(err.kind(), "XA_NOT_ASSOCIATED");
    let err = engine
        .xa_start(session, &x, XaStartFlags::Join)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "XA_NOT_ASSOCIATED");
}
