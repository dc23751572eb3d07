// Client-side multinode dispatcher.
//
// Owns one channel per proxy endpoint, routes each new logical connection
// to the least-loaded healthy endpoint, and keeps every call for a session
// on the channel that created it. There is no silent failover: per-session
// server state cannot be migrated, so a dead sticky server surfaces as a
// failed session and only new connections route elsewhere.

pub mod channel;
pub mod client;
pub mod endpoint;
pub mod url;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{XaRecoverScan, Xid};
use crate::error::{OjpError, Result};
use crate::session::ConnHash;
use crate::wire::{Request, Response, SessionInfo};

pub use channel::{ChannelFactory, ProxyChannel, TcpChannel, TcpChannelFactory};
pub use client::{ClientSession, ProxyClient, QueryRows};
pub use endpoint::{Endpoint, EndpointSnapshot};
pub use url::{EndpointAddr, OjpUrl};

/// Dispatcher tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Cluster-wide pool budget per conn hash, split across healthy nodes.
    pub global_max_pool_size: usize,
    pub min_idle_per_node: usize,
    /// Gates background reconnect probes only; explicit connects always
    /// try immediately.
    pub retry_delay: Duration,
    /// One-shot retry delay for endpoints that fail the initial probe.
    pub init_retry_delay: Duration,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            global_max_pool_size: 10,
            min_idle_per_node: 1,
            retry_delay: Duration::from_secs(5),
            init_retry_delay: Duration::from_secs(2),
        }
    }
}

struct Node {
    index: usize,
    endpoint: Endpoint,
    channel: tokio::sync::RwLock<Option<Arc<dyn ProxyChannel>>>,
}

impl Node {
    async fn channel(&self) -> Option<Arc<dyn ProxyChannel>> {
        self.channel.read().await.clone()
    }
}

/// Load-aware, sticky, health-tracking client dispatcher.
pub struct MultinodeDispatcher {
    client_uuid: Uuid,
    url: OjpUrl,
    nodes: Vec<Arc<Node>>,
    factory: Arc<dyn ChannelFactory>,
    options: DispatcherOptions,
    /// Session UUID -> node index. All calls for a session go there.
    sticky: DashMap<Uuid, usize>,
    /// Conn hashes this client has opened, for pool rebalancing.
    conn_hashes: DashMap<String, ()>,
    round_robin: AtomicUsize,
    rebalance_pending: AtomicBool,
    prober: Mutex<Option<JoinHandle<()>>>,
}

impl MultinodeDispatcher {
    /// Opens channels to every endpoint concurrently, retrying failures
    /// once after the init delay, and reports the resulting coverage.
    pub async fn connect_cluster(
        factory: Arc<dyn ChannelFactory>,
        url: OjpUrl,
        options: DispatcherOptions,
    ) -> Arc<Self> {
        let nodes: Vec<Arc<Node>> = url
            .endpoints
            .iter()
            .enumerate()
            .map(|(index, addr)| {
                Arc::new(Node {
                    index,
                    endpoint: Endpoint::new(addr.clone()),
                    channel: tokio::sync::RwLock::new(None),
                })
            })
            .collect();

        let dispatcher = Arc::new(Self {
            client_uuid: Uuid::new_v4(),
            url,
            nodes,
            factory,
            options,
            sticky: DashMap::new(),
            conn_hashes: DashMap::new(),
            round_robin: AtomicUsize::new(0),
            rebalance_pending: AtomicBool::new(false),
            prober: Mutex::new(None),
        });

        let attempts: Vec<_> = dispatcher
            .nodes
            .iter()
            .map(|node| dispatcher.try_open(Arc::clone(node)))
            .collect();
        futures::future::join_all(attempts).await;

        if dispatcher.connected_count() < dispatcher.nodes.len() {
            tokio::time::sleep(dispatcher.options.init_retry_delay).await;
            let retries: Vec<_> = dispatcher
                .nodes
                .iter()
                .filter(|n| !n.endpoint.is_healthy())
                .map(|node| dispatcher.try_open(Arc::clone(node)))
                .collect();
            futures::future::join_all(retries).await;
        }

        info!(
            "Connected to {} out of {} servers",
            dispatcher.connected_count(),
            dispatcher.nodes.len()
        );
        if let Err(e) = dispatcher.rebalance().await {
            warn!(error = %e, "initial pool rebalance failed");
        }
        dispatcher
    }

    pub fn client_uuid(&self) -> Uuid {
        self.client_uuid
    }

    pub fn native_url(&self) -> &str {
        &self.url.native_url
    }

    pub fn connected_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.endpoint.is_healthy()).count()
    }

    pub fn snapshots(&self) -> Vec<EndpointSnapshot> {
        self.nodes.iter().map(|n| n.endpoint.snapshot()).collect()
    }

    /// Opens a logical connection on the best endpoint and returns its
    /// session address.
    ///
    /// An explicit connect ignores the probe retry delay: every unhealthy
    /// endpoint gets one immediate reconnect attempt before selection.
    pub async fn open_session(
        &self,
        user: &str,
        password: &str,
        datasource: Option<&str>,
        is_xa: bool,
    ) -> Result<SessionInfo> {
        for node in &self.nodes {
            if !node.endpoint.is_healthy() {
                self.try_open(Arc::clone(node)).await;
            }
        }

        let conn_hash = ConnHash::compute(
            &self.url.native_url,
            user,
            password,
            is_xa,
            datasource,
        );
        self.conn_hashes
            .insert(conn_hash.as_str().to_string(), ());

        let candidates = self.selection_order().await;
        if candidates.is_empty() {
            return Err(OjpError::Unavailable(
                "no healthy proxy endpoint".to_string(),
            ));
        }

        let mut health_changed = false;
        let mut last_error = None;
        for node in candidates {
            match self
                .connect_on(&node, &conn_hash, user, password, datasource, is_xa)
                .await
            {
                Ok(session) => {
                    if health_changed {
                        self.request_rebalance().await;
                    }
                    return Ok(session);
                }
                Err(e) if e.is_transient() => {
                    warn!(endpoint = %node.endpoint.addr(), error = %e, "connect failed");
                    node.endpoint.mark_unhealthy();
                    health_changed = true;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        if health_changed {
            self.request_rebalance().await;
        }
        Err(last_error
            .unwrap_or_else(|| OjpError::Unavailable("no endpoint accepted the connection".into())))
    }

    /// Connects on one specific node.
    async fn connect_on(
        &self,
        node: &Arc<Node>,
        conn_hash: &ConnHash,
        user: &str,
        password: &str,
        datasource: Option<&str>,
        is_xa: bool,
    ) -> Result<SessionInfo> {
        let channel = node.channel().await.ok_or_else(|| {
            OjpError::TransientBackend(format!("no channel to {}", node.endpoint.addr()))
        })?;
        let request = Request::Connect {
            session: SessionInfo {
                client_uuid: self.client_uuid,
                session_uuid: None,
                conn_hash: conn_hash.as_str().to_string(),
                is_xa,
            },
            native_url: self.url.native_url.clone(),
            user: user.to_string(),
            password: password.to_string(),
            datasource: datasource.map(str::to_string),
        };
        match channel.call(request).await? {
            Response::Connected { session_uuid } => {
                node.endpoint.mark_healthy();
                node.endpoint.conn_opened();
                self.sticky.insert(session_uuid, node.index);
                debug!(
                    session = %session_uuid,
                    endpoint = %node.endpoint.addr(),
                    "session opened"
                );
                Ok(SessionInfo {
                    client_uuid: self.client_uuid,
                    session_uuid: Some(session_uuid),
                    conn_hash: conn_hash.as_str().to_string(),
                    is_xa,
                })
            }
            // The server answered; this is an application error, not an
            // endpoint health event.
            Response::Error { kind, message, .. } => {
                Err(OjpError::Unavailable(format!("{kind}: {message}")))
            }
            other => Err(OjpError::Wire(format!(
                "unexpected connect response: {other:?}"
            ))),
        }
    }

    /// Sends a session-addressed request to that session's sticky server.
    pub async fn call(&self, session_uuid: Uuid, request: Request) -> Result<Response> {
        let node_index = *self
            .sticky
            .get(&session_uuid)
            .ok_or_else(|| OjpError::StaleSession(session_uuid.to_string()))?;
        let node = &self.nodes[node_index];
        let channel = node.channel().await.ok_or_else(|| {
            OjpError::StaleSession(format!(
                "sticky server {} is down",
                node.endpoint.addr()
            ))
        })?;

        match channel.call(request).await {
            Ok(response) => {
                node.endpoint.mark_healthy();
                Ok(response)
            }
            Err(e) => {
                // The sticky server failed mid-session; the session cannot
                // be migrated, so it is surfaced as failed.
                warn!(endpoint = %node.endpoint.addr(), error = %e, "sticky server failed");
                node.endpoint.mark_unhealthy();
                *node.channel.write().await = None;
                self.sticky.remove(&session_uuid);
                node.endpoint.conn_closed();
                self.request_rebalance().await;
                Err(OjpError::StaleSession(format!(
                    "session {session_uuid} lost: {e}"
                )))
            }
        }
    }

    /// Terminates a session and releases its stickiness.
    pub async fn close_session(&self, info: &SessionInfo) -> Result<()> {
        let session_uuid = info
            .session_uuid
            .ok_or_else(|| OjpError::StaleSession("session has no UUID".into()))?;
        let response = self
            .call(
                session_uuid,
                Request::TerminateSession {
                    session: info.clone(),
                },
            )
            .await?;
        if let Some((_, node_index)) = self.sticky.remove(&session_uuid) {
            self.nodes[node_index].endpoint.conn_closed();
        }
        match response {
            Response::Terminated => Ok(()),
            Response::Error { kind, message, .. } => {
                Err(OjpError::Unavailable(format!("{kind}: {message}")))
            }
            other => Err(OjpError::Wire(format!("unexpected response: {other:?}"))),
        }
    }

    /// Union of prepared xids across every healthy node, for the
    /// transaction manager's recovery cycle.
    pub async fn broadcast_recover(
        &self,
        user: &str,
        password: &str,
        datasource: Option<&str>,
    ) -> Result<Vec<Xid>> {
        let conn_hash = ConnHash::compute(&self.url.native_url, user, password, true, datasource);
        let mut xids: Vec<Xid> = Vec::new();
        for node in &self.nodes {
            if !node.endpoint.is_healthy() {
                continue;
            }
            let session = match self
                .connect_on(node, &conn_hash, user, password, datasource, true)
                .await
            {
                Ok(session) => session,
                Err(e) => {
                    warn!(endpoint = %node.endpoint.addr(), error = %e, "recover connect failed");
                    continue;
                }
            };
            let session_uuid = session.session_uuid.expect("connected session has a UUID");
            let response = self
                .call(
                    session_uuid,
                    Request::XaRecover {
                        session: session.clone(),
                        scan: XaRecoverScan::Start,
                    },
                )
                .await;
            if let Ok(Response::XaRecovered { xids: found }) = response {
                for xid in found {
                    if !xids.contains(&xid) {
                        xids.push(xid);
                    }
                }
            }
            let _ = self.close_session(&session).await;
        }
        Ok(xids)
    }

    /// Starts the background reconnect prober. Probes honor the retry
    /// delay; a pending failed rebalance is retried on every tick.
    pub fn start_health_probes(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let retry_delay = self.options.retry_delay;
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(retry_delay);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(dispatcher) = weak.upgrade() else { break };

                let mut changed = false;
                for node in &dispatcher.nodes {
                    if node.endpoint.is_healthy() {
                        continue;
                    }
                    let due = node
                        .endpoint
                        .since_last_failure()
                        .map(|age| age >= retry_delay)
                        .unwrap_or(true);
                    if due && dispatcher.try_open(Arc::clone(node)).await {
                        changed = true;
                    }
                }
                if changed || dispatcher.rebalance_pending.load(Ordering::SeqCst) {
                    dispatcher.request_rebalance().await;
                }
            }
        });
        *self.prober.lock() = Some(handle);
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.prober.lock().take() {
            handle.abort();
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Opens (or re-opens) a node's channel; returns true on success.
    async fn try_open(&self, node: Arc<Node>) -> bool {
        match self.factory.open(node.endpoint.addr()).await {
            Ok(channel) => {
                *node.channel.write().await = Some(channel);
                node.endpoint.mark_healthy();
                debug!(endpoint = %node.endpoint.addr(), "channel open");
                true
            }
            Err(e) => {
                debug!(endpoint = %node.endpoint.addr(), error = %e, "channel open failed");
                node.endpoint.mark_unhealthy();
                false
            }
        }
    }

    /// Healthy nodes in preference order: lowest active-connection count
    /// first, round-robin over the deterministic endpoint order among the
    /// least-loaded tie.
    async fn selection_order(&self) -> Vec<Arc<Node>> {
        let mut healthy: Vec<Arc<Node>> = Vec::new();
        for node in &self.nodes {
            if node.endpoint.is_healthy() && node.channel().await.is_some() {
                healthy.push(Arc::clone(node));
            }
        }
        if healthy.is_empty() {
            return healthy;
        }

        // Deterministic base order, then load ascending (stable sort keeps
        // the base order inside each load class).
        healthy.sort_by_key(|n| n.index);
        healthy.sort_by_key(|n| n.endpoint.active_conns());

        // Rotate the least-loaded tie so equal endpoints alternate.
        let min_load = healthy[0].endpoint.active_conns();
        let tie_len = healthy
            .iter()
            .take_while(|n| n.endpoint.active_conns() == min_load)
            .count();
        if tie_len > 1 {
            let shift = self.round_robin.fetch_add(1, Ordering::SeqCst) % tie_len;
            healthy[..tie_len].rotate_left(shift);
        }
        healthy
    }

    /// Recomputes per-endpoint pool shares and pushes resize instructions.
    /// Any failure marks the rebalance pending for the next health tick.
    async fn request_rebalance(&self) {
        match self.rebalance().await {
            Ok(()) => self.rebalance_pending.store(false, Ordering::SeqCst),
            Err(e) => {
                warn!(error = %e, "pool rebalance failed; will retry");
                self.rebalance_pending.store(true, Ordering::SeqCst);
            }
        }
    }

    async fn rebalance(&self) -> Result<()> {
        let healthy: Vec<&Arc<Node>> = self
            .nodes
            .iter()
            .filter(|n| n.endpoint.is_healthy())
            .collect();
        if healthy.is_empty() || self.conn_hashes.is_empty() {
            return Ok(());
        }

        let share = self
            .options
            .global_max_pool_size
            .div_ceil(healthy.len())
            .max(1);
        for node in healthy {
            let Some(channel) = node.channel().await else {
                return Err(OjpError::PoolResizeFailed(format!(
                    "endpoint {} has no channel",
                    node.endpoint.addr()
                )));
            };
            for hash in self.conn_hashes.iter() {
                let response = channel
                    .call(Request::ResizePool {
                        conn_hash: hash.key().clone(),
                        max_size: share as u32,
                        min_idle: self.options.min_idle_per_node.min(share) as u32,
                    })
                    .await?;
                match response {
                    Response::PoolResized => {}
                    Response::Error { kind, message, .. } => {
                        return Err(OjpError::PoolResizeFailed(format!(
                            "{} rejected resize: {kind}: {message}",
                            node.endpoint.addr()
                        )));
                    }
                    other => {
                        return Err(OjpError::Wire(format!(
                            "unexpected resize response: {other:?}"
                        )));
                    }
                }
            }
            node.endpoint.set_target_pool_size(share);
        }
        Ok(())
    }
}

impl Drop for MultinodeDispatcher {
    fn drop(&mut self) {
        if let Some(handle) = self.prober.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{XaEndFlags, XaStartFlags};
    use crate::config::{PropertySource, ServerConfig};
    use crate::engine::ProxyEngine;
    use crate::server::handle_request;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Channel that calls an in-process engine, with a kill switch.
    struct LoopbackChannel {
        engine: Arc<ProxyEngine>,
        down: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ProxyChannel for LoopbackChannel {
        async fn call(&self, request: Request) -> Result<Response> {
            if self.down.load(Ordering::SeqCst) {
                return Err(OjpError::TransientBackend("node down".into()));
            }
            Ok(handle_request(&self.engine, request)
                .await
                .unwrap_or_else(|e| Response::from_error(&e)))
        }
    }

    struct FakeNode {
        engine: Arc<ProxyEngine>,
        down: Arc<AtomicBool>,
        remaining_open_failures: AtomicUsize,
    }

    #[derive(Default)]
    struct LoopbackFactory {
        nodes: HashMap<EndpointAddr, FakeNode>,
    }

    impl LoopbackFactory {
        fn add(&mut self, addr: EndpointAddr, open_failures: usize) -> Arc<AtomicBool> {
            let mut config = ServerConfig::default();
            config.leak_detection.interval = Duration::ZERO;
            config.session_cleanup.enabled = false;
            let down = Arc::new(AtomicBool::new(false));
            self.nodes.insert(
                addr,
                FakeNode {
                    engine: ProxyEngine::with_default_providers(
                        config,
                        PropertySource::default(),
                    ),
                    down: Arc::clone(&down),
                    remaining_open_failures: AtomicUsize::new(open_failures),
                },
            );
            down
        }

        fn engine(&self, addr: &EndpointAddr) -> Arc<ProxyEngine> {
            Arc::clone(&self.nodes[addr].engine)
        }
    }

    #[async_trait]
    impl ChannelFactory for LoopbackFactory {
        async fn open(&self, addr: &EndpointAddr) -> Result<Arc<dyn ProxyChannel>> {
            let node = self
                .nodes
                .get(addr)
                .ok_or_else(|| OjpError::TransientBackend(format!("unknown node {addr}")))?;
            let failures = node.remaining_open_failures.load(Ordering::SeqCst);
            if failures > 0 {
                node.remaining_open_failures.store(failures - 1, Ordering::SeqCst);
                return Err(OjpError::TransientBackend(format!("probe refused by {addr}")));
            }
            if node.down.load(Ordering::SeqCst) {
                return Err(OjpError::TransientBackend(format!("{addr} is down")));
            }
            Ok(Arc::new(LoopbackChannel {
                engine: Arc::clone(&node.engine),
                down: Arc::clone(&node.down),
            }))
        }
    }

    fn addr(tag: &str) -> EndpointAddr {
        EndpointAddr::new(tag, 1059)
    }

    fn cluster_url(hosts: &[&str]) -> OjpUrl {
        OjpUrl {
            endpoints: hosts.iter().map(|h| addr(h)).collect(),
            native_url: "jdbc:mem:cluster".to_string(),
        }
    }

    fn fast_options() -> DispatcherOptions {
        DispatcherOptions {
            global_max_pool_size: 10,
            min_idle_per_node: 1,
            retry_delay: Duration::from_secs(300),
            init_retry_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_connections_spread_by_load_with_round_robin_ties() {
        let mut factory = LoopbackFactory::default();
        factory.add(addr("a"), 0);
        factory.add(addr("b"), 0);
        let dispatcher = MultinodeDispatcher::connect_cluster(
            Arc::new(factory),
            cluster_url(&["a", "b"]),
            fast_options(),
        )
        .await;
        assert_eq!(dispatcher.connected_count(), 2);

        for _ in 0..4 {
            dispatcher
                .open_session("app", "secret", None, false)
                .await
                .unwrap();
        }
        let loads: Vec<usize> = dispatcher
            .snapshots()
            .iter()
            .map(|s| s.active_conns)
            .collect();
        assert_eq!(loads, vec![2, 2]);
    }

    #[tokio::test]
    async fn test_initial_probe_failure_retried_once() {
        let mut factory = LoopbackFactory::default();
        factory.add(addr("a"), 0);
        factory.add(addr("b"), 1);
        let dispatcher = MultinodeDispatcher::connect_cluster(
            Arc::new(factory),
            cluster_url(&["a", "b"]),
            fast_options(),
        )
        .await;
        // The one-shot init retry brought b up.
        assert_eq!(dispatcher.connected_count(), 2);
    }

    #[tokio::test]
    async fn test_explicit_connect_ignores_retry_delay() {
        let mut factory = LoopbackFactory::default();
        factory.add(addr("a"), 0);
        // b fails the initial probe and the init retry.
        factory.add(addr("b"), 2);
        let dispatcher = MultinodeDispatcher::connect_cluster(
            Arc::new(factory),
            cluster_url(&["a", "b"]),
            fast_options(),
        )
        .await;
        assert_eq!(dispatcher.connected_count(), 1);

        // Retry delay is 300 s, but the application wants a connection NOW:
        // the dispatcher reconnects b immediately and balances across both.
        dispatcher
            .open_session("app", "secret", None, false)
            .await
            .unwrap();
        dispatcher
            .open_session("app", "secret", None, false)
            .await
            .unwrap();
        assert_eq!(dispatcher.connected_count(), 2);
        let loads: Vec<usize> = dispatcher
            .snapshots()
            .iter()
            .map(|s| s.active_conns)
            .collect();
        assert_eq!(loads, vec![1, 1]);
    }

    #[tokio::test]
    async fn test_sticky_server_failure_surfaces_session() {
        let mut factory = LoopbackFactory::default();
        let down_a = factory.add(addr("a"), 0);
        factory.add(addr("b"), 0);
        let dispatcher = MultinodeDispatcher::connect_cluster(
            Arc::new(factory),
            cluster_url(&["a", "b"]),
            fast_options(),
        )
        .await;

        let session = dispatcher
            .open_session("app", "secret", None, false)
            .await
            .unwrap();
        let session_uuid = session.session_uuid.unwrap();

        down_a.store(true, Ordering::SeqCst);
        let err = dispatcher
            .call(
                session_uuid,
                Request::Commit {
                    session: session.clone(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OjpError::StaleSession(_)));

        // No silent failover: the same session stays dead.
        let err = dispatcher
            .call(session_uuid, Request::Commit { session })
            .await
            .unwrap_err();
        assert!(matches!(err, OjpError::StaleSession(_)));

        // New connections route to the surviving endpoint.
        let session = dispatcher
            .open_session("app", "secret", None, false)
            .await
            .unwrap();
        assert!(session.session_uuid.is_some());
    }

    #[tokio::test]
    async fn test_rebalance_splits_global_pool_budget() {
        let mut factory = LoopbackFactory::default();
        factory.add(addr("a"), 0);
        let down_b = factory.add(addr("b"), 0);
        let engine_a = factory.engine(&addr("a"));
        let dispatcher = MultinodeDispatcher::connect_cluster(
            Arc::new(factory),
            cluster_url(&["a", "b"]),
            fast_options(),
        )
        .await;

        let session = dispatcher
            .open_session("app", "secret", None, false)
            .await
            .unwrap();

        // Losing b retargets the full budget onto a.
        down_b.store(true, Ordering::SeqCst);
        dispatcher
            .open_session("app", "secret", None, false)
            .await
            .unwrap();

        let snapshot = &dispatcher.snapshots()[0];
        assert_eq!(snapshot.target_pool_size, 10);
        let stats = engine_a.pool_statistics(&session.conn_hash).unwrap();
        assert_eq!(stats.max, 10);
    }

    #[tokio::test]
    async fn test_broadcast_recover_unions_prepared_branches() {
        let mut factory = LoopbackFactory::default();
        factory.add(addr("a"), 0);
        factory.add(addr("b"), 0);
        let dispatcher = MultinodeDispatcher::connect_cluster(
            Arc::new(factory),
            cluster_url(&["a", "b"]),
            fast_options(),
        )
        .await;

        // Prepare one branch through the dispatcher (lands on node a).
        let session = dispatcher
            .open_session("app", "secret", None, true)
            .await
            .unwrap();
        let session_uuid = session.session_uuid.unwrap();
        let xid = Xid::new(1, b"recover-me".to_vec(), b"1".to_vec());
        for request in [
            Request::XaStart {
                session: session.clone(),
                xid: xid.clone(),
                flags: XaStartFlags::NoFlags,
            },
            Request::XaEnd {
                session: session.clone(),
                xid: xid.clone(),
                flags: XaEndFlags::Success,
            },
            Request::XaPrepare {
                session: session.clone(),
                xid: xid.clone(),
            },
        ] {
            let response = dispatcher.call(session_uuid, request).await.unwrap();
            assert!(!matches!(response, Response::Error { .. }));
        }

        let recovered = dispatcher
            .broadcast_recover("app", "secret", None)
            .await
            .unwrap();
        assert!(recovered.contains(&xid));
    }
}
