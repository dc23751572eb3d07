// Per-branch transaction registry.
//
// One `TxContext` per branch, published through a concurrent map and
// guarded by its own async lock: concurrent calls on the same xid are
// linearized, and no operation ever takes two context locks at once.
// Terminal contexts stay registered (bound but complete) until the owning
// logical session unbinds; operations on them report the xid as no longer
// associated.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{XaEndFlags, XaStartFlags, XaVote, Xid};
use crate::error::{OjpError, Result};
use crate::pool::xa::PooledXaSession;

use super::state::TxState;

struct TxContext {
    xid: Xid,
    state: TxState,
    session: PooledXaSession,
    owner_session: Uuid,
    deadline: Option<Instant>,
    read_only_hint: bool,
    association_count: u32,
    created_at: Instant,
    last_access: Instant,
    transaction_complete: bool,
}

/// Read-only view of a branch, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct TxContextSnapshot {
    pub xid: Xid,
    pub state: TxState,
    pub backend_session_id: Uuid,
    pub association_count: u32,
    pub transaction_complete: bool,
    pub age: Duration,
}

/// Registry of active XA branches.
#[derive(Default)]
pub struct TxRegistry {
    contexts: DashMap<Xid, Arc<Mutex<TxContext>>>,
}

impl TxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `xaStart`. For a new branch (no flags) the backend session already
    /// bound to the calling logical session is reused, so sequential
    /// transactions on one session share one physical connection.
    pub async fn start(
        &self,
        xid: &Xid,
        flags: XaStartFlags,
        session: &PooledXaSession,
        owner_session: Uuid,
        timeout: Option<Duration>,
    ) -> Result<()> {
        match flags {
            XaStartFlags::NoFlags => {
                if self.contexts.contains_key(xid) {
                    return Err(OjpError::XaProtocol(format!(
                        "duplicate xid on start: {xid}"
                    )));
                }
                session
                    .resource()
                    .xa_resource()
                    .start(xid, XaStartFlags::NoFlags)
                    .await?;
                let now = Instant::now();
                let ctx = TxContext {
                    xid: xid.clone(),
                    state: TxState::Active,
                    session: Arc::clone(session),
                    owner_session,
                    deadline: timeout.map(|t| now + t),
                    read_only_hint: false,
                    association_count: 1,
                    created_at: now,
                    last_access: now,
                    transaction_complete: false,
                };
                self.contexts.insert(xid.clone(), Arc::new(Mutex::new(ctx)));
                Ok(())
            }
            XaStartFlags::Join => {
                let ctx = self.context(xid)?;
                let mut ctx = ctx.lock().await;
                self.check_live(&ctx)?;
                if ctx.state != TxState::Active {
                    return Err(OjpError::XaProtocol(format!(
                        "cannot join branch {xid} in state {}",
                        ctx.state
                    )));
                }
                ctx.session
                    .resource()
                    .xa_resource()
                    .start(xid, XaStartFlags::Join)
                    .await?;
                ctx.association_count += 1;
                ctx.last_access = Instant::now();
                Ok(())
            }
            XaStartFlags::Resume => {
                let ctx = self.context(xid)?;
                let mut ctx = ctx.lock().await;
                self.check_live(&ctx)?;
                if ctx.state != TxState::Ended {
                    return Err(OjpError::XaProtocol(format!(
                        "cannot resume branch {xid} in state {}",
                        ctx.state
                    )));
                }
                ctx.session
                    .resource()
                    .xa_resource()
                    .start(xid, XaStartFlags::Resume)
                    .await?;
                ctx.state = TxState::Active;
                ctx.last_access = Instant::now();
                Ok(())
            }
        }
    }

    /// `xaEnd`. Success, fail and suspend all move the branch to Ended.
    pub async fn end(&self, xid: &Xid, flags: XaEndFlags) -> Result<()> {
        let ctx = self.context(xid)?;
        let mut ctx = ctx.lock().await;
        self.check_live(&ctx)?;
        if ctx.state != TxState::Active {
            return Err(OjpError::XaProtocol(format!(
                "cannot end branch {xid} in state {}",
                ctx.state
            )));
        }
        ctx.session
            .resource()
            .xa_resource()
            .end(xid, flags)
            .await?;
        ctx.state = TxState::Ended;
        ctx.last_access = Instant::now();
        Ok(())
    }

    /// `xaPrepare`. Delegates the durability decision to the backend; on
    /// XA_OK the backend session is pinned until the branch resolves.
    pub async fn prepare(&self, xid: &Xid) -> Result<XaVote> {
        let ctx = self.context(xid)?;
        let mut ctx = ctx.lock().await;
        self.check_live(&ctx)?;
        self.check_deadline(&ctx)?;
        if ctx.state != TxState::Ended {
            return Err(OjpError::XaProtocol(format!(
                "cannot prepare branch {xid} in state {}",
                ctx.state
            )));
        }
        let vote = ctx.session.resource().xa_resource().prepare(xid).await?;
        match vote {
            XaVote::Ok => {
                ctx.state = TxState::Prepared;
                ctx.session.resource().pin();
            }
            XaVote::ReadOnly => {
                // Nothing to commit; the branch is already complete.
                ctx.read_only_hint = true;
                self.complete(&mut ctx, TxState::Committed).await;
            }
        }
        ctx.last_access = Instant::now();
        Ok(vote)
    }

    /// `xaCommit`, one-phase from Ended or two-phase from Prepared.
    pub async fn commit(&self, xid: &Xid, one_phase: bool) -> Result<()> {
        let ctx = self.context(xid)?;
        let mut ctx = ctx.lock().await;
        self.check_live(&ctx)?;
        self.check_deadline(&ctx)?;
        let legal = if one_phase {
            ctx.state == TxState::Ended
        } else {
            ctx.state == TxState::Prepared
        };
        if !legal {
            return Err(OjpError::XaProtocol(format!(
                "cannot {} branch {xid} in state {}",
                if one_phase { "one-phase commit" } else { "commit" },
                ctx.state
            )));
        }
        ctx.session
            .resource()
            .xa_resource()
            .commit(xid, one_phase)
            .await?;
        self.complete(&mut ctx, TxState::Committed).await;
        Ok(())
    }

    /// `xaRollback`, legal from Active, Ended and Prepared.
    pub async fn rollback(&self, xid: &Xid) -> Result<()> {
        let ctx = self.context(xid)?;
        let mut ctx = ctx.lock().await;
        self.check_live(&ctx)?;
        if !ctx.state.can_roll_back() {
            return Err(OjpError::XaProtocol(format!(
                "cannot roll back branch {xid} in state {}",
                ctx.state
            )));
        }
        ctx.session
            .resource()
            .xa_resource()
            .rollback(xid)
            .await?;
        self.complete(&mut ctx, TxState::RolledBack).await;
        Ok(())
    }

    /// `xaForget`: drops a resolved branch from the registry.
    pub async fn forget(&self, xid: &Xid) -> Result<()> {
        let ctx = self.context(xid)?;
        {
            let ctx = ctx.lock().await;
            if !ctx.state.is_terminal() {
                return Err(OjpError::XaProtocol(format!(
                    "cannot forget branch {xid} in state {}",
                    ctx.state
                )));
            }
            ctx.session
                .resource()
                .xa_resource()
                .forget(xid)
                .await?;
        }
        self.contexts.remove(xid);
        Ok(())
    }

    /// Branch state as the registry sees it.
    pub async fn state(&self, xid: &Xid) -> TxState {
        match self.contexts.get(xid) {
            None => TxState::Nonexistent,
            Some(ctx) => ctx.lock().await.state,
        }
    }

    pub async fn snapshot(&self, xid: &Xid) -> Option<TxContextSnapshot> {
        let ctx = self.contexts.get(xid).map(|c| Arc::clone(c.value()))?;
        let ctx = ctx.lock().await;
        Some(TxContextSnapshot {
            xid: ctx.xid.clone(),
            state: ctx.state,
            backend_session_id: ctx.session.resource().session_id(),
            association_count: ctx.association_count,
            transaction_complete: ctx.transaction_complete,
            age: ctx.created_at.elapsed(),
        })
    }

    /// The backend session a statement carrying this xid must run on.
    pub async fn bound_session(&self, xid: &Xid) -> Result<PooledXaSession> {
        let ctx = self.context(xid)?;
        let ctx = ctx.lock().await;
        self.check_live(&ctx)?;
        Ok(Arc::clone(&ctx.session))
    }

    /// Xids currently sitting in Prepared.
    pub async fn prepared_xids(&self) -> Vec<Xid> {
        let mut out = Vec::new();
        let contexts: Vec<Arc<Mutex<TxContext>>> =
            self.contexts.iter().map(|e| Arc::clone(e.value())).collect();
        for ctx in contexts {
            let ctx = ctx.lock().await;
            if ctx.state == TxState::Prepared {
                out.push(ctx.xid.clone());
            }
        }
        out
    }

    /// Rolls back every live branch owned by a terminating logical session
    /// and unbinds its completed ones. Prepared branches are left for the
    /// transaction manager's recovery pass.
    pub async fn release_session(&self, owner_session: Uuid) -> Vec<Xid> {
        let owned: Vec<(Xid, Arc<Mutex<TxContext>>)> = self
            .contexts
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut rolled_back = Vec::new();
        for (xid, ctx_arc) in owned {
            let mut ctx = ctx_arc.lock().await;
            if ctx.owner_session != owner_session {
                continue;
            }
            match ctx.state {
                TxState::Active | TxState::Ended => {
                    if let Err(e) = ctx
                        .session
                        .resource()
                        .xa_resource()
                        .rollback(&xid)
                        .await
                    {
                        warn!(xid = %xid, error = %e, "rollback of abandoned branch failed");
                    }
                    self.complete(&mut ctx, TxState::RolledBack).await;
                    rolled_back.push(xid.clone());
                    drop(ctx);
                    self.contexts.remove(&xid);
                }
                TxState::Prepared => {
                    warn!(xid = %xid, "session terminating with prepared branch; awaiting recovery");
                }
                _ => {
                    drop(ctx);
                    self.contexts.remove(&xid);
                }
            }
        }
        rolled_back
    }

    fn context(&self, xid: &Xid) -> Result<Arc<Mutex<TxContext>>> {
        self.contexts
            .get(xid)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| OjpError::NotAssociated(xid.to_string()))
    }

    /// Terminal contexts are still registered but no longer associated.
    fn check_live(&self, ctx: &TxContext) -> Result<()> {
        if ctx.state.is_terminal() {
            return Err(OjpError::NotAssociated(ctx.xid.to_string()));
        }
        Ok(())
    }

    fn check_deadline(&self, ctx: &TxContext) -> Result<()> {
        if let Some(deadline) = ctx.deadline {
            if Instant::now() > deadline {
                return Err(OjpError::TransactionTimeout(
                    deadline.duration_since(ctx.created_at),
                ));
            }
        }
        Ok(())
    }

    /// Terminal transition bookkeeping: unpin, sanitize on the same
    /// logical handle, mark complete. The backend session stays bound to
    /// its logical session; it is NOT returned to the pool here.
    async fn complete(&self, ctx: &mut TxContext, terminal: TxState) {
        debug_assert!(terminal.is_terminal());
        ctx.state = terminal;
        ctx.transaction_complete = true;
        ctx.session.resource().unpin();
        if let Err(e) = ctx.session.resource().sanitize_after_transaction().await {
            warn!(xid = %ctx.xid, error = %e, "post-transaction sanitize failed");
        }
        ctx.last_access = Instant::now();
        debug!(xid = %ctx.xid, state = %ctx.state, "branch resolved");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryXaDataSource;
    use crate::backend::ConnectionSettings;
    use crate::config::{DiagnosticsConfig, LeakDetectionConfig};
    use crate::pool::provider::XaSessionPool;
    use crate::pool::xa::XaBackendPool;
    use crate::pool::PoolSettings;

    async fn pool() -> XaBackendPool {
        let mut settings = PoolSettings::new(ConnectionSettings::new("jdbc:mem:xa", "u", "p"));
        settings.max_pool_size = 2;
        settings.connection_timeout = Duration::from_millis(100);
        XaBackendPool::open(
            "xa-reg-test",
            Arc::new(MemoryXaDataSource::new("jdbc:mem:xa")),
            settings,
            LeakDetectionConfig {
                interval: Duration::ZERO,
                timeout: Duration::from_secs(300),
                enhanced: false,
            },
            DiagnosticsConfig {
                enabled: false,
                interval: Duration::from_secs(60),
            },
        )
        .await
        .unwrap()
    }

    fn xid(tag: u8) -> Xid {
        Xid::new(0x4F4A50, vec![tag; 8], vec![1])
    }

    #[tokio::test]
    async fn test_full_two_phase_lifecycle() {
        let pool = pool().await;
        let session = pool.borrow().await.unwrap();
        let registry = TxRegistry::new();
        let owner = Uuid::new_v4();
        let x = xid(1);

        registry
            .start(&x, XaStartFlags::NoFlags, &session, owner, None)
            .await
            .unwrap();
        assert_eq!(registry.state(&x).await, TxState::Active);

        registry.end(&x, XaEndFlags::Success).await.unwrap();
        assert_eq!(registry.state(&x).await, TxState::Ended);

        assert_eq!(registry.prepare(&x).await.unwrap(), XaVote::Ok);
        assert_eq!(registry.state(&x).await, TxState::Prepared);
        assert!(session.resource().is_pinned());

        registry.commit(&x, false).await.unwrap();
        assert_eq!(registry.state(&x).await, TxState::Committed);
        assert!(!session.resource().is_pinned());

        // Terminal branch is no longer associated.
        let err = registry.end(&x, XaEndFlags::Success).await.unwrap_err();
        assert!(matches!(err, OjpError::NotAssociated(_)));
    }

    #[tokio::test]
    async fn test_one_phase_commit_from_ended() {
        let pool = pool().await;
        let session = pool.borrow().await.unwrap();
        let registry = TxRegistry::new();
        let x = xid(2);

        registry
            .start(&x, XaStartFlags::NoFlags, &session, Uuid::new_v4(), None)
            .await
            .unwrap();
        registry.end(&x, XaEndFlags::Success).await.unwrap();
        registry.commit(&x, true).await.unwrap();
        assert_eq!(registry.state(&x).await, TxState::Committed);
    }

    #[tokio::test]
    async fn test_two_phase_commit_requires_prepare() {
        let pool = pool().await;
        let session = pool.borrow().await.unwrap();
        let registry = TxRegistry::new();
        let x = xid(3);

        registry
            .start(&x, XaStartFlags::NoFlags, &session, Uuid::new_v4(), None)
            .await
            .unwrap();
        registry.end(&x, XaEndFlags::Success).await.unwrap();

        let err = registry.commit(&x, false).await.unwrap_err();
        assert!(matches!(err, OjpError::XaProtocol(_)));
    }

    #[tokio::test]
    async fn test_join_and_resume() {
        let pool = pool().await;
        let session = pool.borrow().await.unwrap();
        let registry = TxRegistry::new();
        let owner = Uuid::new_v4();
        let x = xid(4);

        registry
            .start(&x, XaStartFlags::NoFlags, &session, owner, None)
            .await
            .unwrap();
        registry
            .start(&x, XaStartFlags::Join, &session, owner, None)
            .await
            .unwrap();
        assert_eq!(registry.snapshot(&x).await.unwrap().association_count, 2);

        registry.end(&x, XaEndFlags::Suspend).await.unwrap();
        registry
            .start(&x, XaStartFlags::Resume, &session, owner, None)
            .await
            .unwrap();
        assert_eq!(registry.state(&x).await, TxState::Active);
    }

    #[tokio::test]
    async fn test_duplicate_start_rejected() {
        let pool = pool().await;
        let session = pool.borrow().await.unwrap();
        let registry = TxRegistry::new();
        let x = xid(5);

        registry
            .start(&x, XaStartFlags::NoFlags, &session, Uuid::new_v4(), None)
            .await
            .unwrap();
        let err = registry
            .start(&x, XaStartFlags::NoFlags, &session, Uuid::new_v4(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, OjpError::XaProtocol(_)));
    }

    #[tokio::test]
    async fn test_unknown_xid_not_associated() {
        let registry = TxRegistry::new();
        let err = registry.end(&xid(6), XaEndFlags::Success).await.unwrap_err();
        assert!(matches!(err, OjpError::NotAssociated(_)));
        assert_eq!(registry.state(&xid(6)).await, TxState::Nonexistent);
    }

    #[tokio::test]
    async fn test_direct_rollback_from_active() {
        let pool = pool().await;
        let session = pool.borrow().await.unwrap();
        let registry = TxRegistry::new();
        let x = xid(7);

        registry
            .start(&x, XaStartFlags::NoFlags, &session, Uuid::new_v4(), None)
            .await
            .unwrap();
        registry.rollback(&x).await.unwrap();
        assert_eq!(registry.state(&x).await, TxState::RolledBack);
    }

    #[tokio::test]
    async fn test_prepared_rollback_unpins() {
        let pool = pool().await;
        let session = pool.borrow().await.unwrap();
        let registry = TxRegistry::new();
        let x = xid(8);

        registry
            .start(&x, XaStartFlags::NoFlags, &session, Uuid::new_v4(), None)
            .await
            .unwrap();
        registry.end(&x, XaEndFlags::Success).await.unwrap();
        registry.prepare(&x).await.unwrap();
        assert!(session.resource().is_pinned());
        assert_eq!(registry.prepared_xids().await, vec![x.clone()]);

        registry.rollback(&x).await.unwrap();
        assert!(!session.resource().is_pinned());
        assert!(registry.prepared_xids().await.is_empty());
    }

    #[tokio::test]
    async fn test_sanitize_runs_after_completion() {
        let pool = pool().await;
        let session = pool.borrow().await.unwrap();
        let registry = TxRegistry::new();
        let x = xid(9);

        let logical = session.resource().logical();
        logical
            .set_transaction_isolation(crate::backend::IsolationLevel::Serializable)
            .await
            .unwrap();

        registry
            .start(&x, XaStartFlags::NoFlags, &session, Uuid::new_v4(), None)
            .await
            .unwrap();
        registry.end(&x, XaEndFlags::Success).await.unwrap();
        registry.commit(&x, true).await.unwrap();

        assert_eq!(
            logical.transaction_isolation(),
            crate::backend::IsolationLevel::ReadCommitted
        );
    }

    #[tokio::test]
    async fn test_release_session_rolls_back_live_branches() {
        let pool = pool().await;
        let session = pool.borrow().await.unwrap();
        let registry = TxRegistry::new();
        let owner = Uuid::new_v4();
        let x = xid(10);

        registry
            .start(&x, XaStartFlags::NoFlags, &session, owner, None)
            .await
            .unwrap();
        let rolled_back = registry.release_session(owner).await;
        assert_eq!(rolled_back, vec![x.clone()]);
        assert_eq!(registry.state(&x).await, TxState::Nonexistent);
    }

    #[tokio::test]
    async fn test_expired_deadline_blocks_commit() {
        let pool = pool().await;
        let session = pool.borrow().await.unwrap();
        let registry = TxRegistry::new();
        let x = xid(11);

        registry
            .start(
                &x,
                XaStartFlags::NoFlags,
                &session,
                Uuid::new_v4(),
                Some(Duration::from_millis(1)),
            )
            .await
            .unwrap();
        registry.end(&x, XaEndFlags::Success).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = registry.commit(&x, true).await.unwrap_err();
        assert!(matches!(err, OjpError::TransactionTimeout(_)));
        // Rollback is still legal after expiry.
        registry.rollback(&x).await.unwrap();
    }
}
