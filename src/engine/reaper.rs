// Abandoned-session reaper.
//
// Periodic scan that terminates sessions inactive beyond the configured
// timeout. Activity is stamped before each operation runs, so a session
// with an in-flight call is never selected. Termination goes through the
// engine's normal terminate path: XA rollback first, then arena cleanup
// and pool return.

use std::sync::{Arc, Weak};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::ProxyEngine;

/// Spawns the reaper task, or returns None when session cleanup is
/// disabled. The task holds a weak engine reference and exits with it.
pub fn start(engine: &Arc<ProxyEngine>) -> Option<JoinHandle<()>> {
    let cleanup = engine.config().session_cleanup.clone();
    if !cleanup.enabled {
        return None;
    }

    let weak: Weak<ProxyEngine> = Arc::downgrade(engine);
    Some(tokio::spawn(async move {
        let mut tick = tokio::time::interval(cleanup.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await;
        loop {
            tick.tick().await;
            let Some(engine) = weak.upgrade() else { break };

            let stale = engine.sessions().stale_sessions(cleanup.timeout);
            if stale.is_empty() {
                debug!("reaper pass: no stale sessions");
                continue;
            }
            for session in stale {
                let id = session.session_uuid();
                warn!(
                    session = %id,
                    idle_for = ?session.idle_for(),
                    "terminating abandoned session"
                );
                if let Err(e) = engine.terminate(id).await {
                    warn!(session = %id, error = %e, "reaper terminate failed");
                }
            }
        }
    }))
}
