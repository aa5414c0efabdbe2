//! Process-wide keep-alive task: every `keepalive_interval_secs` (default
//! 30s), ping every live session so idle transports don't time out (spec §5).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::SessionPool;

/// Spawns the keep-alive loop. Failures from an individual ping are logged
/// and otherwise ignored: the next real fetch transparently re-establishes
/// whatever sub-connection dropped (spec §5).
pub fn spawn(pool: Arc<SessionPool>, interval: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("keep-alive task shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    ping_all(&pool).await;
                }
            }
        }
    })
}

async fn ping_all(pool: &Arc<SessionPool>) {
    for session_id in pool.live_session_ids() {
        if let Err(err) = pool.backend().ping(session_id).await {
            warn!(session = %session_id, error = %err, "keep-alive ping failed");
        }
    }
}
