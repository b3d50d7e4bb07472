//! Periodic heartbeat sweep (§4.B "Liveness").
//!
//! Grounded directly on `clawd::agents::health::heartbeat_monitor`: a
//! `tokio::time::interval` loop that calls into the registry to evict agents
//! whose heartbeat has aged past the timeout.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::AgentRegistry;

/// Spawn the background sweep task. Period and threshold are taken from
/// [`crate::config::OrchestratorConfig`] (defaults: 30 s period, 90 s
/// threshold).
pub fn spawn(registry: Arc<AgentRegistry>, period: Duration, timeout: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            match registry.evict_stale(timeout).await {
                Ok(evicted) if !evicted.is_empty() => {
                    info!(count = evicted.len(), ?evicted, "evicted stale agents");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "heartbeat sweep failed");
                }
            }
        }
    })
}
