//! Broker abstraction (§4.A): key/value cache, per-class priority queue,
//! pub/sub channels, distributed lock — all backed by a remote store.
//!
//! Grounded on `clawd::ipc::event::EventBroadcaster` for the pub/sub fanout
//! shape and `clawd::scheduler::queue::SchedulerQueue` for the
//! priority-vs-FIFO dequeue policy. The `Broker` trait is the seam between
//! the rest of the orchestrator and the transport; [`redis_backed::RedisBroker`]
//! is the real implementation and [`fake::FakeBroker`] is an in-memory
//! stand-in used by tests (§4.J).

pub mod fake;
pub mod message;
pub mod redis_backed;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

pub use message::{AgentMessage, Channel, SetOptions};

/// Errors from broker transport operations. Converted to
/// [`crate::error::OrchestratorError::BrokerUnavailable`] at call sites that
/// need the typed facade error.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker transport error: {0}")]
    Transport(String),
    #[error("broker connection exhausted retries: {0}")]
    ConnectFailed(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// The broker abstraction described in §4.A. Implementors maintain three
/// logical client roles internally (command, publisher, subscriber) so a
/// long-lived subscription never blocks an ordinary command.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn set(&self, key: &str, value: &str, opts: SetOptions) -> BrokerResult<()>;
    async fn get(&self, key: &str, prefix: Option<&str>) -> BrokerResult<Option<String>>;
    async fn del(&self, key: &str, prefix: Option<&str>) -> BrokerResult<()>;
    async fn exists(&self, key: &str, prefix: Option<&str>) -> BrokerResult<bool>;

    /// Enqueue a message on `class`'s queue. Messages carrying an explicit
    /// `priority` go into the sorted-set side; others go FIFO.
    async fn enqueue(&self, class: &str, msg: AgentMessage) -> BrokerResult<()>;

    /// Attempt priority-first dequeue, then a blocking FIFO pop up to
    /// `blocking_timeout`. Returns `None` on timeout with nothing ready.
    async fn dequeue(
        &self,
        class: &str,
        blocking_timeout: Duration,
    ) -> BrokerResult<Option<AgentMessage>>;

    async fn queue_length(&self, class: &str) -> BrokerResult<u64>;

    async fn move_to_dead_letter(&self, original_class: &str, msg: AgentMessage) -> BrokerResult<()>;

    async fn publish(&self, channel: Channel, payload: serde_json::Value) -> BrokerResult<()>;

    /// Subscribe to a channel. Returns a receiver fed by a background fanout
    /// task; malformed payloads are logged and dropped rather than
    /// propagated to subscribers (§4.A).
    fn subscribe(&self, channel: Channel) -> broadcast::Receiver<serde_json::Value>;

    /// Atomic set-if-absent with expiry. `true` iff the caller now holds the
    /// lock.
    async fn acquire_lock(&self, name: &str, ttl: Duration) -> BrokerResult<bool>;
    async fn release_lock(&self, name: &str) -> BrokerResult<()>;

    async fn ping(&self) -> BrokerResult<()>;

    async fn is_healthy(&self) -> bool {
        self.ping().await.is_ok()
    }
}

/// Key namespaces from §6.
pub mod keys {
    pub const REGISTRY_PREFIX: &str = "registry";
    pub const NOTIFICATIONS_PREFIX: &str = "notifications";
    pub const ALERTS_PREFIX: &str = "alerts";
    pub const LOCK_PREFIX: &str = "lock";
    pub const SESSION_PREFIX: &str = "session";

    pub const REGISTRY_TTL: std::time::Duration = std::time::Duration::from_secs(300);
    pub const NOTIFICATIONS_TTL: std::time::Duration = std::time::Duration::from_secs(86_400);
    pub const ALERTS_TTL: std::time::Duration = std::time::Duration::from_secs(604_800);
    pub const SESSION_TTL: std::time::Duration = std::time::Duration::from_secs(3_600);

    pub fn agent_key(id: &str) -> String {
        format!("agent:{id}")
    }

    pub fn notification_key(id: &str) -> String {
        format!("notification:{id}")
    }

    pub fn alert_key(id: &str) -> String {
        format!("alert:{id}")
    }
}
