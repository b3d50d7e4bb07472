//! Notification Sink (§1/§4.F, external collaborator).
//!
//! The engine and facade emit structured error/alert events to this sink;
//! sink failures are caught and logged, never propagated into the engine
//! (§5, §7). [`BrokerNotificationSink`] is the default implementation,
//! publishing onto `systemEvents` and mirroring into the broker's
//! `notifications:`/`alerts:` namespaces (§6) the way
//! `clawd::events::dead_letter` persists an auxiliary record alongside its
//! primary event.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::broker::{keys, Broker, Channel, SetOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserNotification {
    pub kind: String,
    pub workflow_id: Option<String>,
    pub user_id: Option<String>,
    pub message: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemAlert {
    pub kind: String,
    pub severity: Severity,
    pub message: String,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify_user(&self, notification: UserNotification) -> anyhow::Result<()>;
    async fn system_alert(&self, alert: SystemAlert) -> anyhow::Result<()>;
}

pub struct BrokerNotificationSink {
    broker: Arc<dyn Broker>,
}

impl BrokerNotificationSink {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl NotificationSink for BrokerNotificationSink {
    async fn notify_user(&self, notification: UserNotification) -> anyhow::Result<()> {
        let id = uuid::Uuid::new_v4().to_string();
        let encoded = serde_json::to_string(&notification)?;
        self.broker
            .set(
                &keys::notification_key(&id),
                &encoded,
                SetOptions::with_ttl(keys::NOTIFICATIONS_TTL).with_prefix(keys::NOTIFICATIONS_PREFIX),
            )
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        let payload = serde_json::json!({
            "type": "userNotification",
            "id": id,
            "notification": notification,
        });
        self.broker
            .publish(Channel::SystemEvents, payload)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        Ok(())
    }

    async fn system_alert(&self, alert: SystemAlert) -> anyhow::Result<()> {
        let id = uuid::Uuid::new_v4().to_string();
        let encoded = serde_json::to_string(&alert)?;
        self.broker
            .set(
                &keys::alert_key(&id),
                &encoded,
                SetOptions::with_ttl(keys::ALERTS_TTL).with_prefix(keys::ALERTS_PREFIX),
            )
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        let payload = serde_json::json!({
            "type": "systemAlert",
            "id": id,
            "alert": alert,
        });
        self.broker
            .publish(Channel::SystemEvents, payload)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        Ok(())
    }
}

/// Best-effort fire-and-forget helper: logs rather than propagates, per
/// §5's "sink errors MUST be caught and logged, never propagated".
pub async fn notify_best_effort(sink: &dyn NotificationSink, alert: SystemAlert) {
    if let Err(e) = sink.system_alert(alert).await {
        warn!(error = %e, "notification sink failed");
    }
}

/// Same contract as [`notify_best_effort`] for the user-facing channel
/// (e.g. `notifyProcessingError`, §7 "Propagation").
pub async fn notify_user_best_effort(sink: &dyn NotificationSink, notification: UserNotification) {
    if let Err(e) = sink.notify_user(notification).await {
        warn!(error = %e, "notification sink failed");
    }
}
