//! Wire types for broker traffic (§6 External Interfaces).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registry::model::AgentClass;

/// Kind discriminant for [`AgentMessage`]. Wire key is `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Task,
    Status,
    Result,
    Error,
}

/// An agent message as it travels over the broker's per-class queues.
///
/// The spec's §3 data model names the kind field `kind` and the class field
/// `agentClass`, while §6's wire format names them `type`/`agentType`. Both
/// describe the same message; we keep idiomatic Rust field names internally
/// and rename to the §6 wire names at the serde boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(rename = "agentType")]
    pub agent_class: AgentClass,
    pub payload: Value,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(rename = "retryCount", skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(rename = "maxRetries", skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl AgentMessage {
    pub fn task(
        agent_class: AgentClass,
        task_id: &str,
        task_type: &str,
        data: Value,
        timeout_ms: u64,
        priority: Option<i32>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: MessageKind::Task,
            agent_class,
            payload: serde_json::json!({
                "taskId": task_id,
                "taskType": task_type,
                "data": data,
                "timeout": timeout_ms,
            }),
            timestamp: now_ms(),
            priority,
            retry_count: None,
            max_retries: None,
        }
    }

    pub fn cancel(agent_class: AgentClass, task_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: MessageKind::Task,
            agent_class,
            payload: serde_json::json!({ "action": "cancel", "taskId": task_id }),
            timestamp: now_ms(),
            priority: None,
            retry_count: None,
            max_retries: None,
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The three pub/sub channels the broker fans events through (§4.A, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    AgentStatus,
    TaskProgress,
    SystemEvents,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentStatus => "agentStatus",
            Self::TaskProgress => "taskProgress",
            Self::SystemEvents => "systemEvents",
        }
    }

    pub const ALL: [Channel; 3] = [Channel::AgentStatus, Channel::TaskProgress, Channel::SystemEvents];
}

/// Options for [`crate::broker::Broker::set`].
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub ttl: Option<std::time::Duration>,
    pub prefix: Option<&'static str>,
}

impl SetOptions {
    pub fn with_ttl(ttl: std::time::Duration) -> Self {
        Self { ttl: Some(ttl), prefix: None }
    }

    pub fn with_prefix(mut self, prefix: &'static str) -> Self {
        self.prefix = Some(prefix);
        self
    }
}

pub fn namespaced(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(p) => format!("{p}:{key}"),
        None => key.to_string(),
    }
}
