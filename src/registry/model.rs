//! Agent registry data model (§3).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Closed enum of worker classes (§3). `Orchestrator` is the facade's own
/// self-registration and must never be selected by `distribute_task` (§9
/// "Cycle avoidance").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentClass {
    Orchestrator,
    Ingestion,
    Analysis,
    Extraction,
    Pedagogy,
    Synthesis,
}

impl AgentClass {
    pub const ALL: [AgentClass; 6] = [
        AgentClass::Orchestrator,
        AgentClass::Ingestion,
        AgentClass::Analysis,
        AgentClass::Extraction,
        AgentClass::Pedagogy,
        AgentClass::Synthesis,
    ];

    /// Worker classes only, excluding the orchestrator's own registration.
    pub const WORKERS: [AgentClass; 5] = [
        AgentClass::Ingestion,
        AgentClass::Analysis,
        AgentClass::Extraction,
        AgentClass::Pedagogy,
        AgentClass::Synthesis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orchestrator => "orchestrator",
            Self::Ingestion => "ingestion",
            Self::Analysis => "analysis",
            Self::Extraction => "extraction",
            Self::Pedagogy => "pedagogy",
            Self::Synthesis => "synthesis",
        }
    }

    /// Default queue priority and max concurrency (§4.C table).
    pub fn default_priority(&self) -> i32 {
        match self {
            Self::Orchestrator => 0,
            Self::Ingestion => 1,
            Self::Analysis => 2,
            Self::Extraction => 3,
            Self::Pedagogy => 4,
            Self::Synthesis => 5,
        }
    }

    pub fn default_max_concurrency(&self) -> u32 {
        match self {
            Self::Orchestrator => 1,
            Self::Ingestion => 3,
            Self::Analysis => 5,
            Self::Extraction => 4,
            Self::Pedagogy => 3,
            Self::Synthesis => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Inactive,
    Busy,
    Error,
}

/// An entry in the agent registry (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub agent_class: AgentClass,
    pub capabilities: HashSet<String>,
    pub status: AgentStatus,
    pub last_heartbeat_ms: i64,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AgentRegistration {
    pub fn new(
        agent_id: String,
        agent_class: AgentClass,
        capabilities: HashSet<String>,
        status: AgentStatus,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            agent_id,
            agent_class,
            capabilities,
            status,
            last_heartbeat_ms: chrono::Utc::now().timestamp_millis(),
            metadata,
        }
    }

    pub fn is_stale(&self, now_ms: i64, timeout: std::time::Duration) -> bool {
        now_ms - self.last_heartbeat_ms > timeout.as_millis() as i64
    }
}

/// The minimal shape `distribute_task` needs from a task, kept independent
/// of [`crate::engine::model::TaskDefinition`] so the registry does not
/// depend on the engine module.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub task_id: String,
    pub task_type: String,
    pub agent_class: AgentClass,
    pub payload: serde_json::Value,
    pub timeout_ms: u64,
    pub priority: Option<i32>,
}
