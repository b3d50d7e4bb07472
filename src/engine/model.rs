//! Task Distribution Engine data model (§3).

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::registry::model::AgentClass;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub initial_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_multiplier: 2.0,
            initial_delay_ms: 1_000,
        }
    }
}

/// A task as submitted to the engine (§3 "Task Definition").
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub id: String,
    pub task_type: String,
    pub agent_class: AgentClass,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub dependencies: HashSet<String>,
    pub timeout: Duration,
    pub retry_policy: RetryPolicy,
    /// Number of attempts already made; 0 on first submission.
    pub retry_count: u32,
}

/// Caller-facing input to `submit_task`; the engine mints the id and fills
/// defaults (§4.C "Submission").
pub struct TaskDefinitionInput {
    pub task_type: String,
    pub agent_class: AgentClass,
    pub payload: serde_json::Value,
    pub priority: Option<i32>,
    pub dependencies: HashSet<String>,
    pub timeout: Option<Duration>,
    pub retry_policy: Option<RetryPolicy>,
}

impl TaskDefinitionInput {
    pub fn new(task_type: impl Into<String>, agent_class: AgentClass, payload: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            agent_class,
            payload,
            priority: None,
            dependencies: HashSet::new(),
            timeout: None,
            retry_policy: None,
        }
    }

    pub fn with_dependencies(mut self, dependencies: HashSet<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResultStatus {
    Success,
    Error,
    Timeout,
}

/// Outcome of a single task attempt (§3 "Task Result").
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: String,
    pub agent_id: Option<String>,
    pub status: TaskResultStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub execution_time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyStatus {
    Waiting,
    Ready,
    Processing,
    Completed,
    Failed,
}

impl DependencyStatus {
    /// Monotonic transition table (§8 invariant 3): `waiting -> ready ->
    /// processing -> {completed|failed}`.
    pub fn can_transition_to(&self, next: DependencyStatus) -> bool {
        use DependencyStatus::*;
        matches!(
            (self, next),
            (Waiting, Ready)
                | (Waiting, Failed)
                | (Ready, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }
}

#[derive(Debug, Clone)]
pub struct DependencyRecord {
    pub task_id: String,
    pub depends_on: HashSet<String>,
    pub status: DependencyStatus,
}

impl DependencyRecord {
    pub fn transition(&mut self, next: DependencyStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}

/// Per-class queue configuration and counters (§3 "Task Queue").
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub max_concurrency: u32,
    pub default_priority: i32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueCounters {
    pub current_tasks: u32,
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueStatus {
    pub agent_class: AgentClass,
    pub config: QueueConfig,
    pub counters: QueueCounters,
    pub pending_count: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct TaskMetricsSnapshot {
    pub agent_class: AgentClass,
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub average_execution_time_ms: f64,
    pub throughput_per_min: f64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicTaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Timeout,
}
