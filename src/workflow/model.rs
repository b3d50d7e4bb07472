//! Workflow Manager data model (§3).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::model::AgentClass;

/// A free-form user instruction about a document (§4.D).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInstruction {
    pub id: String,
    pub user_id: String,
    pub document_id: String,
    pub text: String,
    #[serde(default)]
    pub options: Option<serde_json::Value>,
    #[serde(default)]
    pub priority: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

impl UserInstruction {
    pub fn new(user_id: impl Into<String>, document_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            document_id: document_id.into(),
            text: text.into(),
            options: None,
            priority: None,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

/// One step of a workflow's plan (§3 "Workflow Step").
#[derive(Debug, Clone)]
pub struct WorkflowStep {
    pub id: String,
    pub agent_class: AgentClass,
    pub task_type: String,
    pub payload: serde_json::Value,
    /// Step ids this step depends on.
    pub dependencies: Vec<String>,
    pub priority: i32,
    pub timeout_ms: u64,
}

/// A user-facing unit of work: a DAG of steps realized as engine tasks
/// (§3 "Workflow").
#[derive(Debug, Clone)]
pub struct Workflow {
    pub id: String,
    pub instruction_id: String,
    pub user_id: String,
    pub status: WorkflowStatus,
    pub steps: Vec<WorkflowStep>,
    pub results: HashMap<String, serde_json::Value>,
    pub errors: Vec<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// One-to-one mapping from step id to the engine task id currently (or
    /// most recently) dispatched for it.
    pub step_task_map: HashMap<String, String>,
    pub submitted_steps: std::collections::HashSet<String>,
}

impl Workflow {
    pub fn new(instruction: &UserInstruction, steps: Vec<WorkflowStep>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            instruction_id: instruction.id.clone(),
            user_id: instruction.user_id.clone(),
            status: WorkflowStatus::Pending,
            steps,
            results: HashMap::new(),
            errors: Vec::new(),
            retry_count: 0,
            created_at: Utc::now(),
            completed_at: None,
            step_task_map: HashMap::new(),
            submitted_steps: std::collections::HashSet::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| self.results.contains_key(&s.id))
    }
}
