//! Workflow Manager (§4.D): translates a user instruction into a DAG of
//! task definitions, drives execution step-by-step, and exposes workflow
//! status and cancellation.
//!
//! Grounded on `clawd::workflows::engine::WorkflowRecipe`/`WorkflowStep` for
//! the step/dependency shape (simplified from authored YAML recipes to
//! keyword-classified plans per §4.D) and `clawd::agents::orchestrator`'s
//! event-driven advance-on-completion pattern.

pub mod intent;
pub mod model;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::engine::model::{TaskDefinitionInput, TaskResultStatus};
use crate::engine::{EngineEvent, TaskDistributionEngine};
use crate::error::OrchestratorError;
use crate::notify::{self, NotificationSink, UserNotification};
use model::{UserInstruction, Workflow, WorkflowStatus, WorkflowStep};

pub struct WorkflowManager {
    engine: Arc<TaskDistributionEngine>,
    notify: Arc<dyn NotificationSink>,
    workflows: RwLock<HashMap<String, Workflow>>,
    task_to_step: RwLock<HashMap<String, (String, String)>>,
}

impl WorkflowManager {
    pub fn new(engine: Arc<TaskDistributionEngine>, notify: Arc<dyn NotificationSink>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            notify,
            workflows: RwLock::new(HashMap::new()),
            task_to_step: RwLock::new(HashMap::new()),
        })
    }

    /// Drive workflow advancement from the engine's in-process
    /// `taskCompleted` events (§4.D "Execution": "polls or subscribes to
    /// taskCompleted events to learn when to advance").
    pub fn spawn_completion_listener(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        let mut rx = self.engine.subscribe_events();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(EngineEvent::Completed(result)) => manager.handle_task_completed(result).await,
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "workflow completion listener lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn spawn_cleanup_task(self: &Arc<Self>, interval: Duration, max_age: Duration) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = manager.cleanup_completed(max_age).await;
                if removed > 0 {
                    info!(removed, "cleaned up completed workflows");
                }
            }
        })
    }

    pub async fn process(self: &Arc<Self>, instruction: UserInstruction) -> Result<String, OrchestratorError> {
        let intent = intent::classify(&instruction.text);
        let steps = build_steps(intent, &instruction);
        let mut workflow = Workflow::new(&instruction, steps);
        workflow.status = WorkflowStatus::Processing;
        let workflow_id = workflow.id.clone();
        self.workflows.write().await.insert(workflow_id.clone(), workflow);
        info!(workflow_id, intent = intent.as_str(), "workflow created");
        self.advance(&workflow_id).await;
        Ok(workflow_id)
    }

    async fn advance(self: &Arc<Self>, workflow_id: &str) {
        let ready: Vec<WorkflowStep> = {
            let workflows = self.workflows.read().await;
            let wf = match workflows.get(workflow_id) {
                Some(w) => w,
                None => return,
            };
            if wf.is_terminal() {
                return;
            }
            wf.steps
                .iter()
                .filter(|s| !wf.results.contains_key(&s.id))
                .filter(|s| !wf.submitted_steps.contains(&s.id))
                .filter(|s| s.dependencies.iter().all(|d| wf.results.contains_key(d)))
                .cloned()
                .collect()
        };

        for step in ready {
            let dep_task_ids: HashSet<String> = {
                let workflows = self.workflows.read().await;
                match workflows.get(workflow_id) {
                    Some(wf) => step
                        .dependencies
                        .iter()
                        .filter_map(|d| wf.step_task_map.get(d).cloned())
                        .collect(),
                    None => return,
                }
            };

            let input = TaskDefinitionInput::new(step.task_type.clone(), step.agent_class, step.payload.clone())
                .with_dependencies(dep_task_ids)
                .with_priority(step.priority);

            match self.engine.submit_task(input).await {
                Ok(task_id) => {
                    {
                        let mut workflows = self.workflows.write().await;
                        if let Some(wf) = workflows.get_mut(workflow_id) {
                            wf.step_task_map.insert(step.id.clone(), task_id.clone());
                            wf.submitted_steps.insert(step.id.clone());
                        }
                    }
                    self.task_to_step
                        .write()
                        .await
                        .insert(task_id, (workflow_id.to_string(), step.id.clone()));
                }
                Err(e) => {
                    self.fail_workflow(workflow_id, &format!("step {} failed to submit: {e}", step.id))
                        .await;
                    return;
                }
            }
        }
    }

    async fn handle_task_completed(self: &Arc<Self>, result: crate::engine::model::TaskResult) {
        let mapping = self.task_to_step.write().await.remove(&result.task_id);
        let (workflow_id, step_id) = match mapping {
            Some(m) => m,
            None => return,
        };

        if result.status == TaskResultStatus::Success {
            {
                let mut workflows = self.workflows.write().await;
                if let Some(wf) = workflows.get_mut(&workflow_id) {
                    wf.results
                        .insert(step_id, result.result.clone().unwrap_or(serde_json::Value::Null));
                }
            }
            let complete = {
                let workflows = self.workflows.read().await;
                workflows.get(&workflow_id).map(|w| w.is_complete()).unwrap_or(false)
            };
            if complete {
                let mut workflows = self.workflows.write().await;
                if let Some(wf) = workflows.get_mut(&workflow_id) {
                    wf.status = WorkflowStatus::Completed;
                    wf.completed_at = Some(chrono::Utc::now());
                }
                info!(workflow_id, "workflow completed");
            } else {
                self.advance(&workflow_id).await;
            }
        } else {
            let message = result.error.clone().unwrap_or_else(|| "task failed".to_string());
            self.fail_workflow(&workflow_id, &format!("step {step_id} failed: {message}"))
                .await;
        }
    }

    async fn fail_workflow(self: &Arc<Self>, workflow_id: &str, message: &str) {
        let (user_id, remaining_task_ids) = {
            let mut workflows = self.workflows.write().await;
            let wf = match workflows.get_mut(workflow_id) {
                Some(w) => w,
                None => return,
            };
            if wf.is_terminal() {
                return;
            }
            wf.status = WorkflowStatus::Failed;
            wf.errors.push(message.to_string());
            wf.completed_at = Some(chrono::Utc::now());
            (wf.user_id.clone(), wf.step_task_map.values().cloned().collect::<Vec<_>>())
        };

        for task_id in remaining_task_ids {
            let _ = self.engine.cancel(&task_id).await;
        }

        notify::notify_user_best_effort(
            self.notify.as_ref(),
            UserNotification {
                kind: "notifyProcessingError".to_string(),
                workflow_id: Some(workflow_id.to_string()),
                user_id: Some(user_id),
                message: message.to_string(),
                payload: serde_json::json!({ "workflowId": workflow_id }),
            },
        )
        .await;

        warn!(workflow_id, message, "workflow failed");
    }

    pub async fn cancel_workflow(self: &Arc<Self>, workflow_id: &str) -> Result<(), OrchestratorError> {
        let remaining = {
            let mut workflows = self.workflows.write().await;
            let wf = workflows
                .get_mut(workflow_id)
                .ok_or_else(|| OrchestratorError::WorkflowNotFound(workflow_id.to_string()))?;
            if wf.is_terminal() {
                return Err(OrchestratorError::WorkflowNotRetryable(workflow_id.to_string()));
            }
            wf.status = WorkflowStatus::Cancelled;
            wf.completed_at = Some(chrono::Utc::now());
            wf.step_task_map.values().cloned().collect::<Vec<_>>()
        };
        for task_id in remaining {
            let _ = self.engine.cancel(&task_id).await;
        }
        Ok(())
    }

    pub async fn get_workflow_status(&self, workflow_id: &str) -> Result<Workflow, OrchestratorError> {
        self.workflows
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::WorkflowNotFound(workflow_id.to_string()))
    }

    pub async fn get_active_workflows(&self) -> Vec<Workflow> {
        self.workflows
            .read()
            .await
            .values()
            .filter(|w| !w.is_terminal())
            .cloned()
            .collect()
    }

    /// Drop terminal workflows older than `max_age` to bound memory (§4.D
    /// "Cleanup"). Returns the number removed.
    pub async fn cleanup_completed(&self, max_age: Duration) -> usize {
        let cutoff = chrono::Utc::now() - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::hours(1));
        let mut workflows = self.workflows.write().await;
        let before = workflows.len();
        workflows.retain(|_, wf| {
            if !wf.is_terminal() {
                return true;
            }
            wf.completed_at.map(|t| t > cutoff).unwrap_or(true)
        });
        before - workflows.len()
    }
}

fn build_steps(intent: intent::Intent, instruction: &UserInstruction) -> Vec<WorkflowStep> {
    let templates = intent::plan_for(intent);
    let mut key_to_id: HashMap<&str, String> = HashMap::new();
    for t in templates {
        key_to_id.insert(t.key, uuid::Uuid::new_v4().to_string());
    }
    templates
        .iter()
        .map(|t| WorkflowStep {
            id: key_to_id[t.key].clone(),
            agent_class: t.agent_class,
            task_type: t.task_type.to_string(),
            payload: serde_json::json!({
                "documentId": instruction.document_id,
                "instructionText": instruction.text,
            }),
            dependencies: t.depends_on.iter().map(|k| key_to_id[k].clone()).collect(),
            priority: instruction.priority.unwrap_or(0),
            timeout_ms: intent::default_timeout_ms(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::FakeBroker;
    use crate::broker::Broker;
    use crate::engine::model::TaskResult;
    use crate::notify::BrokerNotificationSink;
    use crate::registry::model::{AgentClass, AgentStatus};
    use crate::registry::AgentRegistry;
    use std::collections::HashSet as StdHashSet;
    use std::time::Duration as StdDuration;

    async fn setup() -> (Arc<WorkflowManager>, Arc<TaskDistributionEngine>, Arc<AgentRegistry>) {
        let broker: Arc<dyn Broker> = Arc::new(FakeBroker::new());
        let registry = Arc::new(AgentRegistry::new(broker.clone()));
        let notify: Arc<dyn NotificationSink> = Arc::new(BrokerNotificationSink::new(broker.clone()));
        let engine = TaskDistributionEngine::new(broker, registry.clone(), notify.clone(), StdDuration::from_secs(90));
        let manager = WorkflowManager::new(engine.clone(), notify);
        manager.spawn_completion_listener();
        (manager, engine, registry)
    }

    async fn register(registry: &AgentRegistry, id: &str, class: AgentClass) {
        registry
            .register(id.to_string(), class, StdHashSet::new(), AgentStatus::Active, HashMap::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn summary_workflow_reaches_two_step_completion() {
        let (manager, engine, registry) = setup().await;
        register(&registry, "ing1", AgentClass::Ingestion).await;
        register(&registry, "an1", AgentClass::Analysis).await;

        let instruction = UserInstruction::new("u1", "D1", "Generate a summary of this document");
        let workflow_id = manager.process(instruction).await.unwrap();

        let wf = manager.get_workflow_status(&workflow_id).await.unwrap();
        assert_eq!(wf.steps.len(), 2);
        let step0_task = wf.step_task_map.get(&wf.steps[0].id).unwrap().clone();

        engine
            .complete(
                &step0_task,
                TaskResult {
                    task_id: step0_task.clone(),
                    agent_id: Some("ing1".to_string()),
                    status: TaskResultStatus::Success,
                    result: Some(serde_json::json!({"text": "doc text"})),
                    error: None,
                    execution_time: StdDuration::from_millis(5),
                },
            )
            .await;
        tokio::time::sleep(StdDuration::from_millis(20)).await;

        let wf = manager.get_workflow_status(&workflow_id).await.unwrap();
        let step1_task = wf.step_task_map.get(&wf.steps[1].id).unwrap().clone();

        engine
            .complete(
                &step1_task,
                TaskResult {
                    task_id: step1_task.clone(),
                    agent_id: Some("an1".to_string()),
                    status: TaskResultStatus::Success,
                    result: Some(serde_json::json!({"summary": "..."})),
                    error: None,
                    execution_time: StdDuration::from_millis(5),
                },
            )
            .await;
        tokio::time::sleep(StdDuration::from_millis(20)).await;

        let wf = manager.get_workflow_status(&workflow_id).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert_eq!(wf.results.len(), 2);
    }

    #[tokio::test]
    async fn study_materials_plan_has_four_steps_with_join_dependency() {
        let (manager, _engine, registry) = setup().await;
        for (id, class) in [
            ("ing1", AgentClass::Ingestion),
            ("an1", AgentClass::Analysis),
            ("ex1", AgentClass::Extraction),
            ("ped1", AgentClass::Pedagogy),
        ] {
            register(&registry, id, class).await;
        }
        let instruction = UserInstruction::new("u1", "D1", "Create flashcards and quiz questions");
        let workflow_id = manager.process(instruction).await.unwrap();
        let wf = manager.get_workflow_status(&workflow_id).await.unwrap();
        assert_eq!(wf.steps.len(), 4);
        let pedagogy = wf.steps.iter().find(|s| s.agent_class == AgentClass::Pedagogy).unwrap();
        assert_eq!(pedagogy.dependencies.len(), 2);
        // pedagogy's task must not yet have been submitted to the engine.
        assert!(!wf.step_task_map.contains_key(&pedagogy.id));
    }

    #[tokio::test]
    async fn upstream_failure_fails_the_workflow() {
        let (manager, engine, registry) = setup().await;
        register(&registry, "ing1", AgentClass::Ingestion).await;
        register(&registry, "an1", AgentClass::Analysis).await;

        let instruction = UserInstruction::new("u1", "D1", "Generate a summary of this document");
        let workflow_id = manager.process(instruction).await.unwrap();
        let wf = manager.get_workflow_status(&workflow_id).await.unwrap();
        let step0_task = wf.step_task_map.get(&wf.steps[0].id).unwrap().clone();

        engine
            .complete(
                &step0_task,
                TaskResult {
                    task_id: step0_task.clone(),
                    agent_id: Some("ing1".to_string()),
                    status: TaskResultStatus::Error,
                    result: None,
                    error: Some("Forbidden: invalid token".to_string()),
                    execution_time: StdDuration::from_millis(5),
                },
            )
            .await;
        tokio::time::sleep(StdDuration::from_millis(20)).await;

        let wf = manager.get_workflow_status(&workflow_id).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Failed);
        assert_eq!(wf.errors.len(), 1);
    }
}
