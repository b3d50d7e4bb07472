//! Orchestrator Facade (§4.E): the single entry point wiring the broker,
//! agent registry, task distribution engine, and workflow manager together,
//! plus the background tasks that keep them alive.
//!
//! Grounded on `clawd::agents::orchestrator::Orchestrator` for the
//! thin-facade-over-a-registry shape, generalized here to own several
//! subsystems behind one `initialize`/`shutdown` lifecycle the way
//! `clawd::daemon::Daemon::run` brings up its subsystems in sequence.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::info;

use crate::broker::redis_backed::RedisBroker;
use crate::broker::Broker;
use crate::config::OrchestratorConfig;
use crate::engine::model::{
    PublicTaskStatus, QueueStatus, TaskDefinitionInput, TaskMetricsSnapshot,
};
use crate::engine::TaskDistributionEngine;
use crate::error::OrchestratorError;
use crate::notify::{BrokerNotificationSink, NotificationSink};
use crate::registry::model::{AgentClass, AgentRegistration, AgentStatus};
use crate::registry::AgentRegistry;
use crate::workflow::model::{UserInstruction, Workflow};
use crate::workflow::WorkflowManager;

const SELF_AGENT_ID: &str = "orchestrator-facade";
const WORKFLOW_CLEANUP_INTERVAL: Duration = Duration::from_secs(600);
const WORKFLOW_MAX_AGE: Duration = Duration::from_secs(3_600);

struct OrchestratorInner {
    broker: Arc<dyn Broker>,
    registry: Arc<AgentRegistry>,
    engine: Arc<TaskDistributionEngine>,
    workflows: Arc<WorkflowManager>,
    agent_timeout: Duration,
    background: Vec<JoinHandle<()>>,
}

/// Top-level handle the rest of the system talks to. Holds nothing until
/// [`Orchestrator::initialize`] is called; every other method returns
/// [`OrchestratorError::NotInitialized`] until then.
pub struct Orchestrator {
    inner: RwLock<Option<OrchestratorInner>>,
}

impl Orchestrator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { inner: RwLock::new(None) })
    }

    /// Connect to the broker, wire the registry/engine/workflow manager,
    /// self-register as an `orchestrator`-class agent, and start the
    /// liveness sweep, event listeners, and workflow cleanup loop.
    pub async fn initialize(self: &Arc<Self>, config: &OrchestratorConfig) -> Result<(), OrchestratorError> {
        let broker: Arc<dyn Broker> = Arc::new(
            RedisBroker::connect(config)
                .await
                .map_err(|e| OrchestratorError::BrokerUnavailable(e.to_string()))?,
        );

        let registry = Arc::new(AgentRegistry::new(broker.clone()));
        let notify: Arc<dyn NotificationSink> = Arc::new(BrokerNotificationSink::new(broker.clone()));
        let engine = TaskDistributionEngine::with_config(
            broker.clone(),
            registry.clone(),
            notify.clone(),
            config.agent_timeout,
            config,
        );
        let workflows = WorkflowManager::new(engine.clone(), notify);

        let mut capabilities = std::collections::HashSet::new();
        for cap in ["task_coordination", "workflow_management", "agent_monitoring", "error_handling"] {
            capabilities.insert(cap.to_string());
        }
        registry
            .register(
                SELF_AGENT_ID.to_string(),
                AgentClass::Orchestrator,
                capabilities,
                crate::registry::model::AgentStatus::Active,
                std::collections::HashMap::new(),
            )
            .await?;

        let mut background = Vec::new();
        background.push(crate::registry::liveness::spawn(
            registry.clone(),
            config.agent_heartbeat_interval,
            config.agent_timeout,
        ));
        background.push(registry.spawn_status_listener());
        background.push(engine.spawn_progress_listener());
        background.push(workflows.spawn_completion_listener());
        background.push(workflows.spawn_cleanup_task(WORKFLOW_CLEANUP_INTERVAL, WORKFLOW_MAX_AGE));

        *self.inner.write().await = Some(OrchestratorInner {
            broker,
            registry,
            engine,
            workflows,
            agent_timeout: config.agent_timeout,
            background,
        });
        info!("orchestrator initialized");
        Ok(())
    }

    /// Cancel in-flight work, unregister the facade's own agent record, stop
    /// background tasks, and drop the connection.
    pub async fn shutdown(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        let mut guard = self.inner.write().await;
        let inner = match guard.take() {
            Some(i) => i,
            None => return Ok(()),
        };
        inner.engine.cancel_all_processing().await;
        let _ = inner.registry.unregister(SELF_AGENT_ID).await;
        for handle in inner.background {
            handle.abort();
        }
        info!("orchestrator shut down");
        Ok(())
    }

    async fn with_inner<T>(
        &self,
        f: impl FnOnce(&OrchestratorInner) -> T,
    ) -> Result<T, OrchestratorError> {
        let guard = self.inner.read().await;
        match guard.as_ref() {
            Some(inner) => Ok(f(inner)),
            None => Err(OrchestratorError::NotInitialized),
        }
    }

    pub async fn submit_instruction(&self, instruction: UserInstruction) -> Result<String, OrchestratorError> {
        let workflows = self.with_inner(|i| i.workflows.clone()).await?;
        workflows.process(instruction).await
    }

    pub async fn submit_task(&self, input: TaskDefinitionInput) -> Result<String, OrchestratorError> {
        let engine = self.with_inner(|i| i.engine.clone()).await?;
        engine.submit_task(input).await
    }

    /// Submit several task definitions in one call (§6 "Facade API":
    /// `submitBatchTasks`). Each definition is admitted independently, in
    /// order; a failure partway through does not roll back the ones that
    /// already succeeded.
    pub async fn submit_batch_tasks(
        &self,
        inputs: Vec<TaskDefinitionInput>,
    ) -> Result<Vec<String>, OrchestratorError> {
        let engine = self.with_inner(|i| i.engine.clone()).await?;
        let mut task_ids = Vec::with_capacity(inputs.len());
        for input in inputs {
            task_ids.push(engine.submit_task(input).await?);
        }
        Ok(task_ids)
    }

    pub async fn cancel_task(&self, task_id: &str) -> Result<(), OrchestratorError> {
        let engine = self.with_inner(|i| i.engine.clone()).await?;
        engine.cancel(task_id).await
    }

    pub async fn get_task_status(&self, task_id: &str) -> Result<PublicTaskStatus, OrchestratorError> {
        let engine = self.with_inner(|i| i.engine.clone()).await?;
        engine.get_task_status(task_id).await
    }

    pub async fn get_workflow_status(&self, workflow_id: &str) -> Result<Workflow, OrchestratorError> {
        let workflows = self.with_inner(|i| i.workflows.clone()).await?;
        workflows.get_workflow_status(workflow_id).await
    }

    pub async fn cancel_workflow(&self, workflow_id: &str) -> Result<(), OrchestratorError> {
        let workflows = self.with_inner(|i| i.workflows.clone()).await?;
        workflows.cancel_workflow(workflow_id).await
    }

    pub async fn get_active_workflows(&self) -> Result<Vec<Workflow>, OrchestratorError> {
        let workflows = self.with_inner(|i| i.workflows.clone()).await?;
        Ok(workflows.get_active_workflows().await)
    }

    pub async fn list_agents(&self, class: Option<AgentClass>) -> Result<Vec<AgentRegistration>, OrchestratorError> {
        let registry = self.with_inner(|i| i.registry.clone()).await?;
        Ok(registry.list_by_class(class).await)
    }

    /// Per-agent liveness view (§6 "Facade API": `getAgentHealth`), distinct
    /// from [`Self::list_agents`]'s plain registration listing: flags each
    /// agent as healthy only if it's `Active` and its heartbeat hasn't aged
    /// past the configured agent timeout.
    pub async fn get_agent_health(&self) -> Result<Vec<AgentHealth>, OrchestratorError> {
        let (registry, agent_timeout) = self.with_inner(|i| (i.registry.clone(), i.agent_timeout)).await?;
        let now_ms = chrono::Utc::now().timestamp_millis();
        Ok(registry
            .list_by_class(None)
            .await
            .into_iter()
            .map(|a| AgentHealth {
                healthy: a.status == AgentStatus::Active && !a.is_stale(now_ms, agent_timeout),
                agent_id: a.agent_id,
                agent_class: a.agent_class,
                status: a.status,
                last_heartbeat_ms: a.last_heartbeat_ms,
            })
            .collect())
    }

    pub async fn get_queue_status(&self, class: Option<AgentClass>) -> Result<Vec<QueueStatus>, OrchestratorError> {
        let engine = self.with_inner(|i| i.engine.clone()).await?;
        Ok(engine.get_queue_status(class).await)
    }

    pub async fn get_task_metrics(&self, class: Option<AgentClass>) -> Result<Vec<TaskMetricsSnapshot>, OrchestratorError> {
        let engine = self.with_inner(|i| i.engine.clone()).await?;
        Ok(engine.get_task_metrics(class).await)
    }

    /// Aggregate health view for `orcd health` / a future HTTP health route
    /// (§4.E "Observability"): broker reachability plus queue depth summary.
    pub async fn get_system_health(&self) -> Result<SystemHealth, OrchestratorError> {
        let (broker, engine) = self.with_inner(|i| (i.broker.clone(), i.engine.clone())).await?;
        let broker_healthy = broker.is_healthy().await;
        let queues = engine.get_queue_status(None).await;
        Ok(SystemHealth { broker_healthy, queues })
    }
}

#[derive(Debug, Clone)]
pub struct SystemHealth {
    pub broker_healthy: bool,
    pub queues: Vec<QueueStatus>,
}

/// One agent's liveness as reported by [`Orchestrator::get_agent_health`].
#[derive(Debug, Clone)]
pub struct AgentHealth {
    pub agent_id: String,
    pub agent_class: AgentClass,
    pub status: AgentStatus,
    pub healthy: bool,
    pub last_heartbeat_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn methods_error_not_initialized_before_initialize() {
        let orchestrator = Orchestrator::new();
        let err = orchestrator.get_task_status("missing").await.unwrap_err();
        assert_eq!(err.kind(), "NotInitialized");
    }

    #[tokio::test]
    async fn shutdown_before_initialize_is_a_no_op() {
        let orchestrator = Orchestrator::new();
        orchestrator.shutdown().await.unwrap();
    }
}
