//! Task Distribution Engine (§4.C): per-class bounded concurrency,
//! dependency resolution, timeouts, classified retry with exponential
//! backoff, and metrics.
//!
//! Grounded on `clawd::agents::orchestrator::Orchestrator` for the
//! concurrency-cap admission shape and `clawd::task_engine::model`'s
//! `valid_transition` for the dependency-record state machine; the retry
//! math is `clawd::scheduler::backoff` adapted to the spec's exact
//! `initialDelay * multiplier^retryCount` formula (§8 scenario 5 pins the
//! numbers, so no jitter is applied here unlike the teacher's connection
//! backoff).

pub mod metrics;
pub mod model;
pub mod retry_policy;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{info, warn};

use crate::broker::{AgentMessage, Broker, Channel};
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::notify::{self, NotificationSink, Severity, SystemAlert};
use crate::registry::model::{AgentClass, AgentStatus, DispatchRequest};
use crate::registry::AgentRegistry;

use metrics::MetricsAccumulator;
use model::{
    DependencyRecord, DependencyStatus, PublicTaskStatus, QueueConfig, QueueCounters, QueueStatus,
    RetryPolicy, TaskDefinition, TaskDefinitionInput, TaskMetricsSnapshot, TaskResult,
    TaskResultStatus,
};

#[derive(Debug, Clone)]
pub enum EngineEvent {
    Started(String),
    Completed(TaskResult),
    Retry { task_id: String, attempt: u32 },
}

#[derive(Debug, Clone)]
struct ProcessingEntry {
    start_time_ms: i64,
    agent_id: String,
}

pub struct TaskDistributionEngine {
    broker: Arc<dyn Broker>,
    registry: Arc<AgentRegistry>,
    notify: Arc<dyn NotificationSink>,
    agent_timeout: Duration,
    default_task_timeout: Duration,
    default_retry_policy: RetryPolicy,

    definitions: RwLock<HashMap<String, TaskDefinition>>,
    pending: RwLock<std::collections::HashSet<String>>,
    processing: RwLock<HashMap<String, ProcessingEntry>>,
    completed: RwLock<HashMap<String, TaskResult>>,
    dependencies: RwLock<HashMap<String, DependencyRecord>>,
    queues: RwLock<HashMap<AgentClass, (QueueConfig, QueueCounters)>>,
    metrics: RwLock<HashMap<AgentClass, MetricsAccumulator>>,
    timeouts: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,

    events: broadcast::Sender<EngineEvent>,
}

impl TaskDistributionEngine {
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<AgentRegistry>,
        notify: Arc<dyn NotificationSink>,
        agent_timeout: Duration,
    ) -> Arc<Self> {
        Self::with_config(broker, registry, notify, agent_timeout, &OrchestratorConfig::default())
    }

    /// Like [`Self::new`], but takes the default task timeout and default
    /// retry policy (§4.I "Configuration") from `config` instead of the
    /// engine's own built-in defaults, so `ORC_DEFAULT_*` env overrides
    /// actually reach tasks submitted without an explicit timeout/retry
    /// policy.
    pub fn with_config(
        broker: Arc<dyn Broker>,
        registry: Arc<AgentRegistry>,
        notify: Arc<dyn NotificationSink>,
        agent_timeout: Duration,
        config: &OrchestratorConfig,
    ) -> Arc<Self> {
        let mut queues = HashMap::new();
        for class in AgentClass::ALL {
            queues.insert(
                class,
                (
                    QueueConfig {
                        max_concurrency: class.default_max_concurrency(),
                        default_priority: class.default_priority(),
                    },
                    QueueCounters::default(),
                ),
            );
        }
        Arc::new(Self {
            broker,
            registry,
            notify,
            agent_timeout,
            default_task_timeout: config.default_task_timeout,
            default_retry_policy: RetryPolicy {
                max_retries: config.default_retry_max,
                backoff_multiplier: config.default_retry_multiplier,
                initial_delay_ms: config.default_retry_initial_delay.as_millis() as u64,
            },
            definitions: RwLock::new(HashMap::new()),
            pending: RwLock::new(std::collections::HashSet::new()),
            processing: RwLock::new(HashMap::new()),
            completed: RwLock::new(HashMap::new()),
            dependencies: RwLock::new(HashMap::new()),
            queues: RwLock::new(queues),
            metrics: RwLock::new(HashMap::new()),
            timeouts: Mutex::new(HashMap::new()),
            events: broadcast::channel(1024).0,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Subscribe to the broker's `taskProgress` channel and drive the
    /// completion pipeline from worker-published events (§4.C "Completion
    /// pipeline").
    pub fn spawn_progress_listener(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        let mut rx = self.broker.subscribe(Channel::TaskProgress);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => engine.handle_task_progress(payload).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "taskProgress listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    // ---- submission & admission ------------------------------------------------

    pub async fn submit_task(
        self: &Arc<Self>,
        input: TaskDefinitionInput,
    ) -> Result<String, OrchestratorError> {
        let id = uuid::Uuid::new_v4().to_string();
        let def = self.build_definition(id.clone(), input);

        if def.dependencies.is_empty() && !self.is_saturated(def.agent_class).await {
            let dispatch = to_dispatch_request(&def);
            match self
                .registry
                .distribute_task(&dispatch, self.agent_timeout)
                .await
            {
                Ok(agent_id) => {
                    self.commit_definition(&def).await;
                    self.admit_processing(&def, agent_id).await;
                    let _ = self.events.send(EngineEvent::Started(id.clone()));
                    info!(task_id = %id, "task started");
                    return Ok(id);
                }
                Err(e) => return Err(e),
            }
        }

        self.commit_definition(&def).await;
        self.pending.write().await.insert(id.clone());
        if !def.dependencies.is_empty() {
            self.dependencies.write().await.insert(
                id.clone(),
                DependencyRecord {
                    task_id: id.clone(),
                    depends_on: def.dependencies.clone(),
                    status: DependencyStatus::Waiting,
                },
            );
            self.check_dependencies(&id).await;
        }
        Ok(id)
    }

    fn build_definition(&self, id: String, input: TaskDefinitionInput) -> TaskDefinition {
        TaskDefinition {
            id,
            task_type: input.task_type,
            agent_class: input.agent_class,
            payload: input.payload,
            priority: input.priority.unwrap_or_else(|| input.agent_class.default_priority()),
            dependencies: input.dependencies,
            timeout: input.timeout.unwrap_or(self.default_task_timeout),
            retry_policy: input.retry_policy.unwrap_or_else(|| self.default_retry_policy.clone()),
            retry_count: 0,
        }
    }

    async fn commit_definition(&self, def: &TaskDefinition) {
        self.definitions.write().await.insert(def.id.clone(), def.clone());
        {
            let mut queues = self.queues.write().await;
            let entry = queues.entry(def.agent_class).or_insert_with(|| {
                (
                    QueueConfig {
                        max_concurrency: def.agent_class.default_max_concurrency(),
                        default_priority: def.agent_class.default_priority(),
                    },
                    QueueCounters::default(),
                )
            });
            entry.1.total_tasks += 1;
        }
        self.metrics
            .write()
            .await
            .entry(def.agent_class)
            .or_default()
            .record_submission();
    }

    async fn admit_processing(self: &Arc<Self>, def: &TaskDefinition, agent_id: String) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        self.processing.write().await.insert(
            def.id.clone(),
            ProcessingEntry { start_time_ms: now_ms, agent_id },
        );
        {
            let mut queues = self.queues.write().await;
            if let Some((_, counters)) = queues.get_mut(&def.agent_class) {
                counters.current_tasks += 1;
            }
        }
        if let Some(rec) = self.dependencies.write().await.get_mut(&def.id) {
            rec.transition(DependencyStatus::Processing);
        }
        self.schedule_timeout(&def.id, def.timeout).await;
    }

    async fn is_saturated(&self, class: AgentClass) -> bool {
        let queues = self.queues.read().await;
        queues
            .get(&class)
            .map(|(cfg, counters)| counters.current_tasks >= cfg.max_concurrency)
            .unwrap_or(false)
    }

    /// Admit a pending task whose dependencies are satisfied, or leave it
    /// pending if the class is saturated or no agent is available.
    async fn try_process(self: &Arc<Self>, task_id: &str) {
        let def = match self.definitions.read().await.get(task_id).cloned() {
            Some(d) => d,
            None => return,
        };
        if self.is_saturated(def.agent_class).await {
            return;
        }
        {
            let pending = self.pending.read().await;
            if !pending.contains(task_id) {
                return;
            }
        }

        let dispatch = to_dispatch_request(&def);
        match self
            .registry
            .distribute_task(&dispatch, self.agent_timeout)
            .await
        {
            Ok(agent_id) => {
                self.pending.write().await.remove(task_id);
                self.admit_processing(&def, agent_id).await;
                let _ = self.events.send(EngineEvent::Started(task_id.to_string()));
                info!(task_id, "task started");
            }
            Err(e) => {
                self.pending.write().await.remove(task_id);
                let result = TaskResult {
                    task_id: task_id.to_string(),
                    agent_id: None,
                    status: TaskResultStatus::Error,
                    result: None,
                    error: Some(e.to_string()),
                    execution_time: Duration::ZERO,
                };
                self.complete(task_id, result).await;
            }
        }
    }

    // ---- dependency resolution --------------------------------------------------

    /// Look at `depends_on`'s completion state: a dependency that finished
    /// with anything other than `Success` blocks the dependent permanently
    /// (§9 "Dependent stranding"); returns its id so callers can report it.
    async fn blocked_on_dependency(&self, depends_on: &std::collections::HashSet<String>) -> Option<String> {
        let completed = self.completed.read().await;
        depends_on
            .iter()
            .find(|dep_id| {
                completed
                    .get(*dep_id)
                    .map(|r| r.status != TaskResultStatus::Success)
                    .unwrap_or(false)
            })
            .cloned()
    }

    async fn check_dependencies(self: &Arc<Self>, task_id: &str) {
        let depends_on = {
            let deps = self.dependencies.read().await;
            match deps.get(task_id) {
                Some(rec) if rec.status == DependencyStatus::Waiting => rec.depends_on.clone(),
                _ => return,
            }
        };

        if self.blocked_on_dependency(&depends_on).await.is_some() {
            // Dependent stranded in `waiting` (§9 "Dependent stranding").
            // `get_task_status` surfaces this as `DependencyFailure` to a
            // caller that submitted the task directly; the workflow manager
            // notices the same thing via its own completion handling. The
            // engine does not garbage-collect the stranded record.
            return;
        }

        let all_complete = {
            let completed = self.completed.read().await;
            depends_on.iter().all(|d| completed.contains_key(d))
        };
        if all_complete {
            if let Some(rec) = self.dependencies.write().await.get_mut(task_id) {
                rec.transition(DependencyStatus::Ready);
            }
            self.try_process(task_id).await;
        }
    }

    // ---- timeouts ----------------------------------------------------------------

    async fn schedule_timeout(self: &Arc<Self>, task_id: &str, timeout: Duration) {
        let engine = self.clone();
        let id = task_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            engine.handle_timeout(&id).await;
        });
        self.timeouts.lock().await.insert(task_id.to_string(), handle);
    }

    async fn clear_timeout(&self, task_id: &str) {
        if let Some(handle) = self.timeouts.lock().await.remove(task_id) {
            handle.abort();
        }
    }

    async fn handle_timeout(self: &Arc<Self>, task_id: &str) {
        let entry = self.processing.read().await.get(task_id).cloned();
        let def = self.definitions.read().await.get(task_id).cloned();
        let (entry, def) = match (entry, def) {
            (Some(e), Some(d)) => (e, d),
            _ => return,
        };

        let now_ms = chrono::Utc::now().timestamp_millis();
        let execution_time = Duration::from_millis((now_ms - entry.start_time_ms).max(0) as u64);

        let cancel_msg = AgentMessage::cancel(def.agent_class, task_id);
        let _ = self.broker.enqueue(def.agent_class.as_str(), cancel_msg).await;

        let result = TaskResult {
            task_id: task_id.to_string(),
            agent_id: Some(entry.agent_id),
            status: TaskResultStatus::Timeout,
            result: None,
            error: Some("task timed out".to_string()),
            execution_time,
        };
        self.complete(task_id, result).await;
    }

    // ---- completion pipeline -------------------------------------------------------

    async fn handle_task_progress(self: &Arc<Self>, payload: serde_json::Value) {
        let task_id = match payload.get("taskId").and_then(|v| v.as_str()) {
            Some(s) => s.to_string(),
            None => return,
        };
        let has_result = payload.get("result").map(|v| !v.is_null()).unwrap_or(false);
        let has_error = payload.get("error").map(|v| !v.is_null()).unwrap_or(false);
        if !has_result && !has_error {
            return; // progress tick, not a terminal event
        }

        let agent_id = payload
            .get("agentId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let start_ms = self.processing.read().await.get(&task_id).map(|e| e.start_time_ms);
        let now_ms = chrono::Utc::now().timestamp_millis();
        let execution_time = start_ms
            .map(|s| Duration::from_millis((now_ms - s).max(0) as u64))
            .unwrap_or(Duration::ZERO);

        let result = if has_error {
            TaskResult {
                task_id: task_id.clone(),
                agent_id,
                status: TaskResultStatus::Error,
                result: None,
                error: payload.get("error").and_then(|v| v.as_str()).map(|s| s.to_string()),
                execution_time,
            }
        } else {
            TaskResult {
                task_id: task_id.clone(),
                agent_id,
                status: TaskResultStatus::Success,
                result: payload.get("result").cloned(),
                error: None,
                execution_time,
            }
        };
        self.complete(&task_id, result).await;
    }

    /// Entry point for any terminal (or retryable) outcome, whether from a
    /// `taskProgress` event, a timeout, or a dispatch failure. Exposed at
    /// crate visibility so the broker's `taskProgress` publishing path and
    /// the workflow manager's tests can drive completions directly.
    pub(crate) async fn complete(self: &Arc<Self>, task_id: &str, result: TaskResult) {
        self.clear_timeout(task_id).await;

        if result.status == TaskResultStatus::Error {
            let def = self.definitions.read().await.get(task_id).cloned();
            if let Some(def) = def {
                let message = result.error.clone().unwrap_or_default();
                if retry_policy::is_retryable(&message) && def.retry_count < def.retry_policy.max_retries {
                    self.schedule_retry(task_id, def).await;
                    return;
                }
            }
        }

        self.finalize(task_id, result).await;
    }

    async fn schedule_retry(self: &Arc<Self>, task_id: &str, mut def: TaskDefinition) {
        let delay = retry_policy::backoff_delay(def.retry_count, &def.retry_policy);
        def.retry_count += 1;
        self.definitions.write().await.insert(task_id.to_string(), def.clone());

        self.processing.write().await.remove(task_id);
        {
            let mut queues = self.queues.write().await;
            if let Some((_, counters)) = queues.get_mut(&def.agent_class) {
                counters.current_tasks = counters.current_tasks.saturating_sub(1);
            }
        }
        self.pending.write().await.insert(task_id.to_string());

        let _ = self.events.send(EngineEvent::Retry {
            task_id: task_id.to_string(),
            attempt: def.retry_count,
        });
        info!(task_id, attempt = def.retry_count, delay_ms = delay.as_millis() as u64, "scheduling retry");

        let engine = self.clone();
        let id = task_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            engine.try_process(&id).await;
        });
    }

    async fn finalize(self: &Arc<Self>, task_id: &str, result: TaskResult) {
        let def = self.definitions.read().await.get(task_id).cloned();
        let agent_class = def.as_ref().map(|d| d.agent_class);

        let was_processing = self.processing.write().await.remove(task_id).is_some();
        self.pending.write().await.remove(task_id);
        self.completed.write().await.insert(task_id.to_string(), result.clone());

        if let Some(class) = agent_class {
            let now_ms = chrono::Utc::now().timestamp_millis();
            {
                let mut queues = self.queues.write().await;
                if let Some((_, counters)) = queues.get_mut(&class) {
                    if was_processing {
                        counters.current_tasks = counters.current_tasks.saturating_sub(1);
                    }
                    match result.status {
                        TaskResultStatus::Success => counters.completed_tasks += 1,
                        _ => counters.failed_tasks += 1,
                    }
                }
            }
            self.metrics
                .write()
                .await
                .entry(class)
                .or_default()
                .record_completion(result.status, result.execution_time, now_ms);
        }

        let next_status = if result.status == TaskResultStatus::Success {
            DependencyStatus::Completed
        } else {
            DependencyStatus::Failed
        };
        {
            let mut deps = self.dependencies.write().await;
            if let Some(rec) = deps.get_mut(task_id) {
                rec.transition(next_status);
            }
        }

        let dependents: Vec<String> = self
            .dependencies
            .read()
            .await
            .iter()
            .filter(|(_, rec)| rec.depends_on.contains(task_id))
            .map(|(id, _)| id.clone())
            .collect();
        for dep_id in dependents {
            self.check_dependencies(&dep_id).await;
        }

        if let Some(agent_id) = result.agent_id.clone() {
            let mut meta = HashMap::new();
            meta.insert("currentTask".to_string(), serde_json::Value::Null);
            meta.insert("lastCompletedTask".to_string(), serde_json::json!(task_id));
            let _ = self.registry.update_status(&agent_id, AgentStatus::Active, meta).await;
        }

        if result.status == TaskResultStatus::Error {
            notify::notify_best_effort(
                self.notify.as_ref(),
                SystemAlert {
                    kind: "systemIssue".to_string(),
                    severity: Severity::Medium,
                    message: result.error.clone().unwrap_or_default(),
                    payload: serde_json::json!({ "taskId": task_id }),
                },
            )
            .await;
        }

        if let Some(class) = agent_class {
            self.process_next_pending(class).await;
        }

        info!(task_id, status = ?result.status, "task completed");
        let _ = self.events.send(EngineEvent::Completed(result));
    }

    async fn process_next_pending(self: &Arc<Self>, class: AgentClass) {
        loop {
            if self.is_saturated(class).await {
                break;
            }
            let candidate = {
                let pending = self.pending.read().await;
                let defs = self.definitions.read().await;
                let deps = self.dependencies.read().await;
                pending
                    .iter()
                    .filter(|id| defs.get(*id).map(|d| d.agent_class == class).unwrap_or(false))
                    .find(|id| match deps.get(*id) {
                        None => true,
                        Some(rec) => rec.status == DependencyStatus::Ready,
                    })
                    .cloned()
            };
            match candidate {
                Some(id) => self.try_process(&id).await,
                None => break,
            }
        }
        self.backlog_watchdog(class).await;
    }

    async fn backlog_watchdog(&self, class: AgentClass) {
        let max = self
            .queues
            .read()
            .await
            .get(&class)
            .map(|(cfg, _)| cfg.max_concurrency)
            .unwrap_or(1);
        let count = {
            let pending = self.pending.read().await;
            let defs = self.definitions.read().await;
            pending
                .iter()
                .filter(|id| defs.get(*id).map(|d| d.agent_class == class).unwrap_or(false))
                .count() as u32
        };
        let threshold = 2 * max;
        if count > 3 * max {
            let severity = if count > 2 * threshold { Severity::High } else { Severity::Medium };
            notify::notify_best_effort(
                self.notify.as_ref(),
                SystemAlert {
                    kind: "queueBacklog".to_string(),
                    severity,
                    message: format!("{} pending tasks for class {}", count, class.as_str()),
                    payload: serde_json::json!({ "agentClass": class.as_str(), "pendingCount": count }),
                },
            )
            .await;
        }
    }

    // ---- cancellation & observability --------------------------------------------

    pub async fn cancel(self: &Arc<Self>, task_id: &str) -> Result<(), OrchestratorError> {
        if self.pending.write().await.remove(task_id) {
            return Ok(());
        }

        let entry = self.processing.write().await.remove(task_id);
        if let Some(_entry) = entry {
            self.clear_timeout(task_id).await;
            if let Some(def) = self.definitions.read().await.get(task_id).cloned() {
                let msg = AgentMessage::cancel(def.agent_class, task_id);
                let _ = self.broker.enqueue(def.agent_class.as_str(), msg).await;
                let mut queues = self.queues.write().await;
                if let Some((_, counters)) = queues.get_mut(&def.agent_class) {
                    counters.current_tasks = counters.current_tasks.saturating_sub(1);
                }
            }
            return Ok(());
        }

        if self.completed.read().await.contains_key(task_id) {
            return Err(OrchestratorError::TaskAlreadyTerminal(task_id.to_string()));
        }
        Err(OrchestratorError::TaskNotFound(task_id.to_string()))
    }

    pub async fn get_task_status(&self, task_id: &str) -> Result<PublicTaskStatus, OrchestratorError> {
        if self.pending.read().await.contains(task_id) {
            let waiting_on = {
                let deps = self.dependencies.read().await;
                match deps.get(task_id) {
                    Some(rec) if rec.status == DependencyStatus::Waiting => Some(rec.depends_on.clone()),
                    _ => None,
                }
            };
            if let Some(depends_on) = waiting_on {
                if let Some(dependency) = self.blocked_on_dependency(&depends_on).await {
                    return Err(OrchestratorError::DependencyFailure {
                        task: task_id.to_string(),
                        dependency,
                    });
                }
            }
            return Ok(PublicTaskStatus::Pending);
        }
        if self.processing.read().await.contains_key(task_id) {
            return Ok(PublicTaskStatus::Processing);
        }
        if let Some(result) = self.completed.read().await.get(task_id) {
            return Ok(match result.status {
                TaskResultStatus::Success => PublicTaskStatus::Completed,
                TaskResultStatus::Error => PublicTaskStatus::Failed,
                TaskResultStatus::Timeout => PublicTaskStatus::Timeout,
            });
        }
        Err(OrchestratorError::TaskNotFound(task_id.to_string()))
    }

    pub async fn get_queue_status(&self, class: Option<AgentClass>) -> Vec<QueueStatus> {
        let queues = self.queues.read().await;
        let pending = self.pending.read().await;
        let defs = self.definitions.read().await;
        queues
            .iter()
            .filter(|(c, _)| class.map(|want| want == **c).unwrap_or(true))
            .map(|(c, (cfg, counters))| {
                let pending_count = pending
                    .iter()
                    .filter(|id| defs.get(*id).map(|d| d.agent_class == *c).unwrap_or(false))
                    .count() as u32;
                QueueStatus {
                    agent_class: *c,
                    config: *cfg,
                    counters: *counters,
                    pending_count,
                }
            })
            .collect()
    }

    pub async fn get_task_metrics(&self, class: Option<AgentClass>) -> Vec<TaskMetricsSnapshot> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let metrics = self.metrics.read().await;
        AgentClass::ALL
            .iter()
            .filter(|c| class.map(|want| want == **c).unwrap_or(true))
            .filter_map(|c| metrics.get(c).map(|acc| acc.snapshot(*c, now_ms)))
            .collect()
    }

    /// Best-effort: cancel every currently-processing task. Used by the
    /// facade on shutdown (§4.E).
    pub async fn cancel_all_processing(self: &Arc<Self>) {
        let ids: Vec<String> = self.processing.read().await.keys().cloned().collect();
        for id in ids {
            let _ = self.cancel(&id).await;
        }
    }
}

fn to_dispatch_request(def: &TaskDefinition) -> DispatchRequest {
    DispatchRequest {
        task_id: def.id.clone(),
        task_type: def.task_type.clone(),
        agent_class: def.agent_class,
        payload: def.payload.clone(),
        timeout_ms: def.timeout.as_millis() as u64,
        priority: Some(def.priority),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::FakeBroker;
    use std::collections::HashSet;

    async fn setup() -> (Arc<TaskDistributionEngine>, Arc<AgentRegistry>, Arc<dyn Broker>) {
        let broker: Arc<dyn Broker> = Arc::new(FakeBroker::new());
        let registry = Arc::new(AgentRegistry::new(broker.clone()));
        let notify: Arc<dyn NotificationSink> = Arc::new(crate::notify::BrokerNotificationSink::new(broker.clone()));
        let engine = TaskDistributionEngine::new(broker.clone(), registry.clone(), notify, Duration::from_secs(90));
        (engine, registry, broker)
    }

    async fn register_agent(registry: &AgentRegistry, id: &str, class: AgentClass) {
        registry
            .register(id.to_string(), class, HashSet::new(), AgentStatus::Active, HashMap::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn submit_without_agents_yields_agent_unavailable_with_no_side_effects() {
        let (engine, _registry, _broker) = setup().await;
        let input = TaskDefinitionInput::new("extract_text", AgentClass::Ingestion, serde_json::json!({}));
        let err = engine.submit_task(input).await.unwrap_err();
        assert_eq!(err.kind(), "AgentUnavailable");

        let status = engine.get_queue_status(Some(AgentClass::Ingestion)).await;
        assert_eq!(status[0].counters.total_tasks, 0);
    }

    #[tokio::test]
    async fn submit_with_available_agent_starts_processing() {
        let (engine, registry, _broker) = setup().await;
        register_agent(&registry, "a1", AgentClass::Ingestion).await;
        let input = TaskDefinitionInput::new("extract_text", AgentClass::Ingestion, serde_json::json!({}));
        let id = engine.submit_task(input).await.unwrap();
        assert_eq!(engine.get_task_status(&id).await.unwrap(), PublicTaskStatus::Processing);
    }

    #[tokio::test]
    async fn dependent_not_admitted_until_dependency_completes() {
        let (engine, registry, _broker) = setup().await;
        register_agent(&registry, "ing1", AgentClass::Ingestion).await;
        register_agent(&registry, "an1", AgentClass::Analysis).await;

        let step0 = engine
            .submit_task(TaskDefinitionInput::new("extract_text", AgentClass::Ingestion, serde_json::json!({})))
            .await
            .unwrap();

        let mut deps = HashSet::new();
        deps.insert(step0.clone());
        let step1 = engine
            .submit_task(
                TaskDefinitionInput::new("generate_summary", AgentClass::Analysis, serde_json::json!({}))
                    .with_dependencies(deps),
            )
            .await
            .unwrap();
        assert_eq!(engine.get_task_status(&step1).await.unwrap(), PublicTaskStatus::Pending);

        engine
            .complete(
                &step0,
                TaskResult {
                    task_id: step0.clone(),
                    agent_id: Some("ing1".to_string()),
                    status: TaskResultStatus::Success,
                    result: Some(serde_json::json!({"text": "hi"})),
                    error: None,
                    execution_time: Duration::from_millis(5),
                },
            )
            .await;

        assert_eq!(engine.get_task_status(&step1).await.unwrap(), PublicTaskStatus::Processing);
    }

    #[tokio::test]
    async fn saturated_queue_keeps_tasks_pending_until_slot_frees() {
        let (engine, registry, _broker) = setup().await;
        register_agent(&registry, "s1", AgentClass::Synthesis).await; // max_concurrency = 2
        register_agent(&registry, "s2", AgentClass::Synthesis).await;

        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = engine
                .submit_task(TaskDefinitionInput::new("compile_notebook", AgentClass::Synthesis, serde_json::json!({})))
                .await
                .unwrap();
            ids.push(id);
        }
        assert_eq!(engine.get_task_status(&ids[0]).await.unwrap(), PublicTaskStatus::Processing);
        assert_eq!(engine.get_task_status(&ids[1]).await.unwrap(), PublicTaskStatus::Processing);
        assert_eq!(engine.get_task_status(&ids[2]).await.unwrap(), PublicTaskStatus::Pending);

        engine
            .complete(
                &ids[0],
                TaskResult {
                    task_id: ids[0].clone(),
                    agent_id: Some("s1".to_string()),
                    status: TaskResultStatus::Success,
                    result: Some(serde_json::json!({})),
                    error: None,
                    execution_time: Duration::from_millis(5),
                },
            )
            .await;

        assert_eq!(engine.get_task_status(&ids[2]).await.unwrap(), PublicTaskStatus::Processing);
    }

    #[tokio::test]
    async fn retryable_error_is_retried_then_exhausts() {
        let (engine, registry, _broker) = setup().await;
        register_agent(&registry, "a1", AgentClass::Analysis).await;

        let input = TaskDefinitionInput::new("generate_summary", AgentClass::Analysis, serde_json::json!({}));
        let id = engine.submit_task(input).await.unwrap();

        // default retry policy allows 3 retries (retry_count 0, 1, 2); the
        // 4th failure (retry_count == max_retries) finalizes.
        for _ in 0..4 {
            engine
                .complete(
                    &id,
                    TaskResult {
                        task_id: id.clone(),
                        agent_id: Some("a1".to_string()),
                        status: TaskResultStatus::Error,
                        result: None,
                        error: Some("connection refused".to_string()),
                        execution_time: Duration::from_millis(5),
                    },
                )
                .await;
        }

        assert_eq!(engine.get_task_status(&id).await.unwrap(), PublicTaskStatus::Failed);
    }
}
