//! Agent Registry (§4.B): tracks agents in-process for fast lookup, mirrors
//! registrations to the broker for short-TTL cross-service visibility, and
//! dispatches tasks to available agents.
//!
//! Grounded on `clawd::agents::lifecycle::AgentRegistry` for the data model
//! and heartbeat eviction, and `clawd::agents::orchestrator::Orchestrator`
//! for the TOCTOU-safe check-then-register dispatch shape.

pub mod liveness;
pub mod model;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::broker::{keys, Broker, Channel, SetOptions};
use crate::error::OrchestratorError;
use model::{AgentClass, AgentRegistration, AgentStatus, DispatchRequest};

/// In-process event emitted on `agentStatus` refresh (§4.B "Subscription
/// wiring"), separate from the broker-level pub/sub message.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    StatusChanged(AgentRegistration),
    Registered(AgentRegistration),
    Unregistered(String),
}

struct State {
    agents: HashMap<String, AgentRegistration>,
    /// Registration order per class, used to break round-robin ties
    /// deterministically (§4.B: "ties broken by insertion order").
    order: HashMap<AgentClass, Vec<String>>,
    /// Rotation cursor per class for round-robin dispatch.
    cursor: HashMap<AgentClass, usize>,
}

pub struct AgentRegistry {
    broker: Arc<dyn Broker>,
    state: RwLock<State>,
    events: broadcast::Sender<RegistryEvent>,
}

impl AgentRegistry {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            state: RwLock::new(State {
                agents: HashMap::new(),
                order: HashMap::new(),
                cursor: HashMap::new(),
            }),
            events: broadcast::channel(256).0,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Wire the registry's reaction to the broker's `agentStatus` channel
    /// (§4.B "Subscription wiring"): refresh the local record and re-emit an
    /// in-process `StatusChanged` event.
    pub fn spawn_status_listener(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        let mut rx = self.broker.subscribe(Channel::AgentStatus);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => registry.handle_agent_status_message(payload).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "agentStatus listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn handle_agent_status_message(&self, payload: serde_json::Value) {
        let agent_id = match payload.get("agentId").and_then(|v| v.as_str()) {
            Some(id) => id.to_string(),
            None => return,
        };
        let mut state = self.state.write().await;
        if let Some(entry) = state.agents.get_mut(&agent_id) {
            entry.last_heartbeat_ms = chrono::Utc::now().timestamp_millis();
            if let Some(status) = payload.get("status").and_then(|v| v.as_str()) {
                entry.status = match status {
                    "active" => AgentStatus::Active,
                    "inactive" => AgentStatus::Inactive,
                    "busy" => AgentStatus::Busy,
                    "error" => AgentStatus::Error,
                    _ => entry.status,
                };
            }
            let updated = entry.clone();
            let _ = self.events.send(RegistryEvent::StatusChanged(updated));
        }
    }

    pub async fn register(
        &self,
        agent_id: String,
        agent_class: AgentClass,
        capabilities: std::collections::HashSet<String>,
        status: AgentStatus,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<(), OrchestratorError> {
        let registration = AgentRegistration::new(agent_id.clone(), agent_class, capabilities, status, metadata);

        {
            let mut state = self.state.write().await;
            if !state.agents.contains_key(&agent_id) {
                state.order.entry(agent_class).or_default().push(agent_id.clone());
            }
            state.agents.insert(agent_id.clone(), registration.clone());
        }

        self.mirror_to_broker(&registration).await;
        self.publish_system_event("agent_registered", &registration).await;
        let _ = self.events.send(RegistryEvent::Registered(registration));
        info!(agent_id, class = agent_class.as_str(), "agent registered");
        Ok(())
    }

    pub async fn unregister(&self, agent_id: &str) -> Result<(), OrchestratorError> {
        let removed = {
            let mut state = self.state.write().await;
            let removed = state
                .agents
                .remove(agent_id)
                .ok_or_else(|| OrchestratorError::AgentNotFound(agent_id.to_string()))?;
            if let Some(order) = state.order.get_mut(&removed.agent_class) {
                order.retain(|id| id != agent_id);
            }
            removed
        };

        let _ = self
            .broker
            .del(&keys::agent_key(agent_id), Some(keys::REGISTRY_PREFIX))
            .await;
        self.publish_system_event("agent_unregistered", &removed).await;
        let _ = self.events.send(RegistryEvent::Unregistered(agent_id.to_string()));
        info!(agent_id, "agent unregistered");
        Ok(())
    }

    pub async fn update_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        metadata_delta: HashMap<String, serde_json::Value>,
    ) -> Result<(), OrchestratorError> {
        let updated = {
            let mut state = self.state.write().await;
            let entry = state
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| OrchestratorError::AgentNotFound(agent_id.to_string()))?;
            entry.status = status;
            entry.last_heartbeat_ms = chrono::Utc::now().timestamp_millis();
            entry.metadata.extend(metadata_delta);
            entry.clone()
        };

        self.mirror_to_broker(&updated).await;
        let payload = serde_json::json!({
            "agentId": updated.agent_id,
            "status": status_str(updated.status),
            "metadata": updated.metadata,
            "timestamp": updated.last_heartbeat_ms,
        });
        let _ = self.broker.publish(Channel::AgentStatus, payload).await;
        Ok(())
    }

    pub async fn list_by_class(&self, class: Option<AgentClass>) -> Vec<AgentRegistration> {
        let state = self.state.read().await;
        state
            .agents
            .values()
            .filter(|a| class.map(|c| c == a.agent_class).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub async fn list_available(&self, class: AgentClass, timeout: Duration) -> Vec<AgentRegistration> {
        let now = chrono::Utc::now().timestamp_millis();
        let state = self.state.read().await;
        state
            .agents
            .values()
            .filter(|a| a.agent_class == class)
            .filter(|a| a.status == AgentStatus::Active)
            .filter(|a| !a.is_stale(now, timeout))
            .cloned()
            .collect()
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentRegistration> {
        self.state.read().await.agents.get(agent_id).cloned()
    }

    /// Evict agents whose heartbeat has aged past `timeout` (§4.B
    /// "Liveness"). Reuses `unregister` so the broadcast fires the same
    /// `agent_unregistered` event as an explicit unregister.
    pub async fn evict_stale(&self, timeout: Duration) -> Result<Vec<String>, OrchestratorError> {
        let now = chrono::Utc::now().timestamp_millis();
        let stale: Vec<String> = {
            let state = self.state.read().await;
            state
                .agents
                .values()
                .filter(|a| a.agent_class != AgentClass::Orchestrator)
                .filter(|a| a.is_stale(now, timeout))
                .map(|a| a.agent_id.clone())
                .collect()
        };
        for id in &stale {
            self.unregister(id).await?;
        }
        Ok(stale)
    }

    /// Select the next available agent of `task.agent_class` by round-robin
    /// (ties broken by insertion order), enqueue a task message on its
    /// class queue, and mark the agent `busy`. Never selects an
    /// `orchestrator`-class agent (§9 "Cycle avoidance").
    pub async fn distribute_task(
        &self,
        task: &DispatchRequest,
        agent_timeout: Duration,
    ) -> Result<String, OrchestratorError> {
        if task.agent_class == AgentClass::Orchestrator {
            return Err(OrchestratorError::AgentUnavailable(task.agent_class.as_str().to_string()));
        }

        let chosen = {
            let mut state = self.state.write().await;
            let now = chrono::Utc::now().timestamp_millis();
            let order = state.order.entry(task.agent_class).or_default().clone();
            let available: Vec<&String> = order
                .iter()
                .filter(|id| {
                    state
                        .agents
                        .get(*id)
                        .map(|a| a.status == AgentStatus::Active && !a.is_stale(now, agent_timeout))
                        .unwrap_or(false)
                })
                .collect();
            if available.is_empty() {
                return Err(OrchestratorError::AgentUnavailable(task.agent_class.as_str().to_string()));
            }
            let cursor = state.cursor.entry(task.agent_class).or_insert(0);
            let idx = *cursor % available.len();
            *cursor = (*cursor + 1) % available.len().max(1);
            let agent_id = available[idx].clone();

            let entry = state.agents.get_mut(&agent_id).expect("agent present");
            entry.status = AgentStatus::Busy;
            entry.last_heartbeat_ms = now;
            entry.metadata.insert("currentTask".to_string(), serde_json::json!(task.task_id));
            entry.metadata.insert("taskStartTime".to_string(), serde_json::json!(now));
            entry.clone()
        };

        self.mirror_to_broker(&chosen).await;

        let msg = crate::broker::AgentMessage::task(
            task.agent_class,
            &task.task_id,
            &task.task_type,
            task.payload.clone(),
            task.timeout_ms,
            task.priority,
        );
        self.broker
            .enqueue(task.agent_class.as_str(), msg)
            .await
            .map_err(|e| OrchestratorError::BrokerUnavailable(e.to_string()))?;

        Ok(chosen.agent_id)
    }

    async fn mirror_to_broker(&self, registration: &AgentRegistration) {
        if let Ok(encoded) = serde_json::to_string(registration) {
            let _ = self
                .broker
                .set(
                    &keys::agent_key(&registration.agent_id),
                    &encoded,
                    SetOptions::with_ttl(keys::REGISTRY_TTL).with_prefix(keys::REGISTRY_PREFIX),
                )
                .await;
        }
    }

    async fn publish_system_event(&self, event_type: &str, registration: &AgentRegistration) {
        let payload = serde_json::json!({
            "type": event_type,
            "agentId": registration.agent_id,
            "agentClass": registration.agent_class.as_str(),
            "timestamp": chrono::Utc::now().timestamp_millis(),
        });
        let _ = self.broker.publish(Channel::SystemEvents, payload).await;
    }
}

fn status_str(status: AgentStatus) -> &'static str {
    match status {
        AgentStatus::Active => "active",
        AgentStatus::Inactive => "inactive",
        AgentStatus::Busy => "busy",
        AgentStatus::Error => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::FakeBroker;
    use std::collections::HashSet;

    fn broker() -> Arc<dyn Broker> {
        Arc::new(FakeBroker::new())
    }

    #[tokio::test]
    async fn register_then_unregister_leaves_empty() {
        let registry = AgentRegistry::new(broker());
        registry
            .register("a1".into(), AgentClass::Ingestion, HashSet::new(), AgentStatus::Active, HashMap::new())
            .await
            .unwrap();
        assert!(registry.get("a1").await.is_some());
        registry.unregister("a1").await.unwrap();
        assert!(registry.get("a1").await.is_none());
    }

    #[tokio::test]
    async fn unregister_unknown_errors() {
        let registry = AgentRegistry::new(broker());
        let err = registry.unregister("missing").await.unwrap_err();
        assert_eq!(err.kind(), "AgentNotFound");
    }

    #[tokio::test]
    async fn distribute_task_round_robins_with_insertion_order_tiebreak() {
        let registry = AgentRegistry::new(broker());
        for id in ["a1", "a2"] {
            registry
                .register(id.into(), AgentClass::Analysis, HashSet::new(), AgentStatus::Active, HashMap::new())
                .await
                .unwrap();
        }
        let task = DispatchRequest {
            task_id: "t1".into(),
            task_type: "x".into(),
            agent_class: AgentClass::Analysis,
            payload: serde_json::json!({}),
            timeout_ms: 1000,
            priority: None,
        };
        let first = registry.distribute_task(&task, Duration::from_secs(90)).await.unwrap();
        assert_eq!(first, "a1");

        // a1 is now busy; re-activate it and keep a2 active, next pick should
        // still rotate rather than starving a2.
        registry
            .update_status("a1".into(), AgentStatus::Active, HashMap::new())
            .await
            .unwrap();
        let second = registry.distribute_task(&task, Duration::from_secs(90)).await.unwrap();
        assert_eq!(second, "a2");
    }

    #[tokio::test]
    async fn distribute_task_fails_with_no_available_agents() {
        let registry = AgentRegistry::new(broker());
        let task = DispatchRequest {
            task_id: "t1".into(),
            task_type: "x".into(),
            agent_class: AgentClass::Synthesis,
            payload: serde_json::json!({}),
            timeout_ms: 1000,
            priority: None,
        };
        let err = registry.distribute_task(&task, Duration::from_secs(90)).await.unwrap_err();
        assert_eq!(err.kind(), "AgentUnavailable");
    }

    #[tokio::test]
    async fn orchestrator_class_is_never_dispatched() {
        let registry = AgentRegistry::new(broker());
        registry
            .register("orc-1".into(), AgentClass::Orchestrator, HashSet::new(), AgentStatus::Active, HashMap::new())
            .await
            .unwrap();
        let task = DispatchRequest {
            task_id: "t1".into(),
            task_type: "x".into(),
            agent_class: AgentClass::Orchestrator,
            payload: serde_json::json!({}),
            timeout_ms: 1000,
            priority: None,
        };
        let err = registry.distribute_task(&task, Duration::from_secs(90)).await.unwrap_err();
        assert_eq!(err.kind(), "AgentUnavailable");
    }

    #[tokio::test]
    async fn evict_stale_removes_aged_out_agents() {
        let registry = AgentRegistry::new(broker());
        registry
            .register("a1".into(), AgentClass::Ingestion, HashSet::new(), AgentStatus::Active, HashMap::new())
            .await
            .unwrap();
        {
            let mut state = registry.state.write().await;
            state.agents.get_mut("a1").unwrap().last_heartbeat_ms -= 200_000;
        }
        let evicted = registry.evict_stale(Duration::from_secs(90)).await.unwrap();
        assert_eq!(evicted, vec!["a1".to_string()]);
        assert!(registry.get("a1").await.is_none());
    }
}
