//! In-memory [`Broker`] used by tests (§4.J), so registry/engine/workflow
//! tests don't need a live Redis instance.
//!
//! Grounded on `clawd::scheduler::accounts::AccountPool` (in-memory state
//! behind an `RwLock`, standing in for a persisted store) and
//! `clawd::scheduler::queue::SchedulerQueue` for the priority-vs-FIFO split.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::message::{namespaced, AgentMessage, Channel};
use super::{Broker, BrokerResult, SetOptions};

const FANOUT_CAPACITY: usize = 1024;

struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Queues {
    fifo: HashMap<String, VecDeque<AgentMessage>>,
    priority: HashMap<String, Vec<AgentMessage>>,
}

pub struct FakeBroker {
    kv: Mutex<HashMap<String, StoredValue>>,
    queues: Mutex<Queues>,
    dead_letter: Mutex<Vec<serde_json::Value>>,
    locks: Mutex<HashMap<String, Instant>>,
    agent_status: broadcast::Sender<serde_json::Value>,
    task_progress: broadcast::Sender<serde_json::Value>,
    system_events: broadcast::Sender<serde_json::Value>,
}

impl Default for FakeBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBroker {
    pub fn new() -> Self {
        Self {
            kv: Mutex::new(HashMap::new()),
            queues: Mutex::new(Queues::default()),
            dead_letter: Mutex::new(Vec::new()),
            locks: Mutex::new(HashMap::new()),
            agent_status: broadcast::channel(FANOUT_CAPACITY).0,
            task_progress: broadcast::channel(FANOUT_CAPACITY).0,
            system_events: broadcast::channel(FANOUT_CAPACITY).0,
        }
    }

    fn sender(&self, channel: Channel) -> &broadcast::Sender<serde_json::Value> {
        match channel {
            Channel::AgentStatus => &self.agent_status,
            Channel::TaskProgress => &self.task_progress,
            Channel::SystemEvents => &self.system_events,
        }
    }

    /// Test helper: number of dead-lettered envelopes recorded so far.
    pub fn dead_letter_count(&self) -> usize {
        self.dead_letter.lock().unwrap().len()
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn set(&self, key: &str, value: &str, opts: SetOptions) -> BrokerResult<()> {
        let full_key = namespaced(opts.prefix, key);
        let expires_at = opts.ttl.map(|ttl| Instant::now() + ttl);
        self.kv.lock().unwrap().insert(
            full_key,
            StoredValue { value: value.to_string(), expires_at },
        );
        Ok(())
    }

    async fn get(&self, key: &str, prefix: Option<&str>) -> BrokerResult<Option<String>> {
        let full_key = namespaced(prefix, key);
        let mut kv = self.kv.lock().unwrap();
        if let Some(stored) = kv.get(&full_key) {
            if let Some(expires_at) = stored.expires_at {
                if Instant::now() >= expires_at {
                    kv.remove(&full_key);
                    return Ok(None);
                }
            }
            return Ok(Some(stored.value.clone()));
        }
        Ok(None)
    }

    async fn del(&self, key: &str, prefix: Option<&str>) -> BrokerResult<()> {
        let full_key = namespaced(prefix, key);
        self.kv.lock().unwrap().remove(&full_key);
        Ok(())
    }

    async fn exists(&self, key: &str, prefix: Option<&str>) -> BrokerResult<bool> {
        Ok(self.get(key, prefix).await?.is_some())
    }

    async fn enqueue(&self, class: &str, msg: AgentMessage) -> BrokerResult<()> {
        let mut queues = self.queues.lock().unwrap();
        if msg.priority.is_some() {
            queues.priority.entry(class.to_string()).or_default().push(msg);
        } else {
            queues.fifo.entry(class.to_string()).or_default().push_back(msg);
        }
        Ok(())
    }

    async fn dequeue(
        &self,
        class: &str,
        blocking_timeout: Duration,
    ) -> BrokerResult<Option<AgentMessage>> {
        let deadline = Instant::now() + blocking_timeout;
        loop {
            {
                let mut queues = self.queues.lock().unwrap();
                if let Some(bucket) = queues.priority.get_mut(class) {
                    if let Some((idx, _)) = bucket
                        .iter()
                        .enumerate()
                        .max_by_key(|(_, m)| m.priority.unwrap_or(i32::MIN))
                    {
                        return Ok(Some(bucket.remove(idx)));
                    }
                }
                if let Some(bucket) = queues.fifo.get_mut(class) {
                    if let Some(msg) = bucket.pop_front() {
                        return Ok(Some(msg));
                    }
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn queue_length(&self, class: &str) -> BrokerResult<u64> {
        let queues = self.queues.lock().unwrap();
        let fifo_len = queues.fifo.get(class).map(|q| q.len()).unwrap_or(0);
        let priority_len = queues.priority.get(class).map(|q| q.len()).unwrap_or(0);
        Ok((fifo_len + priority_len) as u64)
    }

    async fn move_to_dead_letter(&self, original_class: &str, msg: AgentMessage) -> BrokerResult<()> {
        let envelope = serde_json::json!({
            "message": msg,
            "deadLetterTimestamp": chrono::Utc::now().timestamp_millis(),
            "originalClass": original_class,
        });
        self.dead_letter.lock().unwrap().push(envelope);
        Ok(())
    }

    async fn publish(&self, channel: Channel, payload: serde_json::Value) -> BrokerResult<()> {
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    fn subscribe(&self, channel: Channel) -> broadcast::Receiver<serde_json::Value> {
        self.sender(channel).subscribe()
    }

    async fn acquire_lock(&self, name: &str, ttl: Duration) -> BrokerResult<bool> {
        let mut locks = self.locks.lock().unwrap();
        let now = Instant::now();
        if let Some(expires_at) = locks.get(name) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        locks.insert(name.to_string(), now + ttl);
        Ok(true)
    }

    async fn release_lock(&self, name: &str) -> BrokerResult<()> {
        self.locks.lock().unwrap().remove(name);
        Ok(())
    }

    async fn ping(&self) -> BrokerResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::model::AgentClass;

    #[tokio::test]
    async fn priority_dequeues_before_fifo() {
        let broker = FakeBroker::new();
        let low = AgentMessage::task(AgentClass::Analysis, "t1", "x", serde_json::json!({}), 1000, Some(1));
        let high = AgentMessage::task(AgentClass::Analysis, "t2", "x", serde_json::json!({}), 1000, Some(10));
        broker.enqueue("analysis", low).await.unwrap();
        broker.enqueue("analysis", high).await.unwrap();

        let first = broker.dequeue("analysis", Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.payload["taskId"], "t2");
        let second = broker.dequeue("analysis", Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(second.payload["taskId"], "t1");
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let broker = FakeBroker::new();
        assert!(broker.acquire_lock("x", Duration::from_secs(5)).await.unwrap());
        assert!(!broker.acquire_lock("x", Duration::from_secs(5)).await.unwrap());
        broker.release_lock("x").await.unwrap();
        assert!(broker.acquire_lock("x", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn ttl_expiry_drops_value() {
        let broker = FakeBroker::new();
        broker
            .set("k", "v", SetOptions::with_ttl(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(broker.get("k", None).await.unwrap(), Some("v".to_string()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.get("k", None).await.unwrap(), None);
    }
}
