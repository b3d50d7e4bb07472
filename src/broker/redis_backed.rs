//! Redis-backed [`Broker`] implementation.
//!
//! Three logical client roles are kept separate, matching §4.A: `command`
//! and `publisher` are each a `redis::aio::ConnectionManager` (cheap,
//! multiplexed, auto-reconnecting), and `subscriber` is a dedicated
//! long-lived pub/sub connection driven by a background task so a stalled
//! subscription never blocks an ordinary command. Initial connection uses
//! reconnect-with-capped-backoff, grounded on
//! `clawd::scheduler::backoff::next_backoff` (cap ~500 ms, bounded attempts).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use super::message::{namespaced, AgentMessage, Channel};
use super::{Broker, BrokerError, BrokerResult, SetOptions};
use crate::config::OrchestratorConfig;
use crate::retry::{retry_with_backoff, RetryConfig};

const RECONNECT_CAP: Duration = Duration::from_millis(500);
const RECONNECT_INITIAL_DELAY: Duration = Duration::from_millis(50);
const RECONNECT_ATTEMPTS: u32 = 5;
const FANOUT_CAPACITY: usize = 1024;

fn deadletter_key() -> String {
    "queue:deadletter".to_string()
}

fn fifo_key(class: &str) -> String {
    format!("queue:{class}:fifo")
}

fn priority_key(class: &str) -> String {
    format!("queue:{class}:priority")
}

fn lock_key(name: &str) -> String {
    format!("lock:{name}")
}

struct ChannelFanout {
    senders: HashMap<&'static str, broadcast::Sender<serde_json::Value>>,
}

impl ChannelFanout {
    fn new() -> Self {
        let mut senders = HashMap::new();
        for channel in Channel::ALL {
            let (tx, _rx) = broadcast::channel(FANOUT_CAPACITY);
            senders.insert(channel.as_str(), tx);
        }
        Self { senders }
    }

    fn sender(&self, channel: Channel) -> &broadcast::Sender<serde_json::Value> {
        self.senders.get(channel.as_str()).expect("all channels registered")
    }
}

pub struct RedisBroker {
    command: redis::aio::ConnectionManager,
    publisher: redis::aio::ConnectionManager,
    fanout: Arc<ChannelFanout>,
    _subscriber_task: tokio::task::JoinHandle<()>,
}

impl RedisBroker {
    pub async fn connect(config: &OrchestratorConfig) -> BrokerResult<Self> {
        let client = redis::Client::open(config.redis_url())
            .map_err(|e| BrokerError::ConnectFailed(e.to_string()))?;

        let command = connect_with_backoff(&client).await?;
        let publisher = connect_with_backoff(&client).await?;

        let fanout = Arc::new(ChannelFanout::new());
        let subscriber_task = tokio::spawn(run_subscriber(client, fanout.clone()));

        Ok(Self {
            command,
            publisher,
            fanout,
            _subscriber_task: subscriber_task,
        })
    }
}

/// Reconnect with jittered exponential backoff (§4.A), delegating to the
/// generic [`retry_with_backoff`] driver rather than hand-rolling the loop:
/// many `orcd` processes may start against the same Redis instance at once,
/// and jitter spreads out the resulting reconnect attempts.
async fn connect_with_backoff(
    client: &redis::Client,
) -> BrokerResult<redis::aio::ConnectionManager> {
    let config = RetryConfig::capped(RECONNECT_ATTEMPTS, RECONNECT_INITIAL_DELAY, RECONNECT_CAP);
    let mut attempt = 0u32;
    retry_with_backoff(config, || {
        attempt += 1;
        let this_attempt = attempt;
        async move {
            client.get_connection_manager().await.map_err(|e| {
                warn!(attempt = this_attempt, error = %e, "redis connect failed, retrying");
                e
            })
        }
    })
    .await
    .map_err(|e| BrokerError::ConnectFailed(e.to_string()))
}

/// Background task owning the dedicated subscriber connection. Reconnects
/// with capped backoff on any stream error; malformed payloads are logged
/// and dropped, never surfaced to subscribers (§4.A).
async fn run_subscriber(client: redis::Client, fanout: Arc<ChannelFanout>) {
    let mut attempt = 0u32;
    loop {
        match client.get_async_pubsub().await {
            Ok(mut pubsub) => {
                attempt = 0;
                for channel in Channel::ALL {
                    if let Err(e) = pubsub.subscribe(channel.as_str()).await {
                        warn!(channel = channel.as_str(), error = %e, "subscribe failed");
                    }
                }
                let mut stream = pubsub.on_message();
                while let Some(msg) = stream.next().await {
                    let channel_name: String = msg.get_channel_name().to_string();
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(error = %e, "failed to read pub/sub payload");
                            continue;
                        }
                    };
                    match serde_json::from_str::<serde_json::Value>(&payload) {
                        Ok(value) => {
                            if let Some(channel) =
                                Channel::ALL.iter().find(|c| c.as_str() == channel_name)
                            {
                                let _ = fanout.sender(*channel).send(value);
                            }
                        }
                        Err(e) => warn!(channel = %channel_name, error = %e, "dropping malformed pub/sub payload"),
                    }
                }
                warn!("pub/sub stream ended, reconnecting");
            }
            Err(e) => {
                warn!(error = %e, "failed to open pub/sub connection");
            }
        }
        attempt += 1;
        let delay = RECONNECT_CAP.min(Duration::from_millis(50 * 2u64.pow(attempt.min(10))));
        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn set(&self, key: &str, value: &str, opts: SetOptions) -> BrokerResult<()> {
        let full_key = namespaced(opts.prefix, key);
        let mut conn = self.command.clone();
        let result: redis::RedisResult<()> = match opts.ttl {
            Some(ttl) => conn.set_ex(&full_key, value, ttl.as_secs().max(1)).await,
            None => conn.set(&full_key, value).await,
        };
        result.map_err(|e| BrokerError::Transport(e.to_string()))
    }

    async fn get(&self, key: &str, prefix: Option<&str>) -> BrokerResult<Option<String>> {
        let full_key = namespaced(prefix, key);
        let mut conn = self.command.clone();
        conn.get(&full_key)
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }

    async fn del(&self, key: &str, prefix: Option<&str>) -> BrokerResult<()> {
        let full_key = namespaced(prefix, key);
        let mut conn = self.command.clone();
        let _: u64 = conn
            .del(&full_key)
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn exists(&self, key: &str, prefix: Option<&str>) -> BrokerResult<bool> {
        let full_key = namespaced(prefix, key);
        let mut conn = self.command.clone();
        conn.exists(&full_key)
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }

    async fn enqueue(&self, class: &str, msg: AgentMessage) -> BrokerResult<()> {
        let mut conn = self.command.clone();
        let encoded =
            serde_json::to_string(&msg).map_err(|e| BrokerError::Transport(e.to_string()))?;
        if let Some(priority) = msg.priority {
            let _: u64 = conn
                .zadd(priority_key(class), encoded, priority as f64)
                .await
                .map_err(|e| BrokerError::Transport(e.to_string()))?;
        } else {
            let _: u64 = conn
                .rpush(fifo_key(class), encoded)
                .await
                .map_err(|e| BrokerError::Transport(e.to_string()))?;
        }
        Ok(())
    }

    async fn dequeue(
        &self,
        class: &str,
        blocking_timeout: Duration,
    ) -> BrokerResult<Option<AgentMessage>> {
        let mut conn = self.command.clone();

        let popped: Vec<(String, f64)> = conn
            .zpopmax(priority_key(class), 1)
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        if let Some((encoded, _)) = popped.into_iter().next() {
            return Ok(Some(decode(&encoded)?));
        }

        let result: Option<(String, String)> = conn
            .blpop(fifo_key(class), blocking_timeout.as_secs_f64())
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        match result {
            Some((_key, encoded)) => Ok(Some(decode(&encoded)?)),
            None => Ok(None),
        }
    }

    async fn queue_length(&self, class: &str) -> BrokerResult<u64> {
        let mut conn = self.command.clone();
        let fifo_len: u64 = conn
            .llen(fifo_key(class))
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        let priority_len: u64 = conn
            .zcard(priority_key(class))
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        Ok(fifo_len + priority_len)
    }

    async fn move_to_dead_letter(&self, original_class: &str, msg: AgentMessage) -> BrokerResult<()> {
        let envelope = serde_json::json!({
            "message": msg,
            "deadLetterTimestamp": chrono::Utc::now().timestamp_millis(),
            "originalClass": original_class,
        });
        let encoded =
            serde_json::to_string(&envelope).map_err(|e| BrokerError::Transport(e.to_string()))?;
        let mut conn = self.command.clone();
        let _: u64 = conn
            .rpush(deadletter_key(), encoded)
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn publish(&self, channel: Channel, payload: serde_json::Value) -> BrokerResult<()> {
        let encoded =
            serde_json::to_string(&payload).map_err(|e| BrokerError::Transport(e.to_string()))?;
        let mut conn = self.publisher.clone();
        let _: u64 = conn
            .publish(channel.as_str(), encoded)
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        Ok(())
    }

    fn subscribe(&self, channel: Channel) -> broadcast::Receiver<serde_json::Value> {
        self.fanout.sender(channel).subscribe()
    }

    async fn acquire_lock(&self, name: &str, ttl: Duration) -> BrokerResult<bool> {
        let mut conn = self.command.clone();
        let opts = redis::SetOptions::default()
            .conditional_set(redis::ExistenceCheck::NX)
            .with_expiration(redis::SetExpiry::PX(ttl.as_millis() as usize));
        let result: Option<String> = conn
            .set_options(lock_key(name), "1", opts)
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        Ok(result.is_some())
    }

    async fn release_lock(&self, name: &str) -> BrokerResult<()> {
        let mut conn = self.command.clone();
        let _: u64 = conn
            .del(lock_key(name))
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn ping(&self) -> BrokerResult<()> {
        let mut conn = self.command.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        debug!("redis ping ok");
        Ok(())
    }
}

fn decode(encoded: &str) -> BrokerResult<AgentMessage> {
    serde_json::from_str(encoded).map_err(|e| BrokerError::Transport(e.to_string()))
}
