//! Environment-driven configuration, layered CLI-override > env > default.
//!
//! Grounded on `clawd::config::DaemonConfig::new()`: read each knob from its
//! environment variable, fall back to a built-in default, and let a thin CLI
//! layer override the broker host/port for local runs.

use std::time::Duration;

/// Runtime configuration for the orchestrator. Constructed once at startup.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: Option<String>,
    pub redis_db: i64,

    pub agent_heartbeat_interval: Duration,
    pub agent_timeout: Duration,

    pub default_retry_max: u32,
    pub default_retry_multiplier: f64,
    pub default_retry_initial_delay: Duration,
    pub default_task_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            redis_host: "127.0.0.1".to_string(),
            redis_port: 6379,
            redis_password: None,
            redis_db: 0,
            agent_heartbeat_interval: Duration::from_millis(30_000),
            agent_timeout: Duration::from_millis(90_000),
            default_retry_max: 3,
            default_retry_multiplier: 2.0,
            default_retry_initial_delay: Duration::from_millis(1_000),
            default_task_timeout: Duration::from_millis(300_000),
        }
    }
}

impl OrchestratorConfig {
    /// Build configuration from environment variables, falling back to
    /// [`Default`] for anything unset or unparsable.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            redis_host: std::env::var("ORC_REDIS_HOST").unwrap_or(default.redis_host),
            redis_port: env_parsed("ORC_REDIS_PORT", default.redis_port),
            redis_password: std::env::var("ORC_REDIS_PASSWORD").ok(),
            redis_db: env_parsed("ORC_REDIS_DB", default.redis_db),
            agent_heartbeat_interval: Duration::from_millis(env_parsed(
                "ORC_AGENT_HEARTBEAT_MS",
                default.agent_heartbeat_interval.as_millis() as u64,
            )),
            agent_timeout: Duration::from_millis(env_parsed(
                "ORC_AGENT_TIMEOUT_MS",
                default.agent_timeout.as_millis() as u64,
            )),
            default_retry_max: env_parsed("ORC_DEFAULT_RETRY_MAX", default.default_retry_max),
            default_retry_multiplier: env_parsed(
                "ORC_DEFAULT_RETRY_MULTIPLIER",
                default.default_retry_multiplier,
            ),
            default_retry_initial_delay: Duration::from_millis(env_parsed(
                "ORC_DEFAULT_RETRY_INITIAL_DELAY_MS",
                default.default_retry_initial_delay.as_millis() as u64,
            )),
            default_task_timeout: Duration::from_millis(env_parsed(
                "ORC_DEFAULT_TASK_TIMEOUT_MS",
                default.default_task_timeout.as_millis() as u64,
            )),
        }
    }

    /// Redis connection URL, `redis://[:password@]host:port/db`.
    pub fn redis_url(&self) -> String {
        match &self.redis_password {
            Some(pw) => format!(
                "redis://:{}@{}:{}/{}",
                pw, self.redis_host, self.redis_port, self.redis_db
            ),
            None => format!("redis://{}:{}/{}", self.redis_host, self.redis_port, self.redis_db),
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.agent_heartbeat_interval, Duration::from_secs(30));
        assert_eq!(cfg.agent_timeout, Duration::from_secs(90));
        assert_eq!(cfg.default_retry_max, 3);
        assert_eq!(cfg.default_task_timeout, Duration::from_millis(300_000));
    }

    #[test]
    fn redis_url_without_password() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.redis_url(), "redis://127.0.0.1:6379/0");
    }

    #[test]
    fn redis_url_with_password() {
        let mut cfg = OrchestratorConfig::default();
        cfg.redis_password = Some("secret".to_string());
        assert_eq!(cfg.redis_url(), "redis://:secret@127.0.0.1:6379/0");
    }
}
