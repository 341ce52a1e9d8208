use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use crate::db::DbConfig;
use crate::scheduler::SchedulerPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    /// `None` runs the server on the in-memory store.
    pub database: Option<DbConfig>,
    pub policy: SchedulerPolicy,
    pub agent_notify_port: u16,
    pub notify_timeout: Duration,
    pub networks_file: Option<PathBuf>,
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("DR_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:9696".to_string())
            .parse()?;

        let log_level = std::env::var("DR_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = env_flag("DR_DEV", false);

        let database = DbConfig::from_env();

        let agent_down_time = std::env::var("DR_AGENT_DOWN_TIME_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(crate::scheduler::DEFAULT_AGENT_DOWN_TIME);

        let max_peers_per_pass = std::env::var("DR_MAX_PEERS_PER_PASS")
            .ok()
            .and_then(|s| s.parse().ok());

        let policy = SchedulerPolicy {
            agent_down_time,
            auto_schedule: env_flag("DR_AUTO_SCHEDULE", true),
            max_peers_per_pass,
            state_reporting: env_flag("DR_STATE_REPORTING", true),
        };

        let agent_notify_port = std::env::var("DR_AGENT_NOTIFY_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(9697);

        let notify_timeout = std::env::var("DR_NOTIFY_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(5));

        let networks_file = std::env::var("DR_NETWORKS_FILE").ok().map(PathBuf::from);

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            database,
            policy,
            agent_notify_port,
            notify_timeout,
            networks_file,
        })
    }
}
