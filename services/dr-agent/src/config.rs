//! Configuration for the dynamic routing agent.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use dynroute_events::{AgentStateReport, AGENT_BINARY, AGENT_TYPE_DYNAMIC_ROUTING, DR_AGENT_TOPIC};
use dynroute_networking::AsNumber;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host name this agent reports and syncs as.
    pub host: String,

    /// Authority API base URL.
    pub authority_url: String,

    /// Address the notification listener binds to.
    pub notify_listen_addr: SocketAddr,

    /// Local AS number handed to the routing engine.
    pub local_as: AsNumber,

    /// BGP router id handed to the routing engine.
    pub router_id: IpAddr,

    /// Interval between reconciliation ticks.
    pub sync_interval: Duration,

    /// Interval after which a full sync is forced. Zero disables.
    pub resync_interval: Duration,

    /// Interval between state reports. Zero disables reporting.
    pub report_interval: Duration,

    /// Bound on every authority request.
    pub authority_timeout: Duration,

    /// Bound on every routing engine call.
    pub driver_timeout: Duration,

    /// How long shutdown waits for each task.
    pub shutdown_grace: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let host = resolve_host(
            std::env::var("DR_HOST").ok(),
            std::env::var("HOSTNAME").ok(),
        );

        let authority_url = std::env::var("DR_AUTHORITY_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:9696".to_string());

        let notify_listen_addr = std::env::var("DR_NOTIFY_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:9697".to_string())
            .parse()
            .context("DR_NOTIFY_LISTEN_ADDR must be a socket address")?;

        let local_as = match std::env::var("DR_LOCAL_AS") {
            Ok(raw) => {
                let value: u32 = raw.parse().context("DR_LOCAL_AS must be an integer")?;
                AsNumber::new(value).context("DR_LOCAL_AS is not a valid AS number")?
            }
            Err(_) => AsNumber::new(12345)?,
        };

        let router_id = std::env::var("DR_ROUTER_ID")
            .unwrap_or_else(|_| "127.0.0.1".to_string())
            .parse()
            .context("DR_ROUTER_ID must be an IP address")?;

        let log_level = std::env::var("DR_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            host,
            authority_url,
            notify_listen_addr,
            local_as,
            router_id,
            sync_interval: env_secs("DR_SYNC_INTERVAL_SECS", 10)?,
            resync_interval: env_secs("DR_RESYNC_INTERVAL_SECS", 300)?,
            report_interval: env_secs("DR_REPORT_INTERVAL_SECS", 30)?,
            authority_timeout: env_secs("DR_AUTHORITY_TIMEOUT_SECS", 10)?,
            driver_timeout: env_secs("DR_DRIVER_TIMEOUT_SECS", 5)?,
            shutdown_grace: env_secs("DR_SHUTDOWN_GRACE_SECS", 5)?,
            log_level,
        })
    }

    /// The report sent on the first heartbeat after start.
    pub fn state_report(&self) -> AgentStateReport {
        AgentStateReport {
            agent_type: AGENT_TYPE_DYNAMIC_ROUTING.to_string(),
            binary: AGENT_BINARY.to_string(),
            host: self.host.clone(),
            topic: DR_AGENT_TOPIC.to_string(),
            configurations: serde_json::json!({
                "local_as": self.local_as.value(),
                "router_id": self.router_id.to_string(),
                "notify_port": self.notify_listen_addr.port(),
            }),
            start_flag: true,
        }
    }
}

fn env_secs(name: &str, default: u64) -> Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => {
            let secs: u64 = raw
                .parse()
                .with_context(|| format!("{name} must be a whole number of seconds"))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

/// `DR_HOST`, else `HOSTNAME`, else `localhost`. Blank values are skipped.
fn resolve_host(dr_host: Option<String>, hostname: Option<String>) -> String {
    dr_host
        .into_iter()
        .chain(hostname)
        .map(|h| h.trim().to_string())
        .find(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
