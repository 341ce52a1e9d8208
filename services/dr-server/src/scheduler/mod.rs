//! Fleet scheduling of routing peers and routing instances onto agents.
//!
//! The scheduler is responsible for:
//! - Auto-scheduling unbound work to the agent that asks for a sync
//! - Explicit bind/unbind with conflict detection
//! - Pushing binding changes to the affected agent host
//!
//! Peers may be hosted by any number of agents. An agent hosts at most one
//! routing instance, on both the auto and the explicit path.

mod explicit;
mod policy;
mod resources;
mod sync;

pub use policy::{SchedulerPolicy, DEFAULT_AGENT_DOWN_TIME};

use std::sync::Arc;

use chrono::Utc;
use dynroute_events::AGENT_TYPE_DYNAMIC_ROUTING;
use dynroute_id::AgentId;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::networks::NetworkDirectory;
use crate::notifier::Notifier;
use crate::store::{Agent, Store, StoreError};

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The agent is missing, of the wrong type, or administratively down.
    #[error("agent {0} is not an enabled dynamic routing agent")]
    InvalidAgent(AgentId),

    #[error("agent state reporting is not supported")]
    ReportingUnsupported,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Assigns routing work to agents.
pub struct FleetScheduler {
    store: Arc<dyn Store>,
    notifier: Notifier,
    policy: SchedulerPolicy,
    networks: Arc<dyn NetworkDirectory>,
}

impl FleetScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Notifier,
        policy: SchedulerPolicy,
        networks: Arc<dyn NetworkDirectory>,
    ) -> Self {
        Self {
            store,
            notifier,
            policy,
            networks,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn policy(&self) -> &SchedulerPolicy {
        &self.policy
    }

    /// Whether `agent` counts as alive right now.
    pub fn is_alive(&self, agent: &Agent) -> bool {
        !self.policy.is_agent_down(agent.heartbeat_at, Utc::now())
    }

    /// The enabled, live dynamic routing agent at `host`, if any.
    async fn schedulable_agent(&self, host: &str) -> Result<Option<Agent>, SchedulerError> {
        let Some(agent) = self
            .store
            .find_agent(AGENT_TYPE_DYNAMIC_ROUTING, host)
            .await?
        else {
            debug!(host, "No dynamic routing agent registered for host");
            return Ok(None);
        };

        if !agent.admin_state_up {
            debug!(host, agent_id = %agent.id, "Agent is administratively down");
            return Ok(None);
        }

        if !self.is_alive(&agent) {
            warn!(
                host,
                agent_id = %agent.id,
                heartbeat_at = %agent.heartbeat_at,
                "Agent heartbeat is stale, treating as down"
            );
            return Ok(None);
        }

        Ok(Some(agent))
    }

    /// Bind every peer with no agent to the agent at `host`.
    ///
    /// Returns true iff at least one peer was bound.
    #[instrument(skip(self))]
    pub async fn auto_schedule_routing_peers(&self, host: &str) -> Result<bool, SchedulerError> {
        let Some(agent) = self.schedulable_agent(host).await? else {
            return Ok(false);
        };

        let claimed = self
            .store
            .claim_unbound_peers(agent.id, self.policy.max_peers_per_pass)
            .await?;

        if claimed.is_empty() {
            return Ok(false);
        }

        for peer in &claimed {
            info!(
                peer_id = %peer.id,
                agent_id = %agent.id,
                host,
                "Auto-scheduled routing peer"
            );
        }
        Ok(true)
    }

    /// Bind the first unbound routing instance to the agent at `host`,
    /// unless that agent already hosts one.
    ///
    /// Returns true iff a binding was made.
    #[instrument(skip(self))]
    pub async fn auto_schedule_routing_instances(
        &self,
        host: &str,
    ) -> Result<bool, SchedulerError> {
        let Some(agent) = self.schedulable_agent(host).await? else {
            return Ok(false);
        };

        match self.store.claim_unbound_instance(agent.id).await? {
            Some(instance) => {
                info!(
                    instance_id = %instance.id,
                    agent_id = %agent.id,
                    host,
                    "Auto-scheduled routing instance"
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
