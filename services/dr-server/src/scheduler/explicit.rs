//! Administrative bind and unbind.
//!
//! Bindings are committed before the agent is notified; a lost
//! notification is repaired by the agent's next sync.

use dynroute_events::{AgentNotification, InstanceRef};
use dynroute_id::{AgentId, PeerId, RoutingInstanceId};
use tracing::info;

use super::{FleetScheduler, SchedulerError};
use crate::store::{Agent, RoutingInstance, RoutingPeer, StoreError};

impl FleetScheduler {
    /// The agent, if it may receive new bindings.
    async fn eligible_agent(&self, agent_id: AgentId) -> Result<Agent, SchedulerError> {
        match self.store.get_agent(agent_id).await {
            Ok(agent) if agent.is_dynamic_routing() && agent.admin_state_up => Ok(agent),
            Ok(_) | Err(StoreError::AgentNotFound(_)) => Err(SchedulerError::InvalidAgent(agent_id)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn bind_peer_to_agent(
        &self,
        agent_id: AgentId,
        peer_id: PeerId,
    ) -> Result<RoutingPeer, SchedulerError> {
        let agent = self.eligible_agent(agent_id).await?;
        let peer = self.store.bind_peer(peer_id, agent_id).await?;

        info!(peer_id = %peer_id, agent_id = %agent_id, "Bound routing peer to agent");
        self.notifier
            .notify(&agent.host, AgentNotification::AddRoutingpeer(peer.descriptor()));
        Ok(peer)
    }

    pub async fn unbind_peer_from_agent(
        &self,
        agent_id: AgentId,
        peer_id: PeerId,
    ) -> Result<RoutingPeer, SchedulerError> {
        let agent = self.store.get_agent(agent_id).await?;
        let peer = self.store.unbind_peer(peer_id, agent_id).await?;

        info!(peer_id = %peer_id, agent_id = %agent_id, "Unbound routing peer from agent");
        self.notifier
            .notify(&agent.host, AgentNotification::RemoveRoutingpeer(peer.removal()));
        Ok(peer)
    }

    /// Fails with `AgentHostsInstance` when the agent already hosts a
    /// different instance.
    pub async fn bind_agent_to_instance(
        &self,
        instance_id: RoutingInstanceId,
        agent_id: AgentId,
    ) -> Result<RoutingInstance, SchedulerError> {
        let agent = self.eligible_agent(agent_id).await?;
        let instance = self.store.bind_instance(instance_id, agent_id).await?;

        info!(
            instance_id = %instance_id,
            agent_id = %agent_id,
            "Bound agent to routing instance"
        );
        self.notifier.notify(
            &agent.host,
            AgentNotification::AddRoutinginstance(InstanceRef {
                routing_instance_id: instance_id,
            }),
        );
        Ok(instance)
    }

    pub async fn unbind_agent_from_instance(
        &self,
        instance_id: RoutingInstanceId,
        agent_id: AgentId,
    ) -> Result<RoutingInstance, SchedulerError> {
        let agent = self.store.get_agent(agent_id).await?;
        let instance = self.store.unbind_instance(instance_id, agent_id).await?;

        info!(
            instance_id = %instance_id,
            agent_id = %agent_id,
            "Unbound agent from routing instance"
        );
        self.notifier.notify(
            &agent.host,
            AgentNotification::RemoveRoutinginstance(InstanceRef {
                routing_instance_id: instance_id,
            }),
        );
        Ok(instance)
    }

    pub async fn peers_on_agent(&self, agent_id: AgentId) -> Result<Vec<RoutingPeer>, SchedulerError> {
        Ok(self.store.peers_on_agent(agent_id).await?)
    }

    pub async fn agents_hosting_peer(&self, peer_id: PeerId) -> Result<Vec<Agent>, SchedulerError> {
        Ok(self.store.agents_hosting_peer(peer_id).await?)
    }

    pub async fn agents_on_instance(
        &self,
        instance_id: RoutingInstanceId,
    ) -> Result<Vec<Agent>, SchedulerError> {
        Ok(self.store.agents_on_instance(instance_id).await?)
    }
}
