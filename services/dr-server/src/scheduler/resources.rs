//! Peer and instance lifecycle operations that affect hosting agents.

use dynroute_events::{AgentNotification, InstanceRef};
use dynroute_id::{NetworkId, PeerId, RoutingInstanceId};
use tracing::info;

use super::{FleetScheduler, SchedulerError};
use crate::store::{
    NewRoutingInstance, NewRoutingPeer, RoutingInstance, RoutingInstanceUpdate, RoutingPeer,
    RoutingPeerUpdate,
};

impl FleetScheduler {
    pub async fn create_peer(&self, new: NewRoutingPeer) -> Result<RoutingPeer, SchedulerError> {
        let peer = self.store.create_peer(new).await?;
        info!(peer_id = %peer.id, peer_address = %peer.peer_address, "Created routing peer");
        Ok(peer)
    }

    /// Hosting agents get a remove followed by an add so the session is
    /// rebuilt with the new AS number or secret.
    pub async fn update_peer(
        &self,
        peer_id: PeerId,
        update: RoutingPeerUpdate,
    ) -> Result<RoutingPeer, SchedulerError> {
        let previous = self.store.get_peer(peer_id).await?;
        let peer = self.store.update_peer(peer_id, update).await?;
        let hosts = self.store.agents_hosting_peer(peer_id).await?;

        for agent in &hosts {
            self.notifier.notify(
                &agent.host,
                AgentNotification::RemoveRoutingpeer(previous.removal()),
            );
            self.notifier
                .notify(&agent.host, AgentNotification::AddRoutingpeer(peer.descriptor()));
        }

        info!(peer_id = %peer_id, hosts = hosts.len(), "Updated routing peer");
        Ok(peer)
    }

    pub async fn delete_peer(&self, peer_id: PeerId) -> Result<RoutingPeer, SchedulerError> {
        let (peer, hosts) = self.store.delete_peer(peer_id).await?;

        for agent in &hosts {
            self.notifier
                .notify(&agent.host, AgentNotification::RemoveRoutingpeer(peer.removal()));
        }

        info!(peer_id = %peer_id, hosts = hosts.len(), "Deleted routing peer");
        Ok(peer)
    }

    pub async fn create_instance(
        &self,
        new: NewRoutingInstance,
    ) -> Result<RoutingInstance, SchedulerError> {
        let instance = self.store.create_instance(new).await?;
        info!(instance_id = %instance.id, "Created routing instance");
        Ok(instance)
    }

    pub async fn update_instance(
        &self,
        instance_id: RoutingInstanceId,
        update: RoutingInstanceUpdate,
    ) -> Result<RoutingInstance, SchedulerError> {
        let instance = self.store.update_instance(instance_id, update).await?;
        self.notify_instance_changed(instance_id).await?;
        info!(instance_id = %instance_id, "Updated routing instance");
        Ok(instance)
    }

    pub async fn delete_instance(
        &self,
        instance_id: RoutingInstanceId,
    ) -> Result<RoutingInstance, SchedulerError> {
        let (instance, hosts) = self.store.delete_instance(instance_id).await?;

        for agent in &hosts {
            self.notifier.notify(
                &agent.host,
                AgentNotification::RemoveRoutinginstance(InstanceRef {
                    routing_instance_id: instance_id,
                }),
            );
        }

        info!(instance_id = %instance_id, hosts = hosts.len(), "Deleted routing instance");
        Ok(instance)
    }

    pub async fn add_network(
        &self,
        instance_id: RoutingInstanceId,
        network_id: NetworkId,
    ) -> Result<(), SchedulerError> {
        self.store.add_network(instance_id, network_id).await?;
        self.notify_instance_changed(instance_id).await?;
        info!(instance_id = %instance_id, network_id = %network_id, "Associated network");
        Ok(())
    }

    pub async fn remove_network(
        &self,
        instance_id: RoutingInstanceId,
        network_id: NetworkId,
    ) -> Result<(), SchedulerError> {
        self.store.remove_network(instance_id, network_id).await?;
        self.notify_instance_changed(instance_id).await?;
        info!(instance_id = %instance_id, network_id = %network_id, "Disassociated network");
        Ok(())
    }

    pub async fn list_networks(
        &self,
        instance_id: RoutingInstanceId,
    ) -> Result<Vec<NetworkId>, SchedulerError> {
        Ok(self.store.list_networks(instance_id).await?)
    }

    /// Ask hosting agents to re-pull their advertise networks.
    async fn notify_instance_changed(
        &self,
        instance_id: RoutingInstanceId,
    ) -> Result<(), SchedulerError> {
        for agent in self.store.agents_on_instance(instance_id).await? {
            self.notifier.notify(
                &agent.host,
                AgentNotification::AddRoutinginstance(InstanceRef {
                    routing_instance_id: instance_id,
                }),
            );
        }
        Ok(())
    }
}
