//! In-memory store.
//!
//! All tables live behind one async mutex, so every store call is a single
//! critical section. Used by tests and when no database is configured.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dynroute_events::AgentStateReport;
use dynroute_id::{AgentId, BindingId, NetworkId, PeerId, RoutingInstanceId};
use dynroute_networking::Cidr;
use dynroute_reconcile::diff_ordered;
use tokio::sync::Mutex;

use super::{
    Agent, NewRoutingInstance, NewRoutingPeer, RoutingInstance, RoutingInstanceUpdate,
    RoutingPeer, RoutingPeerUpdate, Store, StoreError,
};

#[derive(Default)]
struct Tables {
    peers: BTreeMap<PeerId, RoutingPeer>,
    instances: BTreeMap<RoutingInstanceId, RoutingInstance>,
    agents: BTreeMap<AgentId, Agent>,
    instance_networks: BTreeSet<(RoutingInstanceId, NetworkId)>,
    peer_bindings: BTreeMap<(PeerId, AgentId), BindingId>,
    instance_bindings: BTreeMap<(RoutingInstanceId, AgentId), BindingId>,
}

impl Tables {
    fn peer(&self, id: PeerId) -> Result<&RoutingPeer, StoreError> {
        self.peers.get(&id).ok_or(StoreError::PeerNotFound(id))
    }

    fn instance(&self, id: RoutingInstanceId) -> Result<&RoutingInstance, StoreError> {
        self.instances
            .get(&id)
            .ok_or(StoreError::InstanceNotFound(id))
    }

    fn agent(&self, id: AgentId) -> Result<&Agent, StoreError> {
        self.agents.get(&id).ok_or(StoreError::AgentNotFound(id))
    }

    fn agents_for_peer(&self, peer_id: PeerId) -> Vec<Agent> {
        self.peer_bindings
            .keys()
            .filter(|(p, _)| *p == peer_id)
            .filter_map(|(_, a)| self.agents.get(a).cloned())
            .collect()
    }

    fn agents_for_instance(&self, instance_id: RoutingInstanceId) -> Vec<Agent> {
        self.instance_bindings
            .keys()
            .filter(|(i, _)| *i == instance_id)
            .filter_map(|(_, a)| self.agents.get(a).cloned())
            .collect()
    }

    fn instance_hosted_by(&self, agent_id: AgentId) -> Option<RoutingInstanceId> {
        self.instance_bindings
            .keys()
            .find(|(_, a)| *a == agent_id)
            .map(|(i, _)| *i)
    }
}

/// Deduplicate routes while keeping the submitted order.
fn unique_routes(routes: &[Cidr]) -> Vec<Cidr> {
    diff_ordered(&[], routes).to_add
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn create_peer(&self, new: NewRoutingPeer) -> Result<RoutingPeer, StoreError> {
        let mut tables = self.tables.lock().await;

        if tables
            .peers
            .values()
            .any(|p| p.peer_address == new.peer_address)
        {
            return Err(StoreError::PeerAddressInUse(new.peer_address));
        }

        let now = Utc::now();
        let peer = RoutingPeer {
            id: PeerId::new(),
            tenant_id: new.tenant_id,
            peer_address: new.peer_address,
            remote_as: new.remote_as,
            secret: new.secret,
            extra_config: new.extra_config,
            created_at: now,
            updated_at: now,
        };
        tables.peers.insert(peer.id, peer.clone());
        Ok(peer)
    }

    async fn get_peer(&self, id: PeerId) -> Result<RoutingPeer, StoreError> {
        let tables = self.tables.lock().await;
        tables.peer(id).cloned()
    }

    async fn list_peers(&self) -> Result<Vec<RoutingPeer>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.peers.values().cloned().collect())
    }

    async fn update_peer(
        &self,
        id: PeerId,
        update: RoutingPeerUpdate,
    ) -> Result<RoutingPeer, StoreError> {
        let mut tables = self.tables.lock().await;
        let peer = tables
            .peers
            .get_mut(&id)
            .ok_or(StoreError::PeerNotFound(id))?;

        if let Some(remote_as) = update.remote_as {
            peer.remote_as = remote_as;
        }
        if let Some(secret) = update.secret {
            peer.secret = secret;
        }
        if let Some(extra_config) = update.extra_config {
            peer.extra_config = extra_config;
        }
        peer.updated_at = Utc::now();

        Ok(peer.clone())
    }

    async fn delete_peer(&self, id: PeerId) -> Result<(RoutingPeer, Vec<Agent>), StoreError> {
        let mut tables = self.tables.lock().await;
        let hosts = tables.agents_for_peer(id);
        let peer = tables
            .peers
            .remove(&id)
            .ok_or(StoreError::PeerNotFound(id))?;
        tables.peer_bindings.retain(|(p, _), _| *p != id);
        Ok((peer, hosts))
    }

    async fn create_instance(
        &self,
        new: NewRoutingInstance,
    ) -> Result<RoutingInstance, StoreError> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        let instance = RoutingInstance {
            id: RoutingInstanceId::new(),
            tenant_id: new.tenant_id,
            nexthop: new.nexthop,
            advertise: new.advertise,
            discover: new.discover,
            advertise_routes: unique_routes(&new.advertise_routes),
            created_at: now,
            updated_at: now,
        };
        tables.instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn get_instance(&self, id: RoutingInstanceId) -> Result<RoutingInstance, StoreError> {
        let tables = self.tables.lock().await;
        tables.instance(id).cloned()
    }

    async fn list_instances(&self) -> Result<Vec<RoutingInstance>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.instances.values().cloned().collect())
    }

    async fn update_instance(
        &self,
        id: RoutingInstanceId,
        update: RoutingInstanceUpdate,
    ) -> Result<RoutingInstance, StoreError> {
        let mut tables = self.tables.lock().await;
        let instance = tables
            .instances
            .get_mut(&id)
            .ok_or(StoreError::InstanceNotFound(id))?;

        if let Some(nexthop) = update.nexthop {
            instance.nexthop = nexthop;
        }
        if let Some(advertise) = update.advertise {
            instance.advertise = advertise;
        }
        if let Some(discover) = update.discover {
            instance.discover = discover;
        }
        if let Some(routes) = update.advertise_routes {
            let changes = diff_ordered(&instance.advertise_routes, &routes);
            let mut next = changes.unchanged;
            next.extend(changes.to_add);
            instance.advertise_routes = next;
        }
        instance.updated_at = Utc::now();

        Ok(instance.clone())
    }

    async fn delete_instance(
        &self,
        id: RoutingInstanceId,
    ) -> Result<(RoutingInstance, Vec<Agent>), StoreError> {
        let mut tables = self.tables.lock().await;
        let hosts = tables.agents_for_instance(id);
        let instance = tables
            .instances
            .remove(&id)
            .ok_or(StoreError::InstanceNotFound(id))?;
        tables.instance_bindings.retain(|(i, _), _| *i != id);
        tables.instance_networks.retain(|(i, _)| *i != id);
        Ok((instance, hosts))
    }

    async fn add_network(
        &self,
        instance_id: RoutingInstanceId,
        network_id: NetworkId,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.instance(instance_id)?;
        if !tables.instance_networks.insert((instance_id, network_id)) {
            return Err(StoreError::NetworkAlreadyAssociated {
                instance_id,
                network_id,
            });
        }
        Ok(())
    }

    async fn remove_network(
        &self,
        instance_id: RoutingInstanceId,
        network_id: NetworkId,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.instance(instance_id)?;
        if !tables.instance_networks.remove(&(instance_id, network_id)) {
            return Err(StoreError::NetworkNotAssociated {
                instance_id,
                network_id,
            });
        }
        Ok(())
    }

    async fn list_networks(
        &self,
        instance_id: RoutingInstanceId,
    ) -> Result<Vec<NetworkId>, StoreError> {
        let tables = self.tables.lock().await;
        tables.instance(instance_id)?;
        Ok(tables
            .instance_networks
            .iter()
            .filter(|(i, _)| *i == instance_id)
            .map(|(_, n)| *n)
            .collect())
    }

    async fn record_agent_report(
        &self,
        report: &AgentStateReport,
        now: DateTime<Utc>,
    ) -> Result<Agent, StoreError> {
        let mut tables = self.tables.lock().await;

        let existing = tables
            .agents
            .values_mut()
            .find(|a| a.agent_type == report.agent_type && a.host == report.host);

        if let Some(agent) = existing {
            agent.binary = report.binary.clone();
            agent.topic = report.topic.clone();
            agent.configurations = report.configurations.clone();
            agent.heartbeat_at = now;
            if report.start_flag {
                agent.started_at = now;
            }
            return Ok(agent.clone());
        }

        let agent = Agent {
            id: AgentId::new(),
            agent_type: report.agent_type.clone(),
            binary: report.binary.clone(),
            host: report.host.clone(),
            topic: report.topic.clone(),
            admin_state_up: true,
            configurations: report.configurations.clone(),
            heartbeat_at: now,
            started_at: now,
            created_at: now,
        };
        tables.agents.insert(agent.id, agent.clone());
        Ok(agent)
    }

    async fn get_agent(&self, id: AgentId) -> Result<Agent, StoreError> {
        let tables = self.tables.lock().await;
        tables.agent(id).cloned()
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.agents.values().cloned().collect())
    }

    async fn find_agent(&self, agent_type: &str, host: &str) -> Result<Option<Agent>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .agents
            .values()
            .find(|a| a.agent_type == agent_type && a.host == host)
            .cloned())
    }

    async fn set_agent_admin_state(
        &self,
        id: AgentId,
        admin_state_up: bool,
    ) -> Result<Agent, StoreError> {
        let mut tables = self.tables.lock().await;
        let agent = tables
            .agents
            .get_mut(&id)
            .ok_or(StoreError::AgentNotFound(id))?;
        agent.admin_state_up = admin_state_up;
        Ok(agent.clone())
    }

    async fn bind_peer(
        &self,
        peer_id: PeerId,
        agent_id: AgentId,
    ) -> Result<RoutingPeer, StoreError> {
        let mut tables = self.tables.lock().await;
        let peer = tables.peer(peer_id)?.clone();
        tables.agent(agent_id)?;

        if tables.peer_bindings.contains_key(&(peer_id, agent_id)) {
            return Err(StoreError::PeerAlreadyHosted { peer_id, agent_id });
        }
        tables
            .peer_bindings
            .insert((peer_id, agent_id), BindingId::new());
        Ok(peer)
    }

    async fn unbind_peer(
        &self,
        peer_id: PeerId,
        agent_id: AgentId,
    ) -> Result<RoutingPeer, StoreError> {
        let mut tables = self.tables.lock().await;
        let peer = tables.peer(peer_id)?.clone();

        if tables.peer_bindings.remove(&(peer_id, agent_id)).is_none() {
            return Err(StoreError::PeerNotHosted { peer_id, agent_id });
        }
        Ok(peer)
    }

    async fn peers_on_agent(&self, agent_id: AgentId) -> Result<Vec<RoutingPeer>, StoreError> {
        let tables = self.tables.lock().await;
        tables.agent(agent_id)?;
        Ok(tables
            .peer_bindings
            .keys()
            .filter(|(_, a)| *a == agent_id)
            .filter_map(|(p, _)| tables.peers.get(p).cloned())
            .collect())
    }

    async fn agents_hosting_peer(&self, peer_id: PeerId) -> Result<Vec<Agent>, StoreError> {
        let tables = self.tables.lock().await;
        tables.peer(peer_id)?;
        Ok(tables.agents_for_peer(peer_id))
    }

    async fn claim_unbound_peers(
        &self,
        agent_id: AgentId,
        limit: Option<usize>,
    ) -> Result<Vec<RoutingPeer>, StoreError> {
        let mut tables = self.tables.lock().await;
        tables.agent(agent_id)?;

        let bound: BTreeSet<PeerId> = tables.peer_bindings.keys().map(|(p, _)| *p).collect();
        let claimed: Vec<RoutingPeer> = tables
            .peers
            .values()
            .filter(|p| !bound.contains(&p.id))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();

        for peer in &claimed {
            tables
                .peer_bindings
                .insert((peer.id, agent_id), BindingId::new());
        }
        Ok(claimed)
    }

    async fn bind_instance(
        &self,
        instance_id: RoutingInstanceId,
        agent_id: AgentId,
    ) -> Result<RoutingInstance, StoreError> {
        let mut tables = self.tables.lock().await;
        let instance = tables.instance(instance_id)?.clone();
        tables.agent(agent_id)?;

        if tables
            .instance_bindings
            .contains_key(&(instance_id, agent_id))
        {
            return Err(StoreError::InstanceAlreadyHosted {
                instance_id,
                agent_id,
            });
        }
        if let Some(hosted) = tables.instance_hosted_by(agent_id) {
            return Err(StoreError::AgentHostsInstance {
                agent_id,
                instance_id: hosted,
            });
        }

        tables
            .instance_bindings
            .insert((instance_id, agent_id), BindingId::new());
        Ok(instance)
    }

    async fn unbind_instance(
        &self,
        instance_id: RoutingInstanceId,
        agent_id: AgentId,
    ) -> Result<RoutingInstance, StoreError> {
        let mut tables = self.tables.lock().await;
        let instance = tables.instance(instance_id)?.clone();

        if tables
            .instance_bindings
            .remove(&(instance_id, agent_id))
            .is_none()
        {
            return Err(StoreError::InstanceNotHosted {
                instance_id,
                agent_id,
            });
        }
        Ok(instance)
    }

    async fn agents_on_instance(
        &self,
        instance_id: RoutingInstanceId,
    ) -> Result<Vec<Agent>, StoreError> {
        let tables = self.tables.lock().await;
        tables.instance(instance_id)?;
        Ok(tables.agents_for_instance(instance_id))
    }

    async fn instances_on_agent(
        &self,
        agent_id: AgentId,
    ) -> Result<Vec<RoutingInstance>, StoreError> {
        let tables = self.tables.lock().await;
        tables.agent(agent_id)?;
        Ok(tables
            .instance_bindings
            .keys()
            .filter(|(_, a)| *a == agent_id)
            .filter_map(|(i, _)| tables.instances.get(i).cloned())
            .collect())
    }

    async fn claim_unbound_instance(
        &self,
        agent_id: AgentId,
    ) -> Result<Option<RoutingInstance>, StoreError> {
        let mut tables = self.tables.lock().await;
        tables.agent(agent_id)?;

        if tables.instance_hosted_by(agent_id).is_some() {
            return Ok(None);
        }

        let bound: BTreeSet<RoutingInstanceId> =
            tables.instance_bindings.keys().map(|(i, _)| *i).collect();
        let Some(instance) = tables
            .instances
            .values()
            .find(|i| !bound.contains(&i.id))
            .cloned()
        else {
            return Ok(None);
        };

        tables
            .instance_bindings
            .insert((instance.id, agent_id), BindingId::new());
        Ok(Some(instance))
    }
}
