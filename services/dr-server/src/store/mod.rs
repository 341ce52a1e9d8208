//! Persistence boundary for routing peers, instances, agents and bindings.
//!
//! Every operation that checks and then writes (binding conflicts, duplicate
//! peer addresses, auto-schedule claims) is atomic within one store call.
//! Callers never compose a check and a write across two calls.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dynroute_events::{
    AgentStateReport, PeerDescriptor, PeerRemoval, AGENT_TYPE_DYNAMIC_ROUTING,
};
use dynroute_id::{AgentId, NetworkId, PeerId, RoutingInstanceId, TenantId};
use dynroute_networking::{AsNumber, Cidr};
use thiserror::Error;

// =============================================================================
// Entities
// =============================================================================

/// A configured BGP neighbor.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingPeer {
    pub id: PeerId,
    pub tenant_id: TenantId,
    pub peer_address: IpAddr,
    pub remote_as: AsNumber,
    pub secret: Option<String>,
    pub extra_config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RoutingPeer {
    /// The record handed to agents in sync responses and add notifications.
    pub fn descriptor(&self) -> PeerDescriptor {
        PeerDescriptor {
            id: self.id,
            tenant_id: self.tenant_id,
            peer_address: self.peer_address,
            remote_as: self.remote_as,
            secret: self.secret.clone(),
            extra_config: self.extra_config.clone(),
        }
    }

    /// The payload of a `remove_routingpeer` notification.
    pub fn removal(&self) -> PeerRemoval {
        PeerRemoval {
            peer_id: self.id,
            peer_address: self.peer_address,
            remote_as: self.remote_as,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewRoutingPeer {
    pub tenant_id: TenantId,
    pub peer_address: IpAddr,
    pub remote_as: AsNumber,
    pub secret: Option<String>,
    pub extra_config: serde_json::Value,
}

/// Mutable peer attributes. The address is the session key and never changes.
#[derive(Debug, Clone, Default)]
pub struct RoutingPeerUpdate {
    pub remote_as: Option<AsNumber>,
    /// `Some(None)` removes the secret.
    pub secret: Option<Option<String>>,
    pub extra_config: Option<serde_json::Value>,
}

/// A routing context advertising routes for a set of networks.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingInstance {
    pub id: RoutingInstanceId,
    pub tenant_id: TenantId,
    pub nexthop: Option<IpAddr>,
    pub advertise: bool,
    pub discover: bool,
    pub advertise_routes: Vec<Cidr>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRoutingInstance {
    pub tenant_id: TenantId,
    pub nexthop: Option<IpAddr>,
    pub advertise: bool,
    pub discover: bool,
    pub advertise_routes: Vec<Cidr>,
}

/// Instance attributes to change. `advertise_routes`, when present, replaces
/// the stored collection.
#[derive(Debug, Clone, Default)]
pub struct RoutingInstanceUpdate {
    /// `Some(None)` removes the nexthop.
    pub nexthop: Option<Option<IpAddr>>,
    pub advertise: Option<bool>,
    pub discover: Option<bool>,
    pub advertise_routes: Option<Vec<Cidr>>,
}

/// A fleet member, created and refreshed by state reports.
#[derive(Debug, Clone, PartialEq)]
pub struct Agent {
    pub id: AgentId,
    pub agent_type: String,
    pub binary: String,
    pub host: String,
    pub topic: String,
    pub admin_state_up: bool,
    pub configurations: serde_json::Value,
    pub heartbeat_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    pub fn is_dynamic_routing(&self) -> bool {
        self.agent_type == AGENT_TYPE_DYNAMIC_ROUTING
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Coarse classification used when mapping store errors to API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    NotFound,
    Conflict,
    Internal,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("routing peer {0} not found")]
    PeerNotFound(PeerId),

    #[error("routing instance {0} not found")]
    InstanceNotFound(RoutingInstanceId),

    #[error("agent {0} not found")]
    AgentNotFound(AgentId),

    #[error("peer address {0} is already in use")]
    PeerAddressInUse(IpAddr),

    #[error("routing peer {peer_id} is already hosted by agent {agent_id}")]
    PeerAlreadyHosted { peer_id: PeerId, agent_id: AgentId },

    #[error("routing peer {peer_id} is not hosted by agent {agent_id}")]
    PeerNotHosted { peer_id: PeerId, agent_id: AgentId },

    #[error("routing instance {instance_id} is already hosted by agent {agent_id}")]
    InstanceAlreadyHosted {
        instance_id: RoutingInstanceId,
        agent_id: AgentId,
    },

    #[error("agent {agent_id} already hosts routing instance {instance_id}")]
    AgentHostsInstance {
        agent_id: AgentId,
        instance_id: RoutingInstanceId,
    },

    #[error("routing instance {instance_id} is not hosted by agent {agent_id}")]
    InstanceNotHosted {
        instance_id: RoutingInstanceId,
        agent_id: AgentId,
    },

    #[error("network {network_id} is already associated with routing instance {instance_id}")]
    NetworkAlreadyAssociated {
        instance_id: RoutingInstanceId,
        network_id: NetworkId,
    },

    #[error("network {network_id} is not associated with routing instance {instance_id}")]
    NetworkNotAssociated {
        instance_id: RoutingInstanceId,
        network_id: NetworkId,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored value failed validation on the way out.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn kind(&self) -> StoreErrorKind {
        match self {
            StoreError::PeerNotFound(_)
            | StoreError::InstanceNotFound(_)
            | StoreError::AgentNotFound(_)
            | StoreError::PeerNotHosted { .. }
            | StoreError::InstanceNotHosted { .. }
            | StoreError::NetworkNotAssociated { .. } => StoreErrorKind::NotFound,
            StoreError::PeerAddressInUse(_)
            | StoreError::PeerAlreadyHosted { .. }
            | StoreError::InstanceAlreadyHosted { .. }
            | StoreError::AgentHostsInstance { .. }
            | StoreError::NetworkAlreadyAssociated { .. } => StoreErrorKind::Conflict,
            StoreError::Database(_) | StoreError::Corrupt(_) => StoreErrorKind::Internal,
        }
    }

    /// Stable machine-readable code for problem documents.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::PeerNotFound(_) => "routing_peer_not_found",
            StoreError::InstanceNotFound(_) => "routing_instance_not_found",
            StoreError::AgentNotFound(_) => "agent_not_found",
            StoreError::PeerAddressInUse(_) => "peer_address_in_use",
            StoreError::PeerAlreadyHosted { .. } => "routing_peer_already_hosted",
            StoreError::PeerNotHosted { .. } => "routing_peer_not_hosted",
            StoreError::InstanceAlreadyHosted { .. } => "routing_instance_already_hosted",
            StoreError::AgentHostsInstance { .. } => "agent_hosts_routing_instance",
            StoreError::InstanceNotHosted { .. } => "routing_instance_not_hosted",
            StoreError::NetworkAlreadyAssociated { .. } => "network_already_associated",
            StoreError::NetworkNotAssociated { .. } => "network_not_associated",
            StoreError::Database(_) | StoreError::Corrupt(_) => "internal_error",
        }
    }
}

// =============================================================================
// Store trait
// =============================================================================

#[async_trait]
pub trait Store: Send + Sync {
    /// Check that the backing storage is reachable.
    async fn ping(&self) -> Result<(), StoreError>;

    // Routing peers

    /// Fails with `PeerAddressInUse` when another peer has the same address.
    async fn create_peer(&self, new: NewRoutingPeer) -> Result<RoutingPeer, StoreError>;
    async fn get_peer(&self, id: PeerId) -> Result<RoutingPeer, StoreError>;
    async fn list_peers(&self) -> Result<Vec<RoutingPeer>, StoreError>;
    async fn update_peer(
        &self,
        id: PeerId,
        update: RoutingPeerUpdate,
    ) -> Result<RoutingPeer, StoreError>;

    /// Delete a peer and all of its bindings. Returns the agents that were
    /// hosting it.
    async fn delete_peer(&self, id: PeerId) -> Result<(RoutingPeer, Vec<Agent>), StoreError>;

    // Routing instances

    async fn create_instance(
        &self,
        new: NewRoutingInstance,
    ) -> Result<RoutingInstance, StoreError>;
    async fn get_instance(&self, id: RoutingInstanceId) -> Result<RoutingInstance, StoreError>;
    async fn list_instances(&self) -> Result<Vec<RoutingInstance>, StoreError>;

    /// Replacing `advertise_routes` inserts added routes, deletes removed
    /// ones and leaves unchanged ones in place.
    async fn update_instance(
        &self,
        id: RoutingInstanceId,
        update: RoutingInstanceUpdate,
    ) -> Result<RoutingInstance, StoreError>;

    /// Delete an instance with its network, route and agent bindings.
    /// Returns the agents that were hosting it.
    async fn delete_instance(
        &self,
        id: RoutingInstanceId,
    ) -> Result<(RoutingInstance, Vec<Agent>), StoreError>;

    async fn add_network(
        &self,
        instance_id: RoutingInstanceId,
        network_id: NetworkId,
    ) -> Result<(), StoreError>;
    async fn remove_network(
        &self,
        instance_id: RoutingInstanceId,
        network_id: NetworkId,
    ) -> Result<(), StoreError>;
    async fn list_networks(
        &self,
        instance_id: RoutingInstanceId,
    ) -> Result<Vec<NetworkId>, StoreError>;

    // Agents

    /// Insert or refresh the agent keyed by `(agent_type, host)`, setting
    /// its heartbeat to `now`. New agents start admin-enabled.
    async fn record_agent_report(
        &self,
        report: &AgentStateReport,
        now: DateTime<Utc>,
    ) -> Result<Agent, StoreError>;
    async fn get_agent(&self, id: AgentId) -> Result<Agent, StoreError>;
    async fn list_agents(&self) -> Result<Vec<Agent>, StoreError>;
    async fn find_agent(&self, agent_type: &str, host: &str) -> Result<Option<Agent>, StoreError>;
    async fn set_agent_admin_state(
        &self,
        id: AgentId,
        admin_state_up: bool,
    ) -> Result<Agent, StoreError>;

    // Peer bindings

    /// Fails with `PeerAlreadyHosted` if the pair is already bound.
    async fn bind_peer(&self, peer_id: PeerId, agent_id: AgentId)
        -> Result<RoutingPeer, StoreError>;

    /// Fails with `PeerNotHosted` if the pair is not bound.
    async fn unbind_peer(
        &self,
        peer_id: PeerId,
        agent_id: AgentId,
    ) -> Result<RoutingPeer, StoreError>;
    async fn peers_on_agent(&self, agent_id: AgentId) -> Result<Vec<RoutingPeer>, StoreError>;
    async fn agents_hosting_peer(&self, peer_id: PeerId) -> Result<Vec<Agent>, StoreError>;

    /// Bind peers that have no binding to any agent, in id order, up to
    /// `limit`. Concurrent claims never bind the same peer twice.
    async fn claim_unbound_peers(
        &self,
        agent_id: AgentId,
        limit: Option<usize>,
    ) -> Result<Vec<RoutingPeer>, StoreError>;

    // Instance bindings

    /// Fails with `InstanceAlreadyHosted` if the pair is bound, or
    /// `AgentHostsInstance` if the agent already hosts another instance.
    async fn bind_instance(
        &self,
        instance_id: RoutingInstanceId,
        agent_id: AgentId,
    ) -> Result<RoutingInstance, StoreError>;
    async fn unbind_instance(
        &self,
        instance_id: RoutingInstanceId,
        agent_id: AgentId,
    ) -> Result<RoutingInstance, StoreError>;
    async fn agents_on_instance(
        &self,
        instance_id: RoutingInstanceId,
    ) -> Result<Vec<Agent>, StoreError>;
    async fn instances_on_agent(
        &self,
        agent_id: AgentId,
    ) -> Result<Vec<RoutingInstance>, StoreError>;

    /// Bind the first instance with no bindings to the agent, unless the
    /// agent already hosts one. Returns the bound instance, if any.
    async fn claim_unbound_instance(
        &self,
        agent_id: AgentId,
    ) -> Result<Option<RoutingInstance>, StoreError>;
}
