//! Records pulled by agents and reported back to the authority.

use std::net::IpAddr;

use dynroute_id::{PeerId, TenantId};
use dynroute_networking::{AsNumber, Cidr};
use serde::{Deserialize, Serialize};

/// A peer assigned to an agent, as returned by a peer sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub id: PeerId,
    pub tenant_id: TenantId,
    pub peer_address: IpAddr,
    pub remote_as: AsNumber,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default)]
    pub extra_config: serde_json::Value,
}

/// A prefix the agent should advertise.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NetworkRef {
    pub cidr: Cidr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_hop: Option<IpAddr>,
}

/// Body of the agent's sync calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub host: String,
}

/// Periodic liveness report sent by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStateReport {
    pub agent_type: String,
    pub binary: String,
    pub host: String,
    pub topic: String,
    #[serde(default)]
    pub configurations: serde_json::Value,
    /// Set on the first report after process start only.
    #[serde(default, skip_serializing_if = "is_false")]
    pub start_flag: bool,
}

/// Authority acknowledgement of a state report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportStateAck {
    pub agent_id: dynroute_id::AgentId,
    pub admin_state_up: bool,
}

/// Response to a peer sync request: every peer bound to the requesting host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssignedPeers {
    pub routing_peers: Vec<PeerDescriptor>,
}

/// Response to an advertise-networks sync request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdvertiseNetworks {
    pub networks: Vec<NetworkRef>,
}

/// A best-path change observed by the routing engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BestPathChange {
    pub remote_as: AsNumber,
    pub prefix: Cidr,
    pub next_hop: IpAddr,
    pub is_withdraw: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}
