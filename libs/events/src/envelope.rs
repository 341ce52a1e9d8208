//! Notification envelope pushed from the authority to a single agent host.

use dynroute_id::{PeerId, RoutingInstanceId};
use dynroute_networking::AsNumber;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::PeerDescriptor;

/// A `{method, payload}` message addressed to one agent host.
///
/// Delivery is at-most-once; the agent's periodic sync covers anything lost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "payload", rename_all = "snake_case")]
pub enum AgentNotification {
    /// A peer was bound to the agent.
    AddRoutingpeer(PeerDescriptor),

    /// A peer was unbound from the agent (or deleted).
    RemoveRoutingpeer(PeerRemoval),

    /// A routing instance was bound to the agent.
    AddRoutinginstance(InstanceRef),

    /// A routing instance was unbound from the agent.
    RemoveRoutinginstance(InstanceRef),
}

impl AgentNotification {
    /// The wire method name.
    pub fn method(&self) -> &'static str {
        match self {
            AgentNotification::AddRoutingpeer(_) => "add_routingpeer",
            AgentNotification::RemoveRoutingpeer(_) => "remove_routingpeer",
            AgentNotification::AddRoutinginstance(_) => "add_routinginstance",
            AgentNotification::RemoveRoutinginstance(_) => "remove_routinginstance",
        }
    }
}

/// Payload of `remove_routingpeer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRemoval {
    pub peer_id: PeerId,
    pub peer_address: IpAddr,
    pub remote_as: AsNumber,
}

/// Payload of the routing instance notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRef {
    pub routing_instance_id: RoutingInstanceId,
}
