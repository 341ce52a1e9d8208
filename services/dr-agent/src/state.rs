//! Agent-local view of what is active on the routing engine.
//!
//! Volatile by design: nothing here survives a restart, and a fresh state
//! requests a full sync so it is rebuilt from the authority.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;

use dynroute_events::{NetworkRef, PeerDescriptor};
use dynroute_id::PeerId;
use dynroute_networking::AsNumber;
use tokio::sync::Mutex;

/// State shared by the reconciler and the notification handlers.
pub type SharedState = Arc<Mutex<AgentState>>;

/// What the agent needs to keep about an established session. Any field
/// differing from the authority's descriptor means the session is re-added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSession {
    pub address: IpAddr,
    pub remote_as: AsNumber,
    pub secret: Option<String>,
}

impl From<&PeerDescriptor> for PeerSession {
    fn from(peer: &PeerDescriptor) -> Self {
        Self {
            address: peer.peer_address,
            remote_as: peer.remote_as,
            secret: peer.secret.clone(),
        }
    }
}

#[derive(Debug)]
pub struct AgentState {
    full_sync_requested: bool,
    peers: BTreeMap<PeerId, PeerSession>,
    advertise_networks: BTreeSet<NetworkRef>,
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentState {
    /// An empty state with a full sync pending.
    pub fn new() -> Self {
        Self {
            full_sync_requested: true,
            peers: BTreeMap::new(),
            advertise_networks: BTreeSet::new(),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn full_sync_requested(&self) -> bool {
        self.full_sync_requested
    }

    pub fn request_full_sync(&mut self) {
        self.full_sync_requested = true;
    }

    /// Called after a pass in which every operation succeeded.
    pub fn mark_synced(&mut self) {
        self.full_sync_requested = false;
    }

    pub fn peers(&self) -> &BTreeMap<PeerId, PeerSession> {
        &self.peers
    }

    pub fn peer_ids(&self) -> BTreeSet<PeerId> {
        self.peers.keys().copied().collect()
    }

    pub fn peer(&self, id: PeerId) -> Option<&PeerSession> {
        self.peers.get(&id)
    }

    pub fn insert_peer(&mut self, id: PeerId, session: PeerSession) {
        self.peers.insert(id, session);
    }

    pub fn remove_peer(&mut self, id: PeerId) -> Option<PeerSession> {
        self.peers.remove(&id)
    }

    pub fn advertise_networks(&self) -> &BTreeSet<NetworkRef> {
        &self.advertise_networks
    }

    pub fn insert_network(&mut self, network: NetworkRef) {
        self.advertise_networks.insert(network);
    }

    pub fn remove_network(&mut self, network: &NetworkRef) -> bool {
        self.advertise_networks.remove(network)
    }
}
