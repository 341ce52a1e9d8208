//! Network subnet lookup.
//!
//! Networks are owned by another subsystem; routing instances only hold
//! their ids. The scheduler resolves ids to subnets when answering an
//! advertise-networks sync.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use dynroute_id::NetworkId;
use dynroute_networking::Cidr;

/// Resolves a network to the subnets whose routes an instance advertises.
pub trait NetworkDirectory: Send + Sync {
    /// Unknown networks resolve to no subnets.
    fn subnets(&self, network_id: NetworkId) -> Vec<Cidr>;
}

/// A fixed network table, optionally loaded from a JSON file of the form
/// `{"net_...": ["10.0.0.0/24"]}`.
#[derive(Debug, Clone, Default)]
pub struct StaticNetworkDirectory {
    networks: HashMap<NetworkId, Vec<Cidr>>,
}

impl StaticNetworkDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_network(mut self, network_id: NetworkId, subnets: Vec<Cidr>) -> Self {
        self.networks.insert(network_id, subnets);
        self
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read networks file {}", path.display()))?;
        let networks: HashMap<NetworkId, Vec<Cidr>> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid networks file {}", path.display()))?;
        Ok(Self { networks })
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

impl NetworkDirectory for StaticNetworkDirectory {
    fn subnets(&self, network_id: NetworkId) -> Vec<Cidr> {
        self.networks.get(&network_id).cloned().unwrap_or_default()
    }
}
