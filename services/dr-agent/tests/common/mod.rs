//! Shared fixtures for agent integration tests.

#![allow(dead_code)]

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dynroute_agent::{
    driver::{best_path_channel, MockDriver},
    AgentState, Authority, ClientError, PeerSession, ReconcilerConfig, SyncReconciler,
};
use dynroute_events::{AgentStateReport, NetworkRef, PeerDescriptor, ReportStateAck};
use dynroute_id::{AgentId, PeerId, TenantId};
use dynroute_networking::AsNumber;
use reqwest::StatusCode;

/// How the stub answers state reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportMode {
    Accept,
    Unsupported,
    Fail,
}

/// In-process authority with scripted answers.
pub struct StubAuthority {
    peers: Mutex<Vec<PeerDescriptor>>,
    networks: Mutex<Vec<NetworkRef>>,
    reachable: AtomicBool,
    delay: Mutex<Option<Duration>>,
    report_mode: Mutex<ReportMode>,
    reports: Mutex<Vec<AgentStateReport>>,
    pulls: AtomicUsize,
    agent_id: AgentId,
}

impl Default for StubAuthority {
    fn default() -> Self {
        Self {
            peers: Mutex::new(Vec::new()),
            networks: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
            delay: Mutex::new(None),
            report_mode: Mutex::new(ReportMode::Accept),
            reports: Mutex::new(Vec::new()),
            pulls: AtomicUsize::new(0),
            agent_id: AgentId::new(),
        }
    }
}

impl StubAuthority {
    pub fn set_peers(&self, peers: Vec<PeerDescriptor>) {
        *self.peers.lock().unwrap() = peers;
    }

    pub fn set_networks(&self, networks: Vec<NetworkRef>) {
        *self.networks.lock().unwrap() = networks;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn set_report_mode(&self, mode: ReportMode) {
        *self.report_mode.lock().unwrap() = mode;
    }

    pub fn reports(&self) -> Vec<AgentStateReport> {
        self.reports.lock().unwrap().clone()
    }

    /// Number of sync pulls served (peers and networks counted separately).
    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    async fn answer<T: Clone>(&self, value: &Mutex<T>) -> Result<T, ClientError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        Ok(value.lock().unwrap().clone())
    }
}

fn unavailable() -> ClientError {
    ClientError::Status {
        status: StatusCode::SERVICE_UNAVAILABLE,
        body: "authority unavailable".to_string(),
    }
}

#[async_trait]
impl Authority for StubAuthority {
    async fn get_assigned_peers(&self) -> Result<Vec<PeerDescriptor>, ClientError> {
        self.answer(&self.peers).await
    }

    async fn get_advertise_networks(&self) -> Result<Vec<NetworkRef>, ClientError> {
        self.answer(&self.networks).await
    }

    async fn report_state(
        &self,
        report: &AgentStateReport,
    ) -> Result<ReportStateAck, ClientError> {
        let mode = *self.report_mode.lock().unwrap();
        match mode {
            ReportMode::Accept => {
                self.reports.lock().unwrap().push(report.clone());
                Ok(ReportStateAck {
                    agent_id: self.agent_id,
                    admin_state_up: true,
                })
            }
            ReportMode::Unsupported => Err(ClientError::Unsupported("state reporting")),
            ReportMode::Fail => Err(unavailable()),
        }
    }
}

/// A reconciler wired to a stub authority and a mock engine.
pub struct TestAgent {
    pub authority: Arc<StubAuthority>,
    pub driver: Arc<MockDriver>,
    pub reconciler: SyncReconciler,
}

impl TestAgent {
    pub fn new() -> Self {
        Self::with_config(ReconcilerConfig::default())
    }

    pub fn with_config(config: ReconcilerConfig) -> Self {
        let authority = Arc::new(StubAuthority::default());
        let (tx, _rx) = best_path_channel();
        let driver = Arc::new(MockDriver::new(
            AsNumber::new(12345).unwrap(),
            "127.0.0.1".parse().unwrap(),
            tx,
        ));
        let reconciler = SyncReconciler::new(
            authority.clone(),
            driver.clone(),
            AgentState::shared(),
            config,
        );
        Self {
            authority,
            driver,
            reconciler,
        }
    }

    /// Mark `peer` active both locally and on the engine.
    pub async fn preload(&self, peer: &PeerDescriptor) {
        use dynroute_agent::RoutingEngineDriver;
        self.driver
            .add_peer(peer.peer_address, peer.remote_as, None)
            .await
            .unwrap();
        self.reconciler
            .state()
            .lock()
            .await
            .insert_peer(peer.id, PeerSession::from(peer));
    }

    pub async fn peer_ids(&self) -> Vec<PeerId> {
        self.reconciler.state().lock().await.peer_ids().into_iter().collect()
    }

    pub async fn full_sync_requested(&self) -> bool {
        self.reconciler.state().lock().await.full_sync_requested()
    }
}

pub fn peer(n: u8) -> PeerDescriptor {
    PeerDescriptor {
        id: PeerId::new(),
        tenant_id: TenantId::new(),
        peer_address: address(n),
        remote_as: AsNumber::new(65000 + u32::from(n)).unwrap(),
        secret: None,
        extra_config: serde_json::json!({}),
    }
}

pub fn address(n: u8) -> IpAddr {
    IpAddr::from([192, 0, 2, n])
}

pub fn network(cidr: &str, next_hop: Option<&str>) -> NetworkRef {
    NetworkRef {
        cidr: cidr.parse().unwrap(),
        next_hop: next_hop.map(|h| h.parse().unwrap()),
    }
}
