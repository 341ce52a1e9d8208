//! Reconciliation loop for converging routing engine state.
//!
//! The reconciler:
//! - Pulls assigned peers and advertise networks from the authority
//! - Adds what is missing and removes what is extra through the driver
//! - Applies pushed notifications between ticks
//!
//! A tick only does work while a full sync is requested. A pass in which
//! every pull and driver call succeeded clears the request; anything else
//! leaves it set, so the next tick is the retry.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use dynroute_events::{AgentNotification, NetworkRef, PeerDescriptor, PeerRemoval};
use dynroute_id::PeerId;
use dynroute_networking::Cidr;
use dynroute_reconcile::{diff, ConvergenceStatus};
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::{Authority, ClientError};
use crate::config::Config;
use crate::driver::{DriverError, RoutingEngineDriver};
use crate::state::{AgentState, PeerSession, SharedState};

/// Shortest sync period the loop will run with.
const MIN_SYNC_INTERVAL: Duration = Duration::from_millis(10);

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval between ticks.
    pub sync_interval: Duration,

    /// Interval after which a full sync is forced. Zero disables.
    pub resync_interval: Duration,

    /// Bound on each authority pull.
    pub authority_timeout: Duration,

    /// Bound on each driver call.
    pub driver_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(10),
            resync_interval: Duration::from_secs(300),
            authority_timeout: Duration::from_secs(10),
            driver_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&Config> for ReconcilerConfig {
    fn from(config: &Config) -> Self {
        Self {
            sync_interval: config.sync_interval,
            resync_interval: config.resync_interval,
            authority_timeout: config.authority_timeout,
            driver_timeout: config.driver_timeout,
        }
    }
}

/// Outcome of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// No full sync was requested, nothing was pulled.
    pub skipped: bool,
    pub peers_added: usize,
    pub peers_removed: usize,
    pub routes_advertised: usize,
    pub routes_withdrawn: usize,
    /// Failed pulls plus failed driver calls.
    pub failures: usize,
    pub status: ConvergenceStatus,
}

impl ReconcileReport {
    fn new(skipped: bool) -> Self {
        Self {
            skipped,
            peers_added: 0,
            peers_removed: 0,
            routes_advertised: 0,
            routes_withdrawn: 0,
            failures: 0,
            status: ConvergenceStatus::Converged,
        }
    }

    fn changes(&self) -> usize {
        self.peers_added + self.peers_removed + self.routes_advertised + self.routes_withdrawn
    }
}

/// Converges the routing engine toward the authority's assignment.
pub struct SyncReconciler {
    authority: Arc<dyn Authority>,
    driver: Arc<dyn RoutingEngineDriver>,
    state: SharedState,
    config: ReconcilerConfig,
}

impl SyncReconciler {
    pub fn new(
        authority: Arc<dyn Authority>,
        driver: Arc<dyn RoutingEngineDriver>,
        state: SharedState,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            authority,
            driver,
            state,
            config,
        }
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Run ticks until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            sync_interval_secs = self.config.sync_interval.as_secs(),
            resync_interval_secs = self.config.resync_interval.as_secs(),
            "Starting reconciliation loop"
        );

        let mut sync_timer = tokio::time::interval(self.config.sync_interval.max(MIN_SYNC_INTERVAL));
        sync_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut resync_timer = (!self.config.resync_interval.is_zero()).then(|| {
            let period = self.config.resync_interval;
            tokio::time::interval_at(Instant::now() + period, period)
        });

        loop {
            tokio::select! {
                _ = sync_timer.tick() => {
                    self.tick().await;
                }
                _ = next_tick(&mut resync_timer) => {
                    debug!("Resync interval elapsed, requesting full sync");
                    self.request_full_sync().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub async fn request_full_sync(&self) {
        self.state.lock().await.request_full_sync();
    }

    /// Perform a single reconciliation pass.
    pub async fn tick(&self) -> ReconcileReport {
        let mut state = self.state.lock().await;
        if !state.full_sync_requested() {
            debug!("No full sync requested, skipping tick");
            return ReconcileReport::new(true);
        }

        debug!("Starting full sync");
        let mut report = ReconcileReport::new(false);
        let mut pulled_everything = true;

        match self.pull("routing peers", self.authority.get_assigned_peers()).await {
            Some(peers) => self.converge_peers(&mut state, peers, &mut report).await,
            None => pulled_everything = false,
        }
        match self
            .pull("advertise networks", self.authority.get_advertise_networks())
            .await
        {
            Some(networks) => {
                self.converge_networks(&mut state, networks, &mut report)
                    .await
            }
            None => pulled_everything = false,
        }

        if !pulled_everything {
            report.failures += 1;
            report.status = ConvergenceStatus::Unknown;
        } else if report.failures > 0 {
            report.status = ConvergenceStatus::Converging;
        } else {
            state.mark_synced();
        }

        if report.failures > 0 {
            warn!(
                failures = report.failures,
                status = ?report.status,
                peers = state.peers().len(),
                "Full sync incomplete, will retry next tick"
            );
        } else if report.changes() > 0 {
            info!(
                peers_added = report.peers_added,
                peers_removed = report.peers_removed,
                routes_advertised = report.routes_advertised,
                routes_withdrawn = report.routes_withdrawn,
                "Full sync converged"
            );
        } else {
            debug!(peers = state.peers().len(), "Full sync found nothing to change");
        }

        report
    }

    async fn pull<T, F>(&self, what: &'static str, request: F) -> Option<T>
    where
        F: Future<Output = Result<T, ClientError>>,
    {
        match tokio::time::timeout(self.config.authority_timeout, request).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                warn!(error = %e, what, "Failed to pull from authority");
                None
            }
            Err(_) => {
                warn!(
                    what,
                    timeout_secs = self.config.authority_timeout.as_secs(),
                    "Authority pull timed out"
                );
                None
            }
        }
    }

    async fn driver_call<F>(&self, call: F) -> Result<(), DriverError>
    where
        F: Future<Output = Result<(), DriverError>>,
    {
        tokio::time::timeout(self.config.driver_timeout, call)
            .await
            .unwrap_or(Err(DriverError::Timeout(self.config.driver_timeout)))
    }

    async fn converge_peers(
        &self,
        state: &mut AgentState,
        peers: Vec<PeerDescriptor>,
        report: &mut ReconcileReport,
    ) {
        let desired: BTreeMap<PeerId, PeerDescriptor> =
            peers.into_iter().map(|p| (p.id, p)).collect();
        let wanted: BTreeSet<PeerId> = desired.keys().copied().collect();
        let changes = diff(&state.peer_ids(), &wanted);

        // Same id, different address, AS or secret: tear down and re-add.
        let modified: Vec<PeerId> = changes
            .unchanged
            .iter()
            .copied()
            .filter(|id| match (state.peer(*id), desired.get(id)) {
                (Some(session), Some(peer)) => *session != PeerSession::from(peer),
                _ => false,
            })
            .collect();

        let mut busy_addresses = BTreeSet::new();
        for id in changes.to_remove.iter().chain(&modified) {
            match self.remove_session(state, *id).await {
                Ok(()) => report.peers_removed += 1,
                Err(address) => {
                    report.failures += 1;
                    busy_addresses.insert(address);
                }
            }
        }

        for id in changes.to_add.iter().chain(&modified) {
            let Some(peer) = desired.get(id) else {
                continue;
            };
            if state.peer(*id).is_some() {
                // Removal above failed; the old session is still up.
                continue;
            }
            if busy_addresses.contains(&peer.peer_address) {
                debug!(peer_id = %id, "Address still held by a session that failed to close");
                report.failures += 1;
                continue;
            }
            if self.add_session(state, peer).await {
                report.peers_added += 1;
            } else {
                report.failures += 1;
            }
        }
    }

    async fn converge_networks(
        &self,
        state: &mut AgentState,
        networks: Vec<NetworkRef>,
        report: &mut ReconcileReport,
    ) {
        let desired: BTreeSet<NetworkRef> = networks.into_iter().collect();
        let changes = diff(state.advertise_networks(), &desired);

        let mut busy_prefixes: BTreeSet<Cidr> = BTreeSet::new();
        for network in &changes.to_remove {
            match self.driver_call(self.driver.withdraw_route(network.cidr)).await {
                Ok(()) | Err(DriverError::NotFound(_)) => {
                    state.remove_network(network);
                    report.routes_withdrawn += 1;
                }
                Err(e) => {
                    warn!(prefix = %network.cidr, error = %e, "Failed to withdraw route");
                    busy_prefixes.insert(network.cidr);
                    report.failures += 1;
                }
            }
        }

        for network in &changes.to_add {
            if busy_prefixes.contains(&network.cidr) {
                report.failures += 1;
                continue;
            }
            match self
                .driver_call(self.driver.advertise_route(network.cidr, network.next_hop))
                .await
            {
                Ok(()) | Err(DriverError::AlreadyExists(_)) => {
                    state.insert_network(network.clone());
                    report.routes_advertised += 1;
                }
                Err(e) => {
                    warn!(prefix = %network.cidr, error = %e, "Failed to advertise route");
                    report.failures += 1;
                }
            }
        }
    }

    /// Tear down the session for `id`. On failure returns the address that
    /// is still in use.
    async fn remove_session(&self, state: &mut AgentState, id: PeerId) -> Result<(), IpAddr> {
        let Some(session) = state.peer(id).cloned() else {
            return Ok(());
        };

        match self.driver_call(self.driver.remove_peer(session.address)).await {
            Ok(()) | Err(DriverError::NotFound(_)) => {
                state.remove_peer(id);
                info!(peer_id = %id, address = %session.address, "Removed peer session");
                Ok(())
            }
            Err(e) => {
                warn!(
                    peer_id = %id,
                    address = %session.address,
                    error = %e,
                    "Failed to remove peer session"
                );
                Err(session.address)
            }
        }
    }

    async fn add_session(&self, state: &mut AgentState, peer: &PeerDescriptor) -> bool {
        let call = self
            .driver
            .add_peer(peer.peer_address, peer.remote_as, peer.secret.as_deref());

        match self.driver_call(call).await {
            Ok(()) | Err(DriverError::AlreadyExists(_)) => {
                state.insert_peer(peer.id, PeerSession::from(peer));
                info!(
                    peer_id = %peer.id,
                    address = %peer.peer_address,
                    remote_as = %peer.remote_as,
                    "Added peer session"
                );
                true
            }
            Err(e) => {
                warn!(
                    peer_id = %peer.id,
                    address = %peer.peer_address,
                    error = %e,
                    "Failed to add peer session"
                );
                false
            }
        }
    }

    // =========================================================================
    // Pushed notifications
    // =========================================================================

    /// Apply a notification pushed by the authority.
    pub async fn handle(&self, notification: AgentNotification) {
        match notification {
            AgentNotification::AddRoutingpeer(peer) => self.on_peer_added(&peer).await,
            AgentNotification::RemoveRoutingpeer(removal) => self.on_peer_removed(&removal).await,
            AgentNotification::AddRoutinginstance(instance)
            | AgentNotification::RemoveRoutinginstance(instance) => {
                debug!(
                    routing_instance_id = %instance.routing_instance_id,
                    "Routing instance binding changed, requesting full sync"
                );
                self.request_full_sync().await;
            }
        }
    }

    /// Establish a newly bound peer without waiting for the next tick.
    /// Failures are left to the next full sync.
    pub async fn on_peer_added(&self, peer: &PeerDescriptor) {
        let mut state = self.state.lock().await;

        let active = state.peer(peer.id).cloned();
        match active {
            Some(session) if session == PeerSession::from(peer) => {
                debug!(peer_id = %peer.id, "Peer already active");
                return;
            }
            Some(_) => {
                if self.remove_session(&mut state, peer.id).await.is_err() {
                    state.request_full_sync();
                    return;
                }
            }
            None => {}
        }

        if !self.add_session(&mut state, peer).await {
            state.request_full_sync();
        }
    }

    /// Tear down an unbound peer without waiting for the next tick.
    /// Failures are left to the next full sync.
    pub async fn on_peer_removed(&self, removal: &PeerRemoval) {
        let mut state = self.state.lock().await;

        if state.peer(removal.peer_id).is_none() {
            debug!(peer_id = %removal.peer_id, "Peer not active, nothing to remove");
            return;
        }
        if self.remove_session(&mut state, removal.peer_id).await.is_err() {
            state.request_full_sync();
        }
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
