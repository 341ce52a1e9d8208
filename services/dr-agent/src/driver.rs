//! Routing engine interface and mock implementation.
//!
//! The driver abstracts the BGP speaker the agent controls:
//! - Establishing and tearing down peer sessions
//! - Announcing and withdrawing prefixes
//!
//! Best-path changes flow out of the engine through a bounded channel that
//! the engine feeds with `try_send`, so a slow consumer never stalls it.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dynroute_events::BestPathChange;
use dynroute_networking::{AsNumber, Cidr};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Capacity of the best-path event channel.
pub const BEST_PATH_QUEUE_DEPTH: usize = 256;

/// Routing engine errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// The peer or prefix is already configured. Callers treat this as success on add.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// The peer or prefix is unknown. Callers treat this as success on remove.
    #[error("{0} not found")]
    NotFound(String),

    #[error("routing engine error: {0}")]
    Engine(String),

    #[error("routing engine call timed out after {0:?}")]
    Timeout(Duration),
}

/// Routing engine interface.
#[async_trait]
pub trait RoutingEngineDriver: Send + Sync {
    /// Establish a session with `address`.
    async fn add_peer(
        &self,
        address: IpAddr,
        remote_as: AsNumber,
        secret: Option<&str>,
    ) -> Result<(), DriverError>;

    /// Tear down the session with `address`.
    async fn remove_peer(&self, address: IpAddr) -> Result<(), DriverError>;

    /// Announce `prefix`, optionally with an explicit next hop.
    async fn advertise_route(&self, prefix: Cidr, next_hop: Option<IpAddr>)
        -> Result<(), DriverError>;

    /// Withdraw a previously announced `prefix`.
    async fn withdraw_route(&self, prefix: Cidr) -> Result<(), DriverError>;
}

/// Create the channel the engine publishes best-path changes on.
pub fn best_path_channel() -> (mpsc::Sender<BestPathChange>, mpsc::Receiver<BestPathChange>) {
    mpsc::channel(BEST_PATH_QUEUE_DEPTH)
}

/// Log best-path changes until the channel closes or shutdown is signalled.
pub async fn run_best_path_consumer(
    mut events: mpsc::Receiver<BestPathChange>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                info!(
                    remote_as = %event.remote_as,
                    prefix = %event.prefix,
                    next_hop = %event.next_hop,
                    is_withdraw = event.is_withdraw,
                    "Best path changed"
                );
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Best path consumer stopped");
}

// =============================================================================
// Mock driver
// =============================================================================

/// A call recorded by [`MockDriver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    AddPeer(IpAddr),
    RemovePeer(IpAddr),
    AdvertiseRoute(Cidr),
    WithdrawRoute(Cidr),
}

/// A session held by [`MockDriver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockSession {
    pub remote_as: AsNumber,
    pub authenticated: bool,
}

#[derive(Default)]
struct MockEngine {
    sessions: BTreeMap<IpAddr, MockSession>,
    routes: BTreeMap<Cidr, Option<IpAddr>>,
    failing_peers: BTreeSet<IpAddr>,
    failing_routes: BTreeSet<Cidr>,
    calls: Vec<DriverCall>,
}

/// In-memory routing engine for tests and development.
pub struct MockDriver {
    local_as: AsNumber,
    router_id: IpAddr,
    engine: Mutex<MockEngine>,
    delay: Mutex<Option<Duration>>,
    best_path: mpsc::Sender<BestPathChange>,
}

impl MockDriver {
    pub fn new(
        local_as: AsNumber,
        router_id: IpAddr,
        best_path: mpsc::Sender<BestPathChange>,
    ) -> Self {
        info!(local_as = %local_as, router_id = %router_id, "[MOCK] Routing engine started");
        Self {
            local_as,
            router_id,
            engine: Mutex::new(MockEngine::default()),
            delay: Mutex::new(None),
            best_path,
        }
    }

    pub fn local_as(&self) -> AsNumber {
        self.local_as
    }

    pub fn router_id(&self) -> IpAddr {
        self.router_id
    }

    fn engine(&self) -> MutexGuard<'_, MockEngine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every call touching `address` fail with an engine error.
    pub fn fail_peer(&self, address: IpAddr) {
        self.engine().failing_peers.insert(address);
    }

    /// Make every call touching `prefix` fail with an engine error.
    pub fn fail_route(&self, prefix: Cidr) {
        self.engine().failing_routes.insert(prefix);
    }

    /// Clear all injected failures.
    pub fn heal(&self) {
        let mut engine = self.engine();
        engine.failing_peers.clear();
        engine.failing_routes.clear();
    }

    /// Delay every call by `delay`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Calls received so far, in order.
    pub fn calls(&self) -> Vec<DriverCall> {
        self.engine().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.engine().calls.clear();
    }

    pub fn sessions(&self) -> BTreeMap<IpAddr, MockSession> {
        self.engine().sessions.clone()
    }

    pub fn routes(&self) -> BTreeMap<Cidr, Option<IpAddr>> {
        self.engine().routes.clone()
    }

    /// Publish a best-path change as the engine would. Returns false when
    /// the event was dropped because the consumer is behind or gone.
    pub fn simulate_best_path_change(&self, event: BestPathChange) -> bool {
        match self.best_path.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(prefix = %event.prefix, "Best path queue full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl RoutingEngineDriver for MockDriver {
    async fn add_peer(
        &self,
        address: IpAddr,
        remote_as: AsNumber,
        secret: Option<&str>,
    ) -> Result<(), DriverError> {
        self.pause().await;
        let mut engine = self.engine();
        engine.calls.push(DriverCall::AddPeer(address));

        if engine.failing_peers.contains(&address) {
            return Err(DriverError::Engine(format!("neighbor_add {address} refused")));
        }
        if engine.sessions.contains_key(&address) {
            return Err(DriverError::AlreadyExists(format!("peer {address}")));
        }

        info!(peer = %address, remote_as = %remote_as, "[MOCK] Neighbor added");
        engine.sessions.insert(
            address,
            MockSession {
                remote_as,
                authenticated: secret.is_some(),
            },
        );
        Ok(())
    }

    async fn remove_peer(&self, address: IpAddr) -> Result<(), DriverError> {
        self.pause().await;
        let mut engine = self.engine();
        engine.calls.push(DriverCall::RemovePeer(address));

        if engine.failing_peers.contains(&address) {
            return Err(DriverError::Engine(format!("neighbor_del {address} refused")));
        }
        match engine.sessions.remove(&address) {
            Some(_) => {
                info!(peer = %address, "[MOCK] Neighbor removed");
                Ok(())
            }
            None => Err(DriverError::NotFound(format!("peer {address}"))),
        }
    }

    async fn advertise_route(
        &self,
        prefix: Cidr,
        next_hop: Option<IpAddr>,
    ) -> Result<(), DriverError> {
        self.pause().await;
        let mut engine = self.engine();
        engine.calls.push(DriverCall::AdvertiseRoute(prefix));

        if engine.failing_routes.contains(&prefix) {
            return Err(DriverError::Engine(format!("prefix_add {prefix} refused")));
        }
        if engine.routes.contains_key(&prefix) {
            return Err(DriverError::AlreadyExists(format!("prefix {prefix}")));
        }

        debug!(prefix = %prefix, "[MOCK] Prefix advertised");
        engine.routes.insert(prefix, next_hop);
        Ok(())
    }

    async fn withdraw_route(&self, prefix: Cidr) -> Result<(), DriverError> {
        self.pause().await;
        let mut engine = self.engine();
        engine.calls.push(DriverCall::WithdrawRoute(prefix));

        if engine.failing_routes.contains(&prefix) {
            return Err(DriverError::Engine(format!("prefix_del {prefix} refused")));
        }
        match engine.routes.remove(&prefix) {
            Some(_) => {
                debug!(prefix = %prefix, "[MOCK] Prefix withdrawn");
                Ok(())
            }
            None => Err(DriverError::NotFound(format!("prefix {prefix}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> (MockDriver, mpsc::Receiver<BestPathChange>) {
        let (tx, rx) = mpsc::channel(1);
        let driver = MockDriver::new(
            AsNumber::new(12345).unwrap(),
            "127.0.0.1".parse().unwrap(),
            tx,
        );
        (driver, rx)
    }

    #[tokio::test]
    async fn test_add_peer_twice_reports_already_exists() {
        let (driver, _rx) = driver();
        let address: IpAddr = "192.0.2.1".parse().unwrap();
        let remote_as = AsNumber::new(65001).unwrap();

        driver.add_peer(address, remote_as, Some("s3cret")).await.unwrap();
        let err = driver.add_peer(address, remote_as, None).await.unwrap_err();

        assert!(matches!(err, DriverError::AlreadyExists(_)));
        assert!(driver.sessions()[&address].authenticated);
    }

    #[tokio::test]
    async fn test_remove_unknown_peer_reports_not_found() {
        let (driver, _rx) = driver();
        let err = driver
            .remove_peer("192.0.2.9".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_injected_failure_until_healed() {
        let (driver, _rx) = driver();
        let address: IpAddr = "2001:db8::1".parse().unwrap();
        let remote_as = AsNumber::new(65001).unwrap();

        driver.fail_peer(address);
        let err = driver.add_peer(address, remote_as, None).await.unwrap_err();
        assert!(matches!(err, DriverError::Engine(_)));

        driver.heal();
        driver.add_peer(address, remote_as, None).await.unwrap();
        assert_eq!(
            driver.calls(),
            vec![DriverCall::AddPeer(address), DriverCall::AddPeer(address)]
        );
    }

    #[tokio::test]
    async fn test_best_path_change_never_blocks() {
        let (driver, mut rx) = driver();
        let event = BestPathChange {
            remote_as: AsNumber::new(65001).unwrap(),
            prefix: "10.0.0.0/24".parse().unwrap(),
            next_hop: "192.0.2.1".parse().unwrap(),
            is_withdraw: false,
        };

        assert!(driver.simulate_best_path_change(event.clone()));
        // Capacity is one; the second event is dropped rather than waited on.
        assert!(!driver.simulate_best_path_change(event.clone()));

        assert_eq!(rx.recv().await, Some(event));
    }

    #[tokio::test]
    async fn test_routes_track_next_hop() {
        let (driver, _rx) = driver();
        let prefix: Cidr = "10.0.0.0/24".parse().unwrap();
        let next_hop: IpAddr = "192.0.2.254".parse().unwrap();

        driver.advertise_route(prefix, Some(next_hop)).await.unwrap();
        assert_eq!(driver.routes()[&prefix], Some(next_hop));

        driver.withdraw_route(prefix).await.unwrap();
        let err = driver.withdraw_route(prefix).await.unwrap_err();
        assert!(matches!(err, DriverError::NotFound(_)));
    }
}
