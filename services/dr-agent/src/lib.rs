//! dynroute Agent Library
//!
//! The agent runs next to a BGP-capable routing engine on each host. It
//! pulls its assigned peers and advertise networks from the authority and
//! converges the engine toward them.
//!
//! ## Architecture
//!
//! - **SyncReconciler**: periodic full sync plus pushed notifications
//! - **HeartbeatReporter**: periodic state reports, self-disabling
//! - **Listener**: accepts notifications from the authority
//! - **RoutingEngineDriver**: abstracts the BGP speaker (mock in dev)
//!
//! `AgentState` holds no durable data; a restart rebuilds it from the
//! authority.

pub mod client;
pub mod config;
pub mod driver;
pub mod heartbeat;
pub mod listener;
pub mod reconciler;
pub mod state;

pub use client::{Authority, AuthorityClient, ClientError};
pub use driver::{DriverError, MockDriver, RoutingEngineDriver};
pub use reconciler::{ReconcileReport, ReconcilerConfig, SyncReconciler};
pub use state::{AgentState, PeerSession, SharedState};
