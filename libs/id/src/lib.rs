//! # dynroute-id
//!
//! Typed identifiers for the dynamic routing control plane.
//!
//! ## ID Format
//!
//! Every entity ID uses a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `peer_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `ri_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `agent_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! The prefix keeps a peer ID from being passed where an agent ID is
//! expected, both in Rust signatures and on the wire. ULIDs sort by creation
//! time, which gives the scheduler a stable "first unbound" order.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
