//! # dynroute-events
//!
//! Wire types exchanged between the authority and dynamic routing agents.
//!
//! ## Directions
//!
//! - Agent to authority: sync requests and state reports (pull side)
//! - Authority to agent: fire-and-forget notifications (push side)
//! - Routing engine to agent: best-path change events
//!
//! Payloads are explicit records validated at deserialization time; an
//! agent never sees an unparsed peer address or AS number.

mod envelope;
mod types;

pub use envelope::*;
pub use types::*;

/// Agent type tag an agent must report to take part in scheduling.
pub const AGENT_TYPE_DYNAMIC_ROUTING: &str = "Dynamic routing agent";

/// Binary name reported by the agent.
pub const AGENT_BINARY: &str = "dr-agent";

/// Topic prefix; notifications are addressed to `{DR_AGENT_TOPIC}.{host}`.
pub const DR_AGENT_TOPIC: &str = "dr_agent";
