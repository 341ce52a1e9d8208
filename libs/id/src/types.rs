//! Typed ID definitions for dynamic routing resources.

use crate::define_id;

// =============================================================================
// Routing resources
// =============================================================================

define_id!(
    /// A BGP neighbor configured through the admin API.
    PeerId,
    "peer"
);
define_id!(
    /// A logical routing context that advertises routes for its networks.
    RoutingInstanceId,
    "ri"
);
define_id!(
    /// A network owned by the external networking subsystem.
    NetworkId,
    "net"
);

// =============================================================================
// Fleet
// =============================================================================

define_id!(
    /// A dynamic routing agent process registered through state reports.
    AgentId,
    "agent"
);
define_id!(BindingId, "bnd");

// =============================================================================
// Tenancy and requests
// =============================================================================

define_id!(TenantId, "tnt");
define_id!(RequestId, "req");
