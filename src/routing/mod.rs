//! Flood routing
//!
//! The routing table stores what this agent knows about reachable
//! destinations; the flooder moves that knowledge between agents with
//! deduplicated, loop-suppressed advertisement flooding.

pub mod flooder;
pub mod table;

pub use flooder::Flooder;
pub use table::{RouteKey, RouteEntry, RoutingTable};
