//! Node registry for the Haven domain server.
//!
//! Tracks connected nodes, their declared interest sets, and the pairwise
//! connection secrets minted for mutually-visible pairs. Produces broadcast
//! plans (roster, node-added, node-removed) that the event loop hands to the
//! transport, and reconciles the replication topology against configuration.

#![forbid(unsafe_code)]

mod broadcast;
mod registry;
mod replication;

pub use broadcast::*;
pub use registry::*;
pub use replication::*;
