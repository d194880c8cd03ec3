//! Orchestration entry point for the Haven domain server.
//!
//! Wires the registry, assignment broker, ICE controller, and authorization
//! layer into one single-writer event loop driven by inbound messages and
//! fixed-period timers, and exposes the admin HTTP surface.

#![forbid(unsafe_code)]

mod content;
mod domain;
pub mod http;
mod messages;
mod metaverse;
mod transport;

pub use content::*;
pub use domain::*;
pub use messages::*;
pub use metaverse::*;
pub use transport::*;
