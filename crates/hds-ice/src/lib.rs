//! ICE rendezvous connectivity for the Haven domain server.
//!
//! The controller keeps the server advertised to a discovery rendezvous
//! service: it selects a candidate address from the latest hostname lookup,
//! heartbeats it on a fixed period, and fails over after three silent
//! heartbeats. It is a pure state machine — events in, effect values out —
//! and the event loop performs the actual sends.

#![forbid(unsafe_code)]

mod address_update;
mod controller;

pub use address_update::*;
pub use controller::*;
