//! Assignment brokering for the Haven domain server.
//!
//! Owns the catalog of static and dynamic work assignments, the FIFO queue
//! of unfulfilled ones, the pending hand-out map that ties ephemeral offer
//! ids back to durable identities, and the per-wallet credit ledger.

#![forbid(unsafe_code)]

mod broker;
mod config;
mod credits;

pub use broker::*;
pub use config::*;
pub use credits::*;
