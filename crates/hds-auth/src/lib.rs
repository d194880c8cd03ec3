//! Session and authorization layer for the Haven domain server.
//!
//! Three mutually exclusive policies gate the admin HTTP surface, evaluated
//! in priority order: OAuth session cookies against an admin allow-list,
//! HTTP Basic credentials, or no gate at all. The OAuth callback is a
//! two-hop async flow (code → token → profile) modeled as an explicit
//! state object keyed by a single-use anti-replay token.

#![forbid(unsafe_code)]

mod basic;
mod oauth;
mod policy;
mod session;

pub use basic::*;
pub use oauth::*;
pub use policy::*;
pub use session::*;
