//! Core types for the Haven domain server.
//!
//! This crate holds the vocabulary shared by the orchestration crates:
//! node kinds and permissions, assignment descriptions, the settings
//! manager with its ordered change subscribers, and the error taxonomy.

#![forbid(unsafe_code)]

mod assignment;
mod error;
mod node;
mod settings;

pub use assignment::*;
pub use error::*;
pub use node::*;
pub use settings::*;
