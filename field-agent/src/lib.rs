//! Field Agent Library
//!
//! Keeps a field host's mirror consistent with an archive host over an
//! unreliable link: checksum manifests, batched archive transfers, a
//! resilience layer for offline operation, and supervised periodic tasks
//! for the sync and the virtual volume mount.

pub mod api;
pub mod config;
pub mod daemon;
pub mod fs;
pub mod manifest;
pub mod mount;
pub mod protocol;
pub mod resilience;
pub mod supervisor;
pub mod transfer;
pub mod updates;
pub mod utils;
pub mod ws;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::AgentError;
pub type Result<T> = std::result::Result<T, AgentError>;
