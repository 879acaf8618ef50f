//! Utility modules for the field agent.

pub mod errors;
pub mod logger;

pub use errors::{AgentError, ErrorClass, Result};
