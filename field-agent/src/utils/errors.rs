//! Custom error types for the field agent.

use crate::resilience::NetworkError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("System is offline")]
    Offline,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Integrity error for {path}: {reason}")]
    Integrity { path: String, reason: String },

    #[error("Invalid relative path: {0}")]
    InvalidPath(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Task error: {0}")]
    Task(String),
}

/// Error taxonomy shared by every component.
///
/// The class decides how a supervised task reacts to a failure; it never
/// decides how many times to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    TransientNetwork,
    PermanentNetwork,
    Integrity,
    LocalResource,
    FatalConfig,
}

impl AgentError {
    /// Wrap an I/O error with the path it happened at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AgentError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            AgentError::Config(_) => ErrorClass::FatalConfig,
            AgentError::Network(e) => {
                if e.kind.is_retryable() {
                    ErrorClass::TransientNetwork
                } else {
                    ErrorClass::PermanentNetwork
                }
            }
            AgentError::Offline => ErrorClass::TransientNetwork,
            AgentError::Integrity { .. } | AgentError::Archive(_) => ErrorClass::Integrity,
            AgentError::InvalidPath(_) => ErrorClass::Integrity,
            AgentError::Serialization(_) => ErrorClass::Integrity,
            AgentError::Io { .. } | AgentError::Mount(_) | AgentError::Task(_) => {
                ErrorClass::LocalResource
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::NetworkErrorKind;

    #[test]
    fn test_error_classes() {
        assert_eq!(AgentError::Config("x".into()).class(), ErrorClass::FatalConfig);
        assert_eq!(AgentError::Offline.class(), ErrorClass::TransientNetwork);

        let dns = NetworkError::new(NetworkErrorKind::DnsFailure, "no such host");
        assert_eq!(AgentError::from(dns).class(), ErrorClass::PermanentNetwork);

        let refused = NetworkError::new(NetworkErrorKind::Refused, "connection refused");
        assert_eq!(AgentError::from(refused).class(), ErrorClass::TransientNetwork);

        let disk = AgentError::io(
            "/mirror/a.png",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(disk.class(), ErrorClass::LocalResource);
    }
}
