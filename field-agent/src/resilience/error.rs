//! Network error classification.
//!
//! Every failure of an outbound request is reduced to a [`NetworkErrorKind`].
//! The kind decides whether retrying can help; how often to retry is decided
//! by whoever owns the operation.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    Timeout,
    Refused,
    DnsFailure,
    Unreachable,
    Tls,
    /// The peer answered with a non-success HTTP status.
    Remote(u16),
    Unknown,
}

impl NetworkErrorKind {
    /// DNS and TLS failures are configuration or identity problems and are
    /// never retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, NetworkErrorKind::DnsFailure | NetworkErrorKind::Tls)
    }
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkErrorKind::Timeout => write!(f, "timeout"),
            NetworkErrorKind::Refused => write!(f, "connection refused"),
            NetworkErrorKind::DnsFailure => write!(f, "dns failure"),
            NetworkErrorKind::Unreachable => write!(f, "network unreachable"),
            NetworkErrorKind::Tls => write!(f, "tls error"),
            NetworkErrorKind::Remote(status) => write!(f, "remote error (status {})", status),
            NetworkErrorKind::Unknown => write!(f, "unknown network error"),
        }
    }
}

#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct NetworkError {
    pub kind: NetworkErrorKind,
    pub message: String,
}

impl NetworkError {
    pub fn new(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<reqwest::Error> for NetworkError {
    fn from(err: reqwest::Error) -> Self {
        let kind = classify_reqwest(&err);
        NetworkError {
            kind,
            message: error_chain(&err),
        }
    }
}

impl From<std::io::Error> for NetworkError {
    fn from(err: std::io::Error) -> Self {
        let message = err.to_string();
        let kind = classify_io(&err);
        NetworkError { kind, message }
    }
}

fn classify_reqwest(err: &reqwest::Error) -> NetworkErrorKind {
    if err.is_timeout() {
        return NetworkErrorKind::Timeout;
    }
    if let Some(status) = err.status() {
        return NetworkErrorKind::Remote(status.as_u16());
    }

    // The interesting cause (io::Error, resolver, rustls) sits deeper in the chain
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            let kind = classify_io(io);
            if kind != NetworkErrorKind::Unknown {
                return kind;
            }
        }
        source = cause.source();
    }

    // reqwest's own message embeds the request URL, so only the causes count
    match classify_message(&source_chain(err)) {
        NetworkErrorKind::Unknown if err.is_connect() => NetworkErrorKind::Unreachable,
        kind => kind,
    }
}

pub fn classify_io(err: &std::io::Error) -> NetworkErrorKind {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::TimedOut => NetworkErrorKind::Timeout,
        ErrorKind::ConnectionRefused => NetworkErrorKind::Refused,
        _ => classify_message(&err.to_string()),
    }
}

/// Classify from an error message when no typed cause is available.
pub fn classify_message(message: &str) -> NetworkErrorKind {
    let msg = message.to_ascii_lowercase();

    if msg.contains("timed out") || msg.contains("timeout") {
        NetworkErrorKind::Timeout
    } else if msg.contains("refused") {
        NetworkErrorKind::Refused
    } else if msg.contains("dns")
        || msg.contains("failed to lookup address")
        || msg.contains("name or service not known")
        || msg.contains("no such host")
        || msg.contains("name resolution")
    {
        NetworkErrorKind::DnsFailure
    } else if msg.contains("certificate") || msg.contains("tls") || msg.contains("ssl") {
        NetworkErrorKind::Tls
    } else if msg.contains("unreachable") || msg.contains("no route to host") {
        NetworkErrorKind::Unreachable
    } else {
        NetworkErrorKind::Unknown
    }
}

/// Render an error and all of its sources on one line.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let causes = source_chain(err);
    if !causes.is_empty() {
        message.push_str(": ");
        message.push_str(&causes);
    }
    message
}

/// The sources of `err`, without `err` itself.
fn source_chain(err: &dyn std::error::Error) -> String {
    let mut causes = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        causes.push(cause.to_string());
        source = cause.source();
    }
    causes.join(": ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(NetworkErrorKind::Timeout.is_retryable());
        assert!(NetworkErrorKind::Refused.is_retryable());
        assert!(NetworkErrorKind::Unreachable.is_retryable());
        assert!(NetworkErrorKind::Remote(503).is_retryable());
        assert!(NetworkErrorKind::Unknown.is_retryable());
        assert!(!NetworkErrorKind::DnsFailure.is_retryable());
        assert!(!NetworkErrorKind::Tls.is_retryable());
    }

    #[test]
    fn test_classify_message() {
        assert_eq!(
            classify_message("dns error: failed to lookup address information"),
            NetworkErrorKind::DnsFailure
        );
        assert_eq!(
            classify_message("invalid peer certificate: UnknownIssuer"),
            NetworkErrorKind::Tls
        );
        assert_eq!(
            classify_message("Network is unreachable (os error 101)"),
            NetworkErrorKind::Unreachable
        );
        assert_eq!(classify_message("something odd"), NetworkErrorKind::Unknown);
    }

    #[test]
    fn test_classify_io() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "nope");
        assert_eq!(NetworkError::from(refused).kind, NetworkErrorKind::Refused);

        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert_eq!(NetworkError::from(timeout).kind, NetworkErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_refused_connection_is_classified() {
        // Bind then drop a listener so the port is very likely closed
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = reqwest::Client::new()
            .get(format!("http://{}/health", addr))
            .send()
            .await
            .unwrap_err();

        let classified = NetworkError::from(err);
        assert_eq!(classified.kind, NetworkErrorKind::Refused);
        assert!(classified.is_retryable());
    }

    #[tokio::test]
    async fn test_url_text_does_not_decide_the_class() {
        // Accept and immediately drop every connection
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let err = reqwest::Client::new()
            .get(format!("http://{}/dns-tls-ssl-mirror/health", addr))
            .send()
            .await
            .unwrap_err();

        let classified = NetworkError::from(err);
        assert_ne!(classified.kind, NetworkErrorKind::DnsFailure);
        assert_ne!(classified.kind, NetworkErrorKind::Tls);
        assert!(classified.is_retryable());
    }
}
