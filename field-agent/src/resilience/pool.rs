//! Pooled HTTP client for one peer, with health tracking.

use super::error::{NetworkError, NetworkErrorKind};
use crate::utils::{AgentError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Default number of consecutive failures before a pool is unhealthy.
pub const DEFAULT_UNHEALTHY_THRESHOLD: u32 = 3;

/// Health snapshot of a pool entry.
#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub identity: String,
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// What an operation gets to talk to the peer with.
#[derive(Debug, Clone)]
pub struct Endpoint {
    client: reqwest::Client,
    base_url: Arc<str>,
    request_timeout: Duration,
}

impl Endpoint {
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

pub struct ConnectionPool {
    endpoint: Endpoint,
    unhealthy_threshold: u32,
    health: RwLock<PoolHealth>,
}

impl ConnectionPool {
    pub fn new(base_url: &str, request_timeout: Duration, unhealthy_threshold: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| AgentError::Config(format!("failed to build HTTP client: {}", e)))?;

        let base_url = base_url.trim_end_matches('/');
        let parsed = reqwest::Url::parse(base_url)
            .map_err(|e| AgentError::Config(format!("invalid peer URL '{}': {}", base_url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AgentError::Config(format!(
                "peer URL must be http or https: {}",
                base_url
            )));
        }

        Ok(Self {
            endpoint: Endpoint {
                client,
                base_url: Arc::from(base_url),
                request_timeout,
            },
            unhealthy_threshold: unhealthy_threshold.max(1),
            health: RwLock::new(PoolHealth {
                identity: base_url.to_string(),
                is_healthy: true,
                consecutive_failures: 0,
                last_success_at: None,
            }),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Run `op` against the peer and record the outcome.
    pub async fn execute<T, F, Fut>(&self, op: F) -> std::result::Result<T, NetworkError>
    where
        F: FnOnce(Endpoint) -> Fut,
        Fut: Future<Output = std::result::Result<T, NetworkError>>,
    {
        match op(self.endpoint.clone()).await {
            Ok(value) => {
                self.mark_success().await;
                Ok(value)
            }
            Err(e) => {
                self.mark_failure(&e).await;
                Err(e)
            }
        }
    }

    /// Explicit `GET /health` probe against the peer.
    pub async fn check_health(&self) -> std::result::Result<(), NetworkError> {
        self.execute(|endpoint| async move {
            let response = endpoint
                .client()
                .get(endpoint.url("/health"))
                .timeout(endpoint.request_timeout())
                .send()
                .await?;

            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(NetworkError::new(
                    NetworkErrorKind::Remote(status.as_u16()),
                    format!("health check returned {}", status),
                ))
            }
        })
        .await
    }

    pub async fn is_healthy(&self) -> bool {
        self.health.read().await.is_healthy
    }

    pub async fn health(&self) -> PoolHealth {
        self.health.read().await.clone()
    }

    async fn mark_success(&self) {
        let mut health = self.health.write().await;
        if !health.is_healthy {
            info!("Connection to {} is healthy again", health.identity);
        }
        health.is_healthy = true;
        health.consecutive_failures = 0;
        health.last_success_at = Some(Utc::now());
    }

    async fn mark_failure(&self, error: &NetworkError) {
        let mut health = self.health.write().await;
        health.consecutive_failures += 1;
        debug!(
            "Request to {} failed ({} in a row): {}",
            health.identity, health.consecutive_failures, error
        );

        if health.is_healthy && health.consecutive_failures >= self.unhealthy_threshold {
            health.is_healthy = false;
            warn!(
                "Marking connection to {} unhealthy after {} consecutive failures",
                health.identity, health.consecutive_failures
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refused() -> NetworkError {
        NetworkError::new(NetworkErrorKind::Refused, "connection refused")
    }

    #[tokio::test]
    async fn test_unhealthy_after_threshold() {
        let pool = ConnectionPool::new("http://127.0.0.1:9", Duration::from_secs(1), 3).unwrap();

        for expected_healthy in [true, true, false] {
            let result: std::result::Result<(), _> = pool.execute(|_| async { Err(refused()) }).await;
            assert!(result.is_err());
            assert_eq!(pool.is_healthy().await, expected_healthy);
        }

        assert_eq!(pool.health().await.consecutive_failures, 3);
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let pool = ConnectionPool::new("http://127.0.0.1:9/", Duration::from_secs(1), 3).unwrap();

        for _ in 0..3 {
            let _ = pool.execute(|_| async { Err::<(), _>(refused()) }).await;
        }
        assert!(!pool.is_healthy().await);

        let value = pool.execute(|_| async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);

        let health = pool.health().await;
        assert!(health.is_healthy);
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.last_success_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_alone_does_not_restore_health() {
        let pool = ConnectionPool::new("http://127.0.0.1:9", Duration::from_secs(1), 1).unwrap();
        let _ = pool.execute(|_| async { Err::<(), _>(refused()) }).await;

        tokio::time::advance(Duration::from_secs(24 * 3600)).await;
        assert!(!pool.is_healthy().await);
    }

    #[test]
    fn test_endpoint_url_joins_without_double_slash() {
        let pool = ConnectionPool::new("http://archive:8080/", Duration::from_secs(1), 3).unwrap();
        assert_eq!(pool.endpoint().url("/manifest"), "http://archive:8080/manifest");
    }
}
