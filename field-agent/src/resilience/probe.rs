//! Link-level connectivity probe.
//!
//! Opening a TCP connection to a well-known address tells "our network is
//! down" apart from "the peer is down".

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{info, warn};

pub const DEFAULT_PROBE_TARGET: &str = "8.8.8.8:53";
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ConnectivityProbe {
    target: String,
    timeout: Duration,
    online: AtomicBool,
}

impl ConnectivityProbe {
    /// Starts out optimistic: online until a probe says otherwise.
    pub fn new(target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            timeout,
            online: AtomicBool::new(true),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Force the flag, logging the transition if there is one.
    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::AcqRel);
        if was != online {
            if online {
                info!("Connectivity restored (probe {})", self.target);
            } else {
                warn!("Connectivity lost (probe {})", self.target);
            }
        }
    }

    /// Probe the target once and update the online flag.
    pub async fn check(&self) -> bool {
        let online = matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(self.target.as_str())).await,
            Ok(Ok(_))
        );
        self.set_online(online);
        online
    }
}

impl Default for ConnectivityProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TARGET, DEFAULT_PROBE_TIMEOUT)
    }
}
