//! Keeping the virtual volume mounted.
//!
//! The OS-specific work sits behind [`MountBackend`]; [`MountWatch`] turns a
//! backend into a supervised action that verifies the mount each cycle and
//! remounts when it is gone.

#[cfg(target_os = "linux")]
pub mod loop_mount;
pub mod watch;

#[cfg(target_os = "linux")]
pub use loop_mount::LoopMount;
pub use watch::MountWatch;

use crate::utils::Result;
use async_trait::async_trait;
use serde::Serialize;

/// Default free-space threshold below which a warning is logged: 1 GiB.
pub const DEFAULT_LOW_SPACE_BYTES: u64 = 1024 * 1024 * 1024;

#[async_trait]
pub trait MountBackend: Send + Sync + 'static {
    /// Human-readable description for logs.
    fn describe(&self) -> String;

    async fn is_mounted(&self) -> bool;

    async fn mount(&self) -> Result<()>;

    async fn unmount(&self, force: bool) -> Result<()>;

    /// Free bytes on the mounted volume, when known.
    async fn free_space(&self) -> Option<u64> {
        None
    }
}

/// Mount transitions reported to collaborators.
pub trait MountEvents: Send + Sync {
    /// The volume was found missing. Fired once per outage.
    fn on_mount_lost(&self) {}
    fn on_mount_recovered(&self) {}
}

/// Result of one mount check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MountReport {
    pub remounted: bool,
    pub free_bytes: Option<u64>,
    pub low_space: bool,
}
