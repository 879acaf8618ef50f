//! Configuration management for the field agent.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! (`FIELD_AGENT__SYNC__INTERVAL_SECS=600`). Every value has a default
//! except the peer URL and the mirror root.

use crate::fs::walker::MANIFEST_CACHE_NAME;
use crate::mount::DEFAULT_LOW_SPACE_BYTES;
use crate::resilience::probe::DEFAULT_PROBE_TARGET;
use crate::resilience::queue::{DEFAULT_OPERATION_RETRIES, DEFAULT_QUEUE_CAPACITY};
use crate::resilience::{Backoff, ResilienceSettings};
use crate::supervisor::RetryPolicy;
use crate::transfer::{SyncSettings, DEFAULT_BATCH_CEILING, DEFAULT_MAX_CONCURRENT_BATCHES};
use crate::utils::{AgentError, Result};
use ::config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "FIELD_AGENT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub peer: PeerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub mount: MountConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Unique agent identifier
    #[serde(default = "default_agent_id")]
    pub id: String,

    /// Local status API port
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Archive host base URL
    #[serde(default)]
    pub url: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Local mirror of the archive tree
    #[serde(default)]
    pub mirror_root: PathBuf,

    /// Extensions to mirror; empty mirrors everything
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,

    /// Delay before the first run after start-up
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    #[serde(default = "default_batch_ceiling")]
    pub batch_ceiling_bytes: u64,

    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,

    /// Consecutive failures before falling back to the regular interval
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,

    #[serde(default = "default_cache_file")]
    pub cache_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address used to tell "link down" from "peer down"
    #[serde(default = "default_probe_address")]
    pub probe_address: String,

    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_queue_expiry")]
    pub queue_expiry_secs: u64,

    #[serde(default = "default_operation_retries")]
    pub operation_max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Disk image backing the virtual volume
    #[serde(default)]
    pub image: PathBuf,

    #[serde(default)]
    pub mount_point: PathBuf,

    /// Passed to `mount -t`; autodetected when unset
    #[serde(default)]
    pub fs_type: Option<String>,

    #[serde(default)]
    pub options: Vec<String>,

    #[serde(default = "default_mount_interval")]
    pub check_interval_secs: u64,

    #[serde(default = "default_mount_timeout")]
    pub remount_timeout_secs: u64,

    #[serde(default = "default_mount_failures")]
    pub max_consecutive_failures: u32,

    #[serde(default = "default_low_space")]
    pub low_space_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default values
fn default_agent_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "field-agent-01".to_string())
}

fn default_port() -> u16 {
    9990
}

fn default_request_timeout() -> u64 {
    30
}

fn default_extensions() -> Vec<String> {
    vec!["png".to_string(), "jpg".to_string(), "jpeg".to_string()]
}

fn default_sync_interval() -> u64 {
    1800
}

fn default_initial_delay() -> u64 {
    60
}

fn default_batch_ceiling() -> u64 {
    DEFAULT_BATCH_CEILING
}

fn default_max_concurrent_batches() -> usize {
    DEFAULT_MAX_CONCURRENT_BATCHES
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    300
}

fn default_max_delay() -> u64 {
    3600
}

fn default_cache_file() -> String {
    MANIFEST_CACHE_NAME.to_string()
}

fn default_probe_address() -> String {
    DEFAULT_PROBE_TARGET.to_string()
}

fn default_probe_interval() -> u64 {
    60
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_unhealthy_threshold() -> u32 {
    crate::resilience::pool::DEFAULT_UNHEALTHY_THRESHOLD
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_queue_expiry() -> u64 {
    24 * 60 * 60
}

fn default_operation_retries() -> u32 {
    DEFAULT_OPERATION_RETRIES
}

fn default_mount_interval() -> u64 {
    300
}

fn default_mount_timeout() -> u64 {
    30
}

fn default_mount_failures() -> u32 {
    5
}

fn default_low_space() -> u64 {
    DEFAULT_LOW_SPACE_BYTES
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: default_agent_id(),
            port: default_port(),
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mirror_root: PathBuf::new(),
            extensions: default_extensions(),
            interval_secs: default_sync_interval(),
            initial_delay_secs: default_initial_delay(),
            batch_ceiling_bytes: default_batch_ceiling(),
            max_concurrent_batches: default_max_concurrent_batches(),
            retry_attempts: default_retry_attempts(),
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
            cache_file: default_cache_file(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe_address: default_probe_address(),
            probe_interval_secs: default_probe_interval(),
            probe_timeout_secs: default_probe_timeout(),
            unhealthy_threshold: default_unhealthy_threshold(),
            queue_capacity: default_queue_capacity(),
            queue_expiry_secs: default_queue_expiry(),
            operation_max_retries: default_operation_retries(),
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image: PathBuf::new(),
            mount_point: PathBuf::new(),
            fs_type: None,
            options: Vec::new(),
            check_interval_secs: default_mount_interval(),
            remount_timeout_secs: default_mount_timeout(),
            max_consecutive_failures: default_mount_failures(),
            low_space_bytes: default_low_space(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load from an optional TOML file plus `FIELD_AGENT__*` overrides.
    /// The result is not validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("sync.extensions")
                    .with_list_parse_key("mount.options")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize::<Config>())
            .map_err(|e| AgentError::Config(e.to_string()))
    }

    /// Parse a TOML document without environment overrides.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| AgentError::Config(e.to_string()))
    }

    /// Reject settings the agent cannot run with.
    pub fn validate(&self) -> Result<()> {
        fn require(ok: bool, message: &str) -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(AgentError::Config(message.to_string()))
            }
        }

        require(!self.agent.id.trim().is_empty(), "agent.id must not be empty")?;
        require(!self.peer.url.trim().is_empty(), "peer.url is required")?;
        require(
            self.peer.url.starts_with("http://") || self.peer.url.starts_with("https://"),
            "peer.url must be an http(s) URL",
        )?;
        require(self.peer.request_timeout_secs > 0, "peer.request_timeout_secs must be positive")?;

        require(
            !self.sync.mirror_root.as_os_str().is_empty(),
            "sync.mirror_root is required",
        )?;
        require(self.sync.interval_secs > 0, "sync.interval_secs must be positive")?;
        require(self.sync.batch_ceiling_bytes > 0, "sync.batch_ceiling_bytes must be positive")?;
        require(
            self.sync.max_concurrent_batches > 0,
            "sync.max_concurrent_batches must be positive",
        )?;
        require(self.sync.retry_attempts > 0, "sync.retry_attempts must be positive")?;
        require(
            self.sync.base_delay_secs > 0 && self.sync.base_delay_secs <= self.sync.max_delay_secs,
            "sync.base_delay_secs must be positive and not exceed sync.max_delay_secs",
        )?;
        require(!self.sync.cache_file.trim().is_empty(), "sync.cache_file must not be empty")?;
        require(
            !self.sync.cache_file.contains(['/', '\\']) && self.sync.cache_file != "..",
            "sync.cache_file must be a plain file name",
        )?;

        require(!self.network.probe_address.is_empty(), "network.probe_address is required")?;
        require(self.network.probe_interval_secs > 0, "network.probe_interval_secs must be positive")?;
        require(self.network.queue_capacity > 0, "network.queue_capacity must be positive")?;
        require(
            self.network.unhealthy_threshold > 0,
            "network.unhealthy_threshold must be positive",
        )?;

        if self.mount.enabled {
            require(!self.mount.image.as_os_str().is_empty(), "mount.image is required")?;
            require(
                !self.mount.mount_point.as_os_str().is_empty(),
                "mount.mount_point is required",
            )?;
            require(
                self.mount.check_interval_secs > 0,
                "mount.check_interval_secs must be positive",
            )?;
            require(
                self.mount.max_consecutive_failures > 0,
                "mount.max_consecutive_failures must be positive",
            )?;
        }

        require(
            matches!(self.log.format.to_ascii_lowercase().as_str(), "pretty" | "json"),
            "log.format must be 'pretty' or 'json'",
        )?;

        Ok(())
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            root: self.sync.mirror_root.clone(),
            extensions: self.sync.extensions.clone(),
            batch_ceiling: self.sync.batch_ceiling_bytes,
            max_concurrent_batches: self.sync.max_concurrent_batches,
            cache_file_name: self.sync.cache_file.clone(),
        }
    }

    pub fn sync_policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_secs(self.sync.interval_secs),
            initial_delay: Duration::from_secs(self.sync.initial_delay_secs),
            max_attempts: self.sync.retry_attempts,
            backoff: Backoff::new(
                Duration::from_secs(self.sync.base_delay_secs),
                Duration::from_secs(self.sync.max_delay_secs),
            ),
        }
    }

    /// Remount retries back off from 30 s up to the check interval.
    pub fn mount_policy(&self) -> RetryPolicy {
        let interval = Duration::from_secs(self.mount.check_interval_secs);
        RetryPolicy {
            interval,
            initial_delay: Duration::from_secs(5),
            max_attempts: self.mount.max_consecutive_failures,
            backoff: Backoff::new(Duration::from_secs(30).min(interval), interval),
        }
    }

    pub fn resilience_settings(&self) -> ResilienceSettings {
        ResilienceSettings {
            probe_interval: Duration::from_secs(self.network.probe_interval_secs),
            queue_expiry: Duration::from_secs(self.network.queue_expiry_secs),
            operation_max_retries: self.network.operation_max_retries,
        }
    }
}
