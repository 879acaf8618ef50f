use super::MountBackend;
use crate::utils::{AgentError, Result};
use async_trait::async_trait;
use nix::mount::{umount2, MntFlags};
use nix::sys::statvfs::statvfs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

const PROC_MOUNTS: &str = "/proc/self/mounts";

/// Disk image attached through a loop device.
#[derive(Debug, Clone)]
pub struct LoopMount {
    image: PathBuf,
    mount_point: PathBuf,
    fs_type: Option<String>,
    options: Vec<String>,
    timeout: Duration,
}

impl LoopMount {
    pub fn new(image: impl Into<PathBuf>, mount_point: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            image: image.into(),
            mount_point: mount_point.into(),
            fs_type: None,
            options: Vec::new(),
            timeout,
        }
    }

    pub fn with_fs_type(mut self, fs_type: impl Into<String>) -> Self {
        self.fs_type = Some(fs_type.into());
        self
    }

    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    fn mount_args(&self) -> Vec<String> {
        let mut opts = vec!["loop".to_string()];
        opts.extend(self.options.iter().cloned());

        let mut args = vec!["-o".to_string(), opts.join(",")];
        if let Some(fs_type) = &self.fs_type {
            args.push("-t".to_string());
            args.push(fs_type.clone());
        }
        args.push(self.image.to_string_lossy().into_owned());
        args.push(self.mount_point.to_string_lossy().into_owned());
        args
    }
}

/// Mount points listed in a `/proc/mounts`-style table.
pub fn parse_mount_points(table: &str) -> Vec<PathBuf> {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|field| PathBuf::from(unescape_mount_field(field)))
        .collect()
}

/// The kernel escapes space, tab, newline and backslash as `\ooo`.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let octal = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(value) = octal {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[async_trait]
impl MountBackend for LoopMount {
    fn describe(&self) -> String {
        format!("{} on {}", self.image.display(), self.mount_point.display())
    }

    async fn is_mounted(&self) -> bool {
        match tokio::fs::read_to_string(PROC_MOUNTS).await {
            Ok(table) => parse_mount_points(&table).iter().any(|p| p == &self.mount_point),
            Err(e) => {
                debug!("Failed to read {}: {}", PROC_MOUNTS, e);
                false
            }
        }
    }

    async fn mount(&self) -> Result<()> {
        if !self.image.exists() {
            return Err(AgentError::Mount(format!(
                "disk image not found: {}",
                self.image.display()
            )));
        }
        tokio::fs::create_dir_all(&self.mount_point)
            .await
            .map_err(|e| AgentError::io(&self.mount_point, e))?;

        let args = self.mount_args();
        debug!("mount {}", args.join(" "));

        let child = Command::new("mount")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Mount(format!("failed to spawn mount: {}", e)))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                AgentError::Mount(format!("mount timed out after {}s", self.timeout.as_secs()))
            })?
            .map_err(|e| AgentError::Mount(format!("mount failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AgentError::Mount(format!(
                "mount exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        info!("Mounted {}", self.describe());
        Ok(())
    }

    async fn unmount(&self, force: bool) -> Result<()> {
        let target = self.mount_point.clone();
        let flags = if force {
            MntFlags::MNT_FORCE | MntFlags::MNT_DETACH
        } else {
            MntFlags::empty()
        };

        tokio::task::spawn_blocking(move || umount2(&target, flags))
            .await
            .map_err(|e| AgentError::Task(e.to_string()))?
            .map_err(|errno| {
                AgentError::Mount(format!(
                    "umount {} failed: {}",
                    self.mount_point.display(),
                    errno
                ))
            })
    }

    async fn free_space(&self) -> Option<u64> {
        let target = self.mount_point.clone();
        let stat = tokio::task::spawn_blocking(move || statvfs(&target))
            .await
            .ok()?
            .ok()?;
        Some(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }
}
