//! Daemon launch descriptors and readiness checks.
//!
//! The daemon set is an ordered list: each entry names the binary to
//! launch, its arguments, an optional run-as user, a readiness check,
//! and whether a failure to reach readiness aborts the boot. The
//! compiled-in set can be replaced by a TOML file.

use crate::error::{Error, Result};
use crate::mounts::SVCFS_DEVICE;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// How a daemon signals that it has reached a usable state.
///
/// Checks are side-effect-free and may be evaluated any number of times.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ReadyCheck {
    /// A socket node exists at `suffix` under the mountpoint of the
    /// named virtual filesystem.
    Socket {
        /// Device name of the VFS mount the socket lives under
        mount: String,
        /// Path of the socket relative to the mountpoint
        suffix: PathBuf,
    },
    /// The named device appears in the live mount table at its VFS
    /// descriptor's mountpoint.
    Mounted {
        /// Device name to look for
        device: String,
    },
    /// No readiness probe; the daemon counts as ready once launched.
    #[default]
    None,
}

/// A daemon launch descriptor. Immutable after startup configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonSpec {
    /// Step name shown on the boot display
    pub name: String,
    /// Binary path; also the key of the running-process record
    pub binary: PathBuf,
    /// Whitespace-separated argument string
    #[serde(default)]
    pub args: String,
    /// Run-as user name
    #[serde(default)]
    pub user: Option<String>,
    /// Readiness check
    #[serde(default)]
    pub ready: ReadyCheck,
    /// Whether readiness-timeout aborts the boot
    #[serde(default)]
    pub fatal: bool,
}

#[derive(Debug, Deserialize)]
struct DaemonFile {
    #[serde(default)]
    daemon: Vec<DaemonSpec>,
}

/// The compiled-in ordered daemon set.
///
/// `svcfsd` is the userspace fallback for the service-channel
/// filesystem: the kernel-driver mount may have failed, in which case
/// the daemon provides the mount and readiness means the device shows
/// up in the mount table. `confd` and `execd` signal readiness by
/// creating their sockets under the service-channel mountpoint; only
/// `execd` is required for a usable system.
pub fn default_daemons() -> Vec<DaemonSpec> {
    vec![
        DaemonSpec {
            name: "start svcfsd".to_string(),
            binary: PathBuf::from("/sbin/svcfsd"),
            args: "-f -o allow_other /svc".to_string(),
            user: None,
            ready: ReadyCheck::Mounted {
                device: SVCFS_DEVICE.to_string(),
            },
            fatal: false,
        },
        DaemonSpec {
            name: "start confd".to_string(),
            binary: PathBuf::from("/sbin/confd"),
            args: "-f".to_string(),
            user: Some("config".to_string()),
            ready: ReadyCheck::Socket {
                mount: SVCFS_DEVICE.to_string(),
                suffix: PathBuf::from("config/io"),
            },
            fatal: false,
        },
        DaemonSpec {
            name: "start execd".to_string(),
            binary: PathBuf::from("/sbin/execd"),
            args: "-f".to_string(),
            user: Some("executor".to_string()),
            ready: ReadyCheck::Socket {
                mount: SVCFS_DEVICE.to_string(),
                suffix: PathBuf::from("executor/io"),
            },
            fatal: true,
        },
    ]
}

/// Load a daemon set from a TOML file, replacing the compiled-in set.
pub fn load_daemons(path: &Path) -> Result<Vec<DaemonSpec>> {
    let content = std::fs::read_to_string(path)?;
    let file: DaemonFile = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
    if file.daemon.is_empty() {
        return Err(Error::Config(format!(
            "{}: no daemons defined",
            path.display()
        )));
    }
    Ok(file.daemon)
}
