//! Error types for the init system.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for init system operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the init system.
#[derive(Error, Debug)]
pub enum Error {
    /// Not running as PID 1 when required
    #[error("Must run as PID 1, but running as PID {0}")]
    NotPid1(u32),

    /// Reading a system table file failed
    #[error("Failed to read table {}: {source}", path.display())]
    TableRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A mount attempt failed
    #[error("Failed to mount {device} at {}: {source}", target.display())]
    MountFailed {
        device: String,
        target: PathBuf,
        #[source]
        source: nix::Error,
    },

    /// An unmount attempt failed
    #[error("Failed to unmount {}: {source}", target.display())]
    UnmountFailed {
        target: PathBuf,
        #[source]
        source: nix::Error,
    },

    /// A process could not be started
    #[error("Failed to launch {}: {reason}", binary.display())]
    LaunchFailed { binary: PathBuf, reason: String },

    /// A run-as user does not exist
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// A fatal boot step failed
    #[error("Fatal boot step failed: {0}")]
    FatalStep(String),

    /// Daemon set configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error
    #[error("System error: {0}")]
    Sys(#[from] nix::Error),
}
