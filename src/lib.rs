//! Ignite init system - PID 1 boot step engine and daemon supervisor.
//!
//! Ignite brings a machine from "kernel just started" to "core daemons
//! running" and then supervises those daemons for the lifetime of the
//! machine:
//!
//! - Filesystem table parsing (fstab/mtab) with bounded, reject-on-
//!   overflow records
//! - Kernel command line parsing and root-device resolution
//! - Ordered virtual-filesystem mounts with table-directed overrides
//! - Daemon launch with readiness probing, bounded retry, and
//!   crash-respawn
//! - Emergency-shell hand-off on a fatal boot step failure
//!
//! # Architecture
//!
//! The [`Init`] engine owns an ordered step list and four collaborator
//! seams: the boot display, the mounter, block-device lookup, and the
//! process launcher. Steps execute in registration order on a single
//! control task; daemon exits come back as channel messages.
//!
//! # Example
//!
//! ```no_run
//! use ignite::{Init, InitConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = InitConfig::default();
//!     let mut init = Init::new(config)?;
//!     init.run().await?;
//!     Ok(())
//! }
//! ```

pub mod blockdev;
pub mod cmdline;
pub mod daemons;
pub mod display;
pub mod error;
pub mod fstab;
pub mod init;
pub mod mounts;
pub mod step;
pub mod supervisor;

// Re-export main types
pub use blockdev::{BlockDevice, BlockDevices, SysBlockDevices};
pub use cmdline::parse_cmdline;
pub use daemons::{default_daemons, load_daemons, DaemonSpec, ReadyCheck};
pub use display::{BootDisplay, ItemStyle, TermDisplay};
pub use error::{Error, Result};
pub use fstab::{parse_table, FsEntry};
pub use init::{Init, InitConfig};
pub use mounts::{default_vfs_mounts, Mounter, SysMounter, VfsMount};
pub use step::{StepKind, StepRecord, StepState};
pub use supervisor::{ExitCause, ExitEvent, Launcher, ProcessLauncher, RunningProc};
