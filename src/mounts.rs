//! Mount collaborator and virtual-filesystem mount descriptors.

use crate::error::{Error, Result};
use nix::mount::{mount, umount, MsFlags};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Mount/unmount collaborator.
pub trait Mounter: Send {
    /// Mount `device` at `target` with the given filesystem type and
    /// comma-separated options.
    fn mount(&self, device: &str, target: &Path, fstype: &str, options: &str) -> Result<()>;

    /// Unmount the filesystem at `target`.
    fn unmount(&self, target: &Path) -> Result<()>;
}

/// Mounter backed by the mount/umount syscalls.
pub struct SysMounter;

/// Split a comma-separated option string into mount flags and
/// filesystem-specific data.
fn parse_options(options: &str) -> (MsFlags, Option<String>) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();

    for option in options.split(',') {
        match option {
            "" | "defaults" | "rw" => {}
            "ro" => flags |= MsFlags::MS_RDONLY,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            other => data.push(other),
        }
    }

    let data = if data.is_empty() {
        None
    } else {
        Some(data.join(","))
    };
    (flags, data)
}

impl Mounter for SysMounter {
    fn mount(&self, device: &str, target: &Path, fstype: &str, options: &str) -> Result<()> {
        let (flags, data) = parse_options(options);
        mount(Some(device), target, Some(fstype), flags, data.as_deref()).map_err(|source| {
            Error::MountFailed {
                device: device.to_string(),
                target: target.to_path_buf(),
                source,
            }
        })?;
        debug!(device = device, target = %target.display(), fstype = fstype, "Mounted filesystem");
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        umount(target).map_err(|source| Error::UnmountFailed {
            target: target.to_path_buf(),
            source,
        })?;
        debug!(target = %target.display(), "Unmounted filesystem");
        Ok(())
    }
}

/// A virtual-filesystem mount descriptor.
///
/// Holds the compiled-in default mount spec; when the filesystem table
/// carries an entry for the same device, the entry overrides the spec
/// for this boot. The override is held as an index into the per-boot
/// table and re-resolved on every table read.
#[derive(Debug, Clone)]
pub struct VfsMount {
    /// Step name shown on the boot display
    pub name: String,
    /// Device or pseudo-filesystem name
    pub device: String,
    /// Default mount path
    pub mountpoint: PathBuf,
    /// Default filesystem type
    pub fstype: String,
    /// Default mount options
    pub options: String,
    /// Whether a failed mount aborts the boot
    pub fatal: bool,
    /// Index of the fstab entry overriding this mount, if any
    pub discovered: Option<usize>,
}

impl VfsMount {
    /// Create a descriptor with `defaults` options.
    pub fn new(name: &str, device: &str, mountpoint: impl Into<PathBuf>, fstype: &str) -> Self {
        Self {
            name: name.to_string(),
            device: device.to_string(),
            mountpoint: mountpoint.into(),
            fstype: fstype.to_string(),
            options: "defaults".to_string(),
            fatal: false,
            discovered: None,
        }
    }

    /// Mark a failed mount of this filesystem as fatal.
    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }
}

/// Name of the service-channel filesystem in the default mount set.
pub const SVCFS_DEVICE: &str = "svcfs";

/// The compiled-in ordered set of early virtual-filesystem mounts.
pub fn default_vfs_mounts() -> Vec<VfsMount> {
    vec![
        VfsMount::new("mount procfs", "proc", "/proc", "proc").fatal(),
        VfsMount::new("mount sysfs", "sysfs", "/sys", "sysfs"),
        VfsMount::new("mount devtmpfs", "devtmpfs", "/dev", "devtmpfs"),
        VfsMount::new("mount tmpfs", "tmpfs", "/run", "tmpfs"),
        VfsMount::new("mount svcfs", SVCFS_DEVICE, "/svc", "svcfs"),
    ]
}
