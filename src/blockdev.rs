//! Block-device enumeration and identification.
//!
//! The boot engine only needs four lookups: by device path, by volume
//! UUID, by volume label, and a generic fallback that tries all of them.
//! The system-backed implementation scans `/sys/class/block` for device
//! names and resolves UUID/label identifiers through the
//! `/dev/disk/by-uuid` and `/dev/disk/by-label` symlink farms.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A probed block device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    /// Device node path
    pub path: PathBuf,
    /// Filesystem type, when known
    pub fstype: Option<String>,
}

/// Block-device lookup collaborator.
pub trait BlockDevices: Send {
    /// Refresh the probed device list.
    fn probe(&mut self);

    /// Look up a device by its node path among probed devices.
    fn by_path(&self, path: &Path) -> Option<BlockDevice>;

    /// Look up a device by volume UUID.
    fn by_uuid(&self, uuid: &str) -> Option<BlockDevice>;

    /// Look up a device by volume label.
    fn by_label(&self, label: &str) -> Option<BlockDevice>;

    /// Generic lookup: path, then UUID, then label.
    fn lookup(&self, id: &str) -> Option<BlockDevice> {
        self.by_path(Path::new(id))
            .or_else(|| self.by_uuid(id))
            .or_else(|| self.by_label(id))
    }
}

/// Block devices discovered through sysfs and /dev/disk symlinks.
pub struct SysBlockDevices {
    dev_dir: PathBuf,
    sys_block_dir: PathBuf,
    by_uuid_dir: PathBuf,
    by_label_dir: PathBuf,
    devices: Vec<BlockDevice>,
}

impl SysBlockDevices {
    /// Create a scanner over the standard system paths.
    pub fn new() -> Self {
        Self::with_roots(
            PathBuf::from("/dev"),
            PathBuf::from("/sys/class/block"),
            PathBuf::from("/dev/disk/by-uuid"),
            PathBuf::from("/dev/disk/by-label"),
        )
    }

    /// Create a scanner over explicit directories.
    pub fn with_roots(
        dev_dir: PathBuf,
        sys_block_dir: PathBuf,
        by_uuid_dir: PathBuf,
        by_label_dir: PathBuf,
    ) -> Self {
        Self {
            dev_dir,
            sys_block_dir,
            by_uuid_dir,
            by_label_dir,
            devices: Vec::new(),
        }
    }

    /// Resolve an identification symlink to a device node.
    fn resolve_link(dir: &Path, name: &str) -> Option<BlockDevice> {
        let link = dir.join(name);
        let path = fs::canonicalize(&link).ok()?;
        Some(BlockDevice { path, fstype: None })
    }
}

impl Default for SysBlockDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockDevices for SysBlockDevices {
    fn probe(&mut self) {
        self.devices.clear();

        let entries = match fs::read_dir(&self.sys_block_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %self.sys_block_dir.display(), error = %e, "Cannot scan block devices");
                return;
            }
        };

        for entry in entries.flatten() {
            let node = self.dev_dir.join(entry.file_name());
            if node.exists() {
                self.devices.push(BlockDevice {
                    path: node,
                    fstype: None,
                });
            }
        }
        debug!(count = self.devices.len(), "Probed block devices");
    }

    fn by_path(&self, path: &Path) -> Option<BlockDevice> {
        self.devices.iter().find(|d| d.path == path).cloned()
    }

    fn by_uuid(&self, uuid: &str) -> Option<BlockDevice> {
        Self::resolve_link(&self.by_uuid_dir, uuid)
    }

    fn by_label(&self, label: &str) -> Option<BlockDevice> {
        Self::resolve_link(&self.by_label_dir, label)
    }
}
