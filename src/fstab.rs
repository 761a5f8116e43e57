//! Mount-table parser for fstab/mtab style files.
//!
//! Each line describes one filesystem: `device path fstype options
//! dump-frequency check-pass`, whitespace separated, with `#` starting a
//! comment that runs to the end of the line. Every field carries a byte
//! bound; a field that would exceed its bound invalidates the whole line
//! rather than being truncated, so a garbled record can never reach the
//! mount table. A line is accepted only when its final field is present
//! and is a single printable character.

use crate::error::{Error, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Conventional location of the filesystem table.
pub const FSTAB_PATH: &str = "/etc/fstab";

/// Conventional location of the mounted-filesystem table.
pub const MTAB_PATH: &str = "/etc/mtab";

/// Byte bound for the device field.
const DEVICE_MAX: usize = 4096;
/// Byte bound for the mount path field.
const PATH_MAX: usize = 4096;
/// Byte bound for the filesystem type field.
const FSTYPE_MAX: usize = 2048;
/// Byte bound for the options field.
const OPTIONS_MAX: usize = 4096;

/// One parsed record of a mount-table file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEntry {
    /// Device or pseudo-filesystem name
    pub device: String,
    /// Mount path
    pub path: PathBuf,
    /// Filesystem type
    pub fstype: String,
    /// Mount options, comma separated
    pub options: String,
    /// Dump frequency field
    pub dump_frequency: char,
    /// Fsck pass field
    pub pass: char,
}

impl FsEntry {
    /// Create an entry with the conventional trailing-field defaults.
    pub fn new(device: &str, path: impl Into<PathBuf>, fstype: &str, options: &str) -> Self {
        Self {
            device: device.to_string(),
            path: path.into(),
            fstype: fstype.to_string(),
            options: options.to_string(),
            dump_frequency: '0',
            pass: '0',
        }
    }
}

/// Copy a field if it fits within `max` bytes.
fn bounded(token: &str, max: usize) -> Option<String> {
    if token.len() > max {
        None
    } else {
        Some(token.to_string())
    }
}

/// The trailing fields are single significant characters.
fn single_char(token: &str) -> Option<char> {
    let mut chars = token.chars();
    let ch = chars.next()?;
    if chars.next().is_some() || !ch.is_ascii_graphic() {
        return None;
    }
    Some(ch)
}

/// Parse one table line into an entry, or reject the whole line.
fn parse_line(raw: &str) -> Option<FsEntry> {
    let line = match raw.find('#') {
        Some(pos) => &raw[..pos],
        None => raw,
    };

    let mut fields = line.split_whitespace();
    let device = bounded(fields.next()?, DEVICE_MAX)?;
    let path = bounded(fields.next()?, PATH_MAX)?;
    let fstype = bounded(fields.next()?, FSTYPE_MAX)?;
    let options = bounded(fields.next()?, OPTIONS_MAX)?;
    let dump_frequency = single_char(fields.next()?)?;
    let pass = single_char(fields.next()?)?;

    Some(FsEntry {
        device,
        path: PathBuf::from(path),
        fstype,
        options,
        dump_frequency,
        pass,
    })
}

/// Parse a mount-table file into a fresh list of entries.
///
/// Malformed lines are dropped, not errors; a partial table is a valid
/// table. Entry order equals file order. A missing or unreadable file is
/// reported as [`Error::TableRead`].
pub fn parse_table(path: &Path) -> Result<Vec<FsEntry>> {
    let file = File::open(path).map_err(|source| Error::TableRead {
        path: path.to_path_buf(),
        source,
    })?;

    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|source| Error::TableRead {
            path: path.to_path_buf(),
            source,
        })?;
        match parse_line(&line) {
            Some(entry) => entries.push(entry),
            None => {
                if !line.trim().is_empty() && !line.trim_start().starts_with('#') {
                    debug!(line = %line.trim(), "Dropped malformed table line");
                }
            }
        }
    }
    Ok(entries)
}

/// Parse the filesystem table at its conventional location.
pub fn parse_fstab() -> Result<Vec<FsEntry>> {
    parse_table(Path::new(FSTAB_PATH))
}

/// Parse the mounted-filesystem table at its conventional location.
pub fn parse_mtab() -> Result<Vec<FsEntry>> {
    parse_table(Path::new(MTAB_PATH))
}
