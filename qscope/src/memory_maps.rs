//! Memory mapping utilities for process address space analysis
//!
//! Parses `/proc/pid/maps` to translate file offsets of the traced binary into
//! addresses in the running process. Needed to reach USDT semaphores, which
//! live in the binary's writable data.

use log::debug;
use std::fs;
use std::path::Path;

use crate::domain::{Pid, TracerError};

/// One mapping of a file into a process's address space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    /// Offset in the file of the byte mapped at `start`
    pub file_offset: u64,
    pub path: String,
}

impl MemoryMapping {
    /// Check if a file offset falls within this mapping
    #[must_use]
    pub fn contains_offset(&self, offset: u64) -> bool {
        offset >= self.file_offset && offset < self.file_offset + (self.end - self.start)
    }

    /// Address at which `offset` of the file is mapped
    #[must_use]
    pub fn address_of(&self, offset: u64) -> u64 {
        self.start + (offset - self.file_offset)
    }
}

/// Parse one line of `/proc/pid/maps`
///
/// Format: `start-end perms offset dev inode pathname`. Anonymous mappings
/// (no pathname) yield `None`.
#[must_use]
pub fn parse_maps_line(line: &str) -> Option<MemoryMapping> {
    let mut parts = line.split_whitespace();
    let (start, end) = parts.next()?.split_once('-')?;
    let _perms = parts.next()?;
    let offset = parts.next()?;
    let _dev = parts.next()?;
    let _inode = parts.next()?;
    let path = parts.collect::<Vec<_>>().join(" ");
    if path.is_empty() {
        return None;
    }

    Some(MemoryMapping {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        file_offset: u64::from_str_radix(offset, 16).ok()?,
        path,
    })
}

/// Every mapping of `binary_path` in the process
///
/// # Errors
/// Returns an error if `/proc/pid/maps` cannot be read
pub fn mappings_of(pid: Pid, binary_path: &Path) -> Result<Vec<MemoryMapping>, TracerError> {
    let maps_path = format!("/proc/{}/maps", pid.0);
    let maps = fs::read_to_string(&maps_path)?;

    // The kernel reports the resolved path
    let wanted = fs::canonicalize(binary_path).unwrap_or_else(|_| binary_path.to_path_buf());

    let mappings: Vec<_> = maps
        .lines()
        .filter_map(parse_maps_line)
        .filter(|m| Path::new(&m.path) == wanted)
        .collect();
    debug!("{} mappings of {} in {maps_path}", mappings.len(), wanted.display());
    Ok(mappings)
}

/// Runtime address of a file offset of `binary_path` inside the process
///
/// # Errors
/// Returns `TracerError::Attachment` when no mapping covers the offset
pub fn runtime_address(pid: Pid, binary_path: &Path, file_offset: u64) -> Result<u64, TracerError> {
    mappings_of(pid, binary_path)?
        .iter()
        .find(|m| m.contains_offset(file_offset))
        .map(|m| m.address_of(file_offset))
        .ok_or_else(|| {
            TracerError::attachment(
                binary_path.display().to_string(),
                format!("file offset 0x{file_offset:x} is not mapped in process {pid}"),
            )
        })
}
