//! Probe outcome counters
//!
//! The probes count what happened to every completion in the per-CPU `STATS`
//! array; nothing else reports dropped or unmatched queries.

use aya::maps::PerCpuArray;
use aya::Ebpf;
use std::fmt;

use crate::domain::TracerError;
use qscope_common::{STAT_DROPPED, STAT_EMITTED, STAT_FILTERED, STAT_MISSED, STAT_READ_ERRORS};

/// Counters summed over all CPUs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeStats {
    pub emitted: u64,
    pub filtered: u64,
    pub missed: u64,
    pub dropped: u64,
    pub read_errors: u64,
}

impl ProbeStats {
    /// Read and sum the `STATS` map
    ///
    /// # Errors
    /// Returns an error if the map is missing or unreadable
    pub fn read(bpf: &Ebpf) -> Result<Self, TracerError> {
        let stats: PerCpuArray<_, u64> = PerCpuArray::try_from(
            bpf.map("STATS")
                .ok_or_else(|| aya::maps::MapError::InvalidName { name: "STATS".to_string() })?,
        )?;

        let sum = |index: u32| -> Result<u64, TracerError> {
            Ok(stats.get(&index, 0)?.iter().sum())
        };

        Ok(Self {
            emitted: sum(STAT_EMITTED)?,
            filtered: sum(STAT_FILTERED)?,
            missed: sum(STAT_MISSED)?,
            dropped: sum(STAT_DROPPED)?,
            read_errors: sum(STAT_READ_ERRORS)?,
        })
    }

    /// Completions seen by the probes
    #[must_use]
    pub fn completions(&self) -> u64 {
        self.emitted + self.filtered + self.missed + self.dropped
    }
}

impl fmt::Display for ProbeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "emitted: {}, filtered: {}, missed: {}, dropped: {}, read_errors: {}",
            self.emitted, self.filtered, self.missed, self.dropped, self.read_errors
        )
    }
}
