//! Eviction of in-flight records that will never complete
//!
//! A start without its completion (the target crashed mid-query, or the
//! tracer attached mid-query and the thread exited) leaves a record behind.
//! The kernel map is LRU so it cannot fill, and completions already ignore
//! records past the age limit; the sweep only reclaims their slots.

use aya::maps::{HashMap, MapData, MapError};
use log::debug;
use std::time::Duration;

use crate::clock::monotonic_ns;
use qscope_common::{is_stale, PendingQuery};

/// The in-flight map as seen by the sweeper
pub trait InflightRecords {
    /// Thread id and start time of every record
    fn started(&self) -> Vec<(u32, u64)>;

    /// Start time of the record of `tid`, if there is one
    fn started_of(&self, tid: u32) -> Option<u64>;

    /// # Errors
    /// Returns an error if the record cannot be deleted
    fn remove(&mut self, tid: u32) -> Result<(), MapError>;
}

impl InflightRecords for HashMap<MapData, u32, PendingQuery> {
    fn started(&self) -> Vec<(u32, u64)> {
        self.iter().filter_map(Result::ok).map(|(tid, record)| (tid, record.started_ns())).collect()
    }

    fn started_of(&self, tid: u32) -> Option<u64> {
        self.get(&tid, 0).ok().map(|record| record.started_ns())
    }

    fn remove(&mut self, tid: u32) -> Result<(), MapError> {
        HashMap::remove(self, &tid)
    }
}

pub struct StaleSweeper<M: InflightRecords = HashMap<MapData, u32, PendingQuery>> {
    inflight: M,
    max_age_ns: u64,
    evicted: u64,
}

impl<M: InflightRecords> StaleSweeper<M> {
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(inflight: M, max_age: Duration) -> Self {
        Self { inflight, max_age_ns: max_age.as_nanos() as u64, evicted: 0 }
    }

    /// Delete every record older than the maximum age
    ///
    /// Returns the number of records deleted in this pass.
    pub fn sweep(&mut self) -> usize {
        self.sweep_at(monotonic_ns())
    }

    /// [`sweep`](Self::sweep) as of monotonic time `now`
    pub fn sweep_at(&mut self, now: u64) -> usize {
        let stale: Vec<u32> = self
            .inflight
            .started()
            .into_iter()
            .filter(|&(_, started)| is_stale(started, now, self.max_age_ns))
            .map(|(tid, _)| tid)
            .collect();

        let mut removed = 0;
        for tid in stale {
            // The thread may have started a new query since the scan
            match self.inflight.started_of(tid) {
                Some(started) if is_stale(started, now, self.max_age_ns) => {}
                _ => continue,
            }
            match self.inflight.remove(tid) {
                Ok(()) => removed += 1,
                Err(e) => debug!("could not remove in-flight query of tid {tid}: {e}"),
            }
        }

        if removed > 0 {
            debug!("swept {removed} stale in-flight queries");
        }
        self.evicted += removed as u64;
        removed
    }

    /// Records deleted over the sweeper's lifetime
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}
