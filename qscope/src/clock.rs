//! Clocks matching the kernel's timestamps
//!
//! Probes stamp events with `bpf_ktime_get_ns()`, i.e. `CLOCK_MONOTONIC`.
//! Userspace reads the same clock to age in-flight records, and the offset
//! to `CLOCK_REALTIME` to print wall-clock times.

#![allow(unsafe_code)] // clock_gettime() requires unsafe

const NS_PER_SEC: u64 = 1_000_000_000;

#[allow(clippy::cast_sign_loss)]
fn read_clock(clock: libc::clockid_t) -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // Cannot fail for the clocks used here
    unsafe { libc::clock_gettime(clock, &mut ts) };
    ts.tv_sec as u64 * NS_PER_SEC + ts.tv_nsec as u64
}

/// Nanoseconds on the clock used by `bpf_ktime_get_ns()`
#[must_use]
pub fn monotonic_ns() -> u64 {
    read_clock(libc::CLOCK_MONOTONIC)
}

/// Nanoseconds since the Unix epoch
#[must_use]
pub fn realtime_ns() -> u64 {
    read_clock(libc::CLOCK_REALTIME)
}

/// Converts monotonic timestamps to Unix epoch time
///
/// The offset is sampled once; later clock adjustments are not followed.
#[derive(Debug, Clone, Copy)]
pub struct WallClock {
    offset_ns: u64,
}

impl WallClock {
    #[must_use]
    pub fn now() -> Self {
        Self::with_offset(realtime_ns().saturating_sub(monotonic_ns()))
    }

    #[must_use]
    pub const fn with_offset(offset_ns: u64) -> Self {
        Self { offset_ns }
    }

    /// Epoch nanoseconds of a monotonic timestamp
    #[must_use]
    pub fn epoch_ns(&self, monotonic_ns: u64) -> u64 {
        monotonic_ns + self.offset_ns
    }
}

/// `secs.micros` rendering of epoch nanoseconds
#[must_use]
pub fn format_epoch(epoch_ns: u64) -> String {
    format!("{}.{:06}", epoch_ns / NS_PER_SEC, (epoch_ns % NS_PER_SEC) / 1_000)
}
