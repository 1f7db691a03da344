//! # Shared Data Structures and Probe Logic (eBPF ↔ Userspace)
//!
//! Defines the records exchanged between the kernel-side probes and userspace,
//! the attachment-time configuration baked into the eBPF object, and the probe
//! logic itself. All shared types use `#[repr(C)]` for a consistent memory
//! layout across the kernel/userspace boundary.
//!
//! The probe logic in [`probe`] is written against small traits
//! ([`probe::ProbeEnv`], [`probe::CorrelationStore`], [`probe::EventOutput`]) so
//! that the exact code compiled into the eBPF object can also be driven by a
//! simulated target in userspace tests.
//!
//! ## Key Types
//!
//! - [`QueryEvent`] - Finished query record passed via the ring buffer
//! - [`PendingQuery`] - Correlation record stored between start and completion
//! - [`ProbeConfig`] - Attachment-time constants (threshold, layout offsets, USDT argument)
//! - [`UsdtArg`] - Location of a USDT probe argument

#![cfg_attr(not(test), no_std)]

pub mod probe;
pub mod slots;
pub mod usdt;

pub use usdt::UsdtArg;

// ============================================================================
// Sizing Constants
// ============================================================================

/// Capacity of the query text buffer, terminator included
///
/// The buffer stores at most `QUERY_CAPACITY - 1` bytes of text followed by a
/// NUL byte, mirroring `bpf_probe_read_user_str` semantics.
pub const QUERY_CAPACITY: usize = 256;

/// Default ring buffer size in pages
pub const DEFAULT_RING_PAGES: u32 = 64;

/// Page size assumed when sizing the ring buffer
pub const PAGE_SIZE: u32 = 4096;

/// Maximum number of in-flight queries tracked at once
///
/// The kernel map is an LRU hash, so the least recently touched records are
/// evicted when a target runs more concurrent threads than this.
pub const INFLIGHT_CAPACITY: u32 = 10240;

// ============================================================================
// Probe Statistics Indices
// ============================================================================

/// Events written to the ring buffer
pub const STAT_EMITTED: u32 = 0;

/// Completions discarded by the latency threshold
pub const STAT_FILTERED: u32 = 1;

/// Completions without a matching start record
pub const STAT_MISSED: u32 = 2;

/// Events lost because the ring buffer was full
pub const STAT_DROPPED: u32 = 3;

/// Failed reads of target memory (argument, length or text)
pub const STAT_READ_ERRORS: u32 = 4;

/// Number of entries in the `STATS` per-CPU array
pub const STAT_COUNT: u32 = 5;

// ============================================================================
// Shared Data Structures
// ============================================================================

/// Finished query sent from eBPF to userspace via ring buffer
///
/// **Memory Layout**: `#[repr(C)]`, 288 bytes, no implicit padding.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct QueryEvent {
    /// Start of the query in nanoseconds (`bpf_ktime_get_ns()`, monotonic since boot)
    pub timestamp_ns: u64,

    /// Completion time minus start time
    pub elapsed_ns: u64,

    /// Query length as reported by the target
    ///
    /// For the USDT path the target reports no length, so this is the measured
    /// text length, with `QUERY_CAPACITY` as a lower bound when truncated.
    pub query_len: u64,

    /// Query text, NUL-terminated inside the buffer
    pub query: [u8; QUERY_CAPACITY],

    /// 1 if the text did not fit in `query`
    pub truncated: u8,

    /// Padding for 8-byte alignment
    #[allow(clippy::pub_underscore_fields)]
    pub _padding: [u8; 7],
}

impl QueryEvent {
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            timestamp_ns: 0,
            elapsed_ns: 0,
            query_len: 0,
            query: [0u8; QUERY_CAPACITY],
            truncated: 0,
            _padding: [0u8; 7],
        }
    }

    /// Text bytes up to (not including) the first NUL
    #[must_use]
    pub fn text(&self) -> &[u8] {
        let end = self.query.iter().position(|&b| b == 0).unwrap_or(QUERY_CAPACITY);
        &self.query[..end]
    }

    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.truncated != 0
    }
}

/// Correlation record kept between the start and completion probes
///
/// Keyed by thread id in the `INFLIGHT` map. The embedded event is filled in
/// place so completion can emit it without another copy.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PendingQuery {
    pub event: QueryEvent,

    /// Address of the query text in the target (USDT path, read at completion)
    pub query_addr: u64,
}

impl PendingQuery {
    #[must_use]
    pub const fn zeroed() -> Self {
        Self { event: QueryEvent::zeroed(), query_addr: 0 }
    }

    /// Start timestamp of the query this record tracks
    #[must_use]
    pub fn started_ns(&self) -> u64 {
        self.event.timestamp_ns
    }
}

/// Attachment-time constants, stored in the read-only `PROBE_CONFIG` global
///
/// Set by userspace with `EbpfLoader::set_global` before the programs are
/// loaded; the probes never see a different value for the life of the object.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ProbeConfig {
    /// Minimum latency for a query to be emitted
    pub threshold_ns: u64,

    /// Offset of the query text pointer inside `THD` (uprobe path)
    pub query_ptr_offset: u64,

    /// Offset of the query length inside `THD` (uprobe path)
    pub query_len_offset: u64,

    /// Records older than this never complete, 0 for no limit
    pub stale_after_ns: u64,

    /// Location of the query argument of `query__exec__start` (USDT path)
    pub query_arg: UsdtArg,
}

impl ProbeConfig {
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            threshold_ns: 0,
            query_ptr_offset: 0,
            query_len_offset: 0,
            stale_after_ns: 0,
            query_arg: UsdtArg::zeroed(),
        }
    }
}

/// Whether a text of `text_len` bytes (terminator excluded) overflows the buffer
///
/// Shared by both probe pairs: the buffer holds `QUERY_CAPACITY - 1` text bytes.
#[inline(always)]
#[must_use]
pub fn is_truncated(text_len: u64) -> bool {
    text_len >= QUERY_CAPACITY as u64
}

/// Whether a record started at `started_ns` is older than `max_age_ns` at `now_ns`
#[inline]
#[must_use]
pub fn is_stale(started_ns: u64, now_ns: u64, max_age_ns: u64) -> bool {
    now_ns.saturating_sub(started_ns) > max_age_ns
}

#[cfg(feature = "user")]
use aya::Pod;

// These unsafe impls are required for eBPF <-> userspace communication
// Pod trait ensures types can be safely transmitted as plain bytes
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for QueryEvent {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for PendingQuery {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for ProbeConfig {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for UsdtArg {}
