//! # Simulated Target
//!
//! Runs the probe logic that is compiled into the eBPF object against an
//! in-process stand-in for the traced server: fake user memory, a register
//! file, a settable clock and thread id. [`SimTracer`] wires a probe pair to
//! a [`SlotTable`] correlation store and a recording event channel whose
//! records decode exactly like ring buffer records.
//!
//! ```
//! use qscope::sim::SimTracer;
//! use qscope_common::probe::StaticTracepointProbe;
//!
//! let mut tracer = SimTracer::new(StaticTracepointProbe::new(0));
//! let query = tracer.target.alloc_str("SELECT 1");
//! tracer.start(7, query).unwrap();
//! tracer.target.advance(1_000);
//! tracer.complete(7);
//! assert_eq!(tracer.take_records().len(), 1);
//! ```

use crate::events::decoder::encode;
use crate::layout::LayoutEntry;
use qscope_common::probe::{Completion, EventOutput, ProbeEnv, ProbePair, Started};
use qscope_common::slots::SlotTable;
use qscope_common::{PendingQuery, QueryEvent, UsdtArg, QUERY_CAPACITY};

/// Address of the first byte of simulated user memory
pub const SIM_BASE: u64 = 0x7f00_0000_0000;

/// Correlation slots of a simulated tracer
pub const SIM_SLOTS: usize = 64;

/// `struct pt_regs` is at most 272 bytes on the supported architectures
const REGISTER_SLOTS: usize = 34;

const EFAULT: i64 = 14;
const ENOSPC: i64 = 28;

/// The traced process, as seen from a probe
pub struct SimTarget {
    memory: Vec<u8>,
    registers: [u64; REGISTER_SLOTS],
    now_ns: u64,
    thread: u32,
}

impl Default for SimTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl SimTarget {
    #[must_use]
    pub fn new() -> Self {
        Self { memory: Vec::new(), registers: [0; REGISTER_SLOTS], now_ns: 1_000_000, thread: 1 }
    }

    /// Copy `bytes` into user memory and return their address (8-byte aligned)
    pub fn alloc(&mut self, bytes: &[u8]) -> u64 {
        let padded = self.memory.len().next_multiple_of(8);
        self.memory.resize(padded, 0);
        let addr = SIM_BASE + padded as u64;
        self.memory.extend_from_slice(bytes);
        addr
    }

    /// Store a NUL-terminated string
    pub fn alloc_str(&mut self, text: &str) -> u64 {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        self.alloc(&bytes)
    }

    /// Store a connection object holding `query_addr` and `reported_len` at the
    /// offsets of `layout`
    pub fn alloc_thd(&mut self, layout: &LayoutEntry, query_addr: u64, reported_len: u64) -> u64 {
        let ptr_at = usize::try_from(layout.query_ptr_offset).unwrap_or(0);
        let len_at = usize::try_from(layout.query_len_offset).unwrap_or(0);
        let mut thd = vec![0u8; ptr_at.max(len_at) + 8];
        thd[ptr_at..ptr_at + 8].copy_from_slice(&query_addr.to_ne_bytes());
        thd[len_at..len_at + 8].copy_from_slice(&reported_len.to_ne_bytes());
        self.alloc(&thd)
    }

    /// Store `query` and a connection object pointing at it with its exact length
    pub fn alloc_query_thd(&mut self, layout: &LayoutEntry, query: &str) -> u64 {
        let text = self.alloc_str(query);
        self.alloc_thd(layout, text, query.len() as u64)
    }

    /// Set the saved register at byte `offset` of `struct pt_regs`
    pub fn set_register(&mut self, offset: u32, value: u64) {
        if let Some(slot) = self.registers.get_mut(offset as usize / 8) {
            *slot = value;
        }
    }

    pub fn set_thread(&mut self, tid: u32) {
        self.thread = tid;
    }

    pub fn advance(&mut self, ns: u64) {
        self.now_ns += ns;
    }

    fn bytes(&self, addr: u64, len: usize) -> Result<&[u8], i64> {
        let start = addr.checked_sub(SIM_BASE).ok_or(-EFAULT)?;
        let start = usize::try_from(start).map_err(|_| -EFAULT)?;
        self.memory.get(start..start.checked_add(len).ok_or(-EFAULT)?).ok_or(-EFAULT)
    }
}

impl ProbeEnv for SimTarget {
    fn now_ns(&self) -> u64 {
        self.now_ns
    }

    fn context_id(&self) -> u32 {
        self.thread
    }

    fn read_register(&self, offset: u32) -> Result<u64, i64> {
        if offset % 8 != 0 {
            return Err(-EFAULT);
        }
        self.registers.get(offset as usize / 8).copied().ok_or(-EFAULT)
    }

    fn read_user_u64(&self, addr: u64) -> Result<u64, i64> {
        let bytes = self.bytes(addr, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_ne_bytes(raw))
    }

    fn read_user_u8(&self, addr: u64) -> Result<u8, i64> {
        Ok(self.bytes(addr, 1)?[0])
    }

    fn read_user_str(&self, addr: u64, dst: &mut [u8; QUERY_CAPACITY]) -> Result<usize, i64> {
        let mut copied = 0;
        while copied < QUERY_CAPACITY - 1 {
            let byte = self.read_user_u8(addr + copied as u64)?;
            if byte == 0 {
                break;
            }
            dst[copied] = byte;
            copied += 1;
        }
        dst[copied] = 0;
        Ok(copied + 1)
    }
}

/// Event channel that keeps every record, optionally with a fixed capacity
#[derive(Default)]
pub struct RecordingOutput {
    records: Vec<Vec<u8>>,
    capacity: Option<usize>,
}

impl EventOutput for RecordingOutput {
    fn output(&mut self, event: &QueryEvent) -> Result<(), i64> {
        if self.capacity.is_some_and(|cap| self.records.len() >= cap) {
            return Err(-ENOSPC);
        }
        self.records.push(encode(event));
        Ok(())
    }
}

/// A probe pair attached to a [`SimTarget`]
pub struct SimTracer<P: ProbePair> {
    pub target: SimTarget,
    probe: P,
    store: SlotTable<SIM_SLOTS>,
    output: RecordingOutput,
    scratch: PendingQuery,
}

impl<P: ProbePair> SimTracer<P> {
    pub fn new(probe: P) -> Self {
        Self {
            target: SimTarget::new(),
            probe,
            store: SlotTable::new(),
            output: RecordingOutput::default(),
            scratch: PendingQuery::zeroed(),
        }
    }

    /// Limit the event channel to `records` unread records
    #[must_use]
    pub fn with_channel_capacity(mut self, records: usize) -> Self {
        self.output.capacity = Some(records);
        self
    }

    /// Fire the start probe on thread `tid` with the probe argument `arg`
    ///
    /// # Errors
    /// Negative errno of a failed store insert
    pub fn start(&mut self, tid: u32, arg: u64) -> Result<Started, i64> {
        self.target.set_thread(tid);
        self.probe.on_start(&self.target, &mut self.store, &mut self.scratch, arg)
    }

    /// Fire the start probe, resolving its argument from registers and memory
    ///
    /// # Errors
    /// Negative errno of a failed argument read or store insert
    pub fn start_with_arg(&mut self, tid: u32, arg: &UsdtArg) -> Result<Started, i64> {
        self.target.set_thread(tid);
        let value = arg.resolve(&self.target)?;
        self.start(tid, value)
    }

    /// Fire the completion probe on thread `tid`
    pub fn complete(&mut self, tid: u32) -> Completion {
        self.target.set_thread(tid);
        self.probe.on_completion(&self.target, &mut self.store, &mut self.output)
    }

    /// Records waiting for their completion
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.store.len()
    }

    /// Drop in-flight records older than `max_age_ns`
    pub fn evict_stale(&mut self, max_age_ns: u64) -> usize {
        self.store.evict_stale(self.target.now_ns(), max_age_ns)
    }

    /// Consume the records emitted so far
    pub fn take_records(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.output.records)
    }
}
