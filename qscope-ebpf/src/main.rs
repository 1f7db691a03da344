//! # eBPF Kernel-Side Instrumentation
//!
//! Probe programs that run on the target's threads to time each query.
//!
//! ## Programs
//!
//! - **USDT** (attached as uprobes at note addresses):
//!   `query_exec_start` / `query_exec_done` on `mysql:query__exec__{start,done}`
//! - **Uprobe / Uretprobe**: `execute_command_entry` / `execute_command_return`
//!   on every `mysql_execute_command` symbol
//!
//! Only one pair is attached per run. The probe logic lives in
//! `qscope_common::probe`; this file binds it to maps and helpers.
//!
//! ## Maps (Shared with Userspace)
//!
//! - `EVENTS` - Ring buffer of finished queries (resized at load time)
//! - `INFLIGHT` - Thread id → query started on that thread
//! - `SCRATCH` - Per-CPU record under construction (keeps it off the stack)
//! - `STATS` - Per-CPU outcome counters
//!
//! ## Build
//!
//! Always compiled in release mode:
//! ```bash
//! cargo xtask build-ebpf
//! ```

#![no_std]
#![no_main]
#![allow(unused_unsafe)]

use core::ffi::c_void;

use aya_ebpf::{
    helpers::{
        bpf_get_current_pid_tgid, bpf_ktime_get_ns, bpf_probe_read_kernel, bpf_probe_read_user,
        gen,
    },
    macros::{map, uprobe, uretprobe},
    maps::{LruHashMap, PerCpuArray, RingBuf},
    programs::{ProbeContext, RetProbeContext},
    EbpfContext,
};
use aya_log_ebpf::warn;
use qscope_common::{
    probe::{
        Completion, CorrelationStore, DynamicFunctionProbe, EventOutput, ProbeEnv, ProbePair,
        QueryOffsets, Started, StaticTracepointProbe,
    },
    PendingQuery, ProbeConfig, QueryEvent, DEFAULT_RING_PAGES, INFLIGHT_CAPACITY, PAGE_SIZE,
    QUERY_CAPACITY, STAT_COUNT, STAT_DROPPED, STAT_EMITTED, STAT_FILTERED, STAT_MISSED,
    STAT_READ_ERRORS,
};

// ============================================================================
// Attachment-time constants
// ============================================================================

/// Threshold, `THD` offsets and USDT argument location
///
/// Rewritten by userspace through `EbpfLoader::set_global` before load.
#[no_mangle]
static PROBE_CONFIG: ProbeConfig = ProbeConfig::zeroed();

#[inline(always)]
fn probe_config() -> ProbeConfig {
    unsafe { core::ptr::read_volatile(&PROBE_CONFIG) }
}

// ============================================================================
// eBPF Maps
// ============================================================================

/// Finished queries for userspace
///
/// - **Size**: 64 pages by default, overridden with `set_max_entries`
/// - **Overflow**: `output()` fails and the event is counted as dropped
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(DEFAULT_RING_PAGES * PAGE_SIZE, 0);

/// Map: Thread ID (TID) → query in flight on that thread
///
/// LRU so that queries which never complete (target crashed mid-query,
/// attached mid-query) cannot fill the map; userspace also sweeps old entries.
#[map]
static INFLIGHT: LruHashMap<u32, PendingQuery> =
    LruHashMap::with_max_entries(INFLIGHT_CAPACITY, 0);

/// Working record for start probes (one per CPU, too large for the BPF stack)
#[map]
static SCRATCH: PerCpuArray<PendingQuery> = PerCpuArray::with_max_entries(1, 0);

/// Outcome counters, indexed by `STAT_*`
#[map]
static STATS: PerCpuArray<u64> = PerCpuArray::with_max_entries(STAT_COUNT, 0);

// ============================================================================
// Bindings of the probe traits
// ============================================================================

/// Clock, thread id, registers and user memory of the probed thread
struct KernelEnv<'a, C: EbpfContext> {
    ctx: &'a C,
}

impl<C: EbpfContext> ProbeEnv for KernelEnv<'_, C> {
    #[inline(always)]
    fn now_ns(&self) -> u64 {
        unsafe { bpf_ktime_get_ns() }
    }

    #[inline(always)]
    fn context_id(&self) -> u32 {
        // Lower 32 bits are the thread id
        unsafe { bpf_get_current_pid_tgid() as u32 }
    }

    #[inline(always)]
    fn read_register(&self, offset: u32) -> Result<u64, i64> {
        // The context of a uprobe is the saved pt_regs
        let regs = self.ctx.as_ptr() as *const u8;
        unsafe { bpf_probe_read_kernel(regs.add(offset as usize) as *const u64) }
    }

    #[inline(always)]
    fn read_user_u64(&self, addr: u64) -> Result<u64, i64> {
        unsafe { bpf_probe_read_user(addr as *const u64) }
    }

    #[inline(always)]
    fn read_user_u8(&self, addr: u64) -> Result<u8, i64> {
        unsafe { bpf_probe_read_user(addr as *const u8) }
    }

    #[inline(always)]
    fn read_user_str(&self, addr: u64, dst: &mut [u8; QUERY_CAPACITY]) -> Result<usize, i64> {
        let ret = unsafe {
            gen::bpf_probe_read_user_str(
                dst.as_mut_ptr() as *mut c_void,
                QUERY_CAPACITY as u32,
                addr as *const c_void,
            )
        };
        if ret < 0 {
            Err(ret)
        } else {
            Ok(ret as usize)
        }
    }
}

/// `INFLIGHT` as a correlation store
struct Inflight;

impl CorrelationStore for Inflight {
    #[inline(always)]
    fn insert(&mut self, key: u32, record: &PendingQuery) -> Result<(), i64> {
        unsafe { INFLIGHT.insert(&key, record, 0) }
    }

    #[inline(always)]
    fn get_mut(&mut self, key: u32) -> Option<&mut PendingQuery> {
        INFLIGHT.get_ptr_mut(&key).map(|ptr| unsafe { &mut *ptr })
    }

    #[inline(always)]
    fn remove(&mut self, key: u32) {
        let _ = unsafe { INFLIGHT.remove(&key) };
    }
}

/// `EVENTS` as the event channel producer
struct RingOutput;

impl EventOutput for RingOutput {
    #[inline(always)]
    fn output(&mut self, event: &QueryEvent) -> Result<(), i64> {
        EVENTS.output(event, 0)
    }
}

#[inline(always)]
fn bump(index: u32) {
    if let Some(counter) = STATS.get_ptr_mut(index) {
        unsafe { *counter += 1 };
    }
}

#[inline(always)]
fn scratch() -> Result<&'static mut PendingQuery, i64> {
    let ptr = SCRATCH.get_ptr_mut(0).ok_or(1i64)?;
    Ok(unsafe { &mut *ptr })
}

fn record_start(started: Started) {
    if started == Started::RecordedWithoutText {
        bump(STAT_READ_ERRORS);
    }
}

fn record_completion(outcome: Completion) {
    match outcome {
        Completion::Emitted => bump(STAT_EMITTED),
        Completion::EmittedWithoutText => {
            bump(STAT_EMITTED);
            bump(STAT_READ_ERRORS);
        }
        Completion::Filtered => bump(STAT_FILTERED),
        Completion::Missed => bump(STAT_MISSED),
        Completion::Dropped => bump(STAT_DROPPED),
    }
}

fn static_probe(config: &ProbeConfig) -> StaticTracepointProbe {
    StaticTracepointProbe::new(config.threshold_ns).with_stale_after(config.stale_after_ns)
}

fn dynamic_probe(config: &ProbeConfig) -> DynamicFunctionProbe {
    DynamicFunctionProbe::new(
        config.threshold_ns,
        QueryOffsets { query_ptr: config.query_ptr_offset, query_len: config.query_len_offset },
    )
    .with_stale_after(config.stale_after_ns)
}

// ============================================================================
// USDT: mysql:query__exec__start / mysql:query__exec__done
// ============================================================================

/// Hook: `query__exec__start(query, connection_id, db, user, host, exec_type)`
#[uprobe]
pub fn query_exec_start(ctx: ProbeContext) -> u32 {
    match try_query_exec_start(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_query_exec_start(ctx: &ProbeContext) -> Result<(), i64> {
    let config = probe_config();
    let env = KernelEnv { ctx };

    let query_addr = match config.query_arg.resolve(&env) {
        Ok(addr) => addr,
        Err(e) => {
            warn!(ctx, "cannot read query__exec__start argument: {}", e);
            bump(STAT_READ_ERRORS);
            return Err(e);
        }
    };

    let started = static_probe(&config).on_start(
        &env,
        &mut Inflight,
        scratch()?,
        query_addr,
    )?;
    record_start(started);
    Ok(())
}

/// Hook: `query__exec__done(status)`
#[uprobe]
pub fn query_exec_done(ctx: ProbeContext) -> u32 {
    let config = probe_config();
    let env = KernelEnv { ctx: &ctx };
    let outcome = static_probe(&config).on_completion(
        &env,
        &mut Inflight,
        &mut RingOutput,
    );
    record_completion(outcome);
    0
}

// ============================================================================
// Uprobe / Uretprobe: mysql_execute_command(THD *thd, ...)
// ============================================================================

/// Hook: entry of `mysql_execute_command`
#[uprobe]
pub fn execute_command_entry(ctx: ProbeContext) -> u32 {
    match try_execute_command_entry(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_execute_command_entry(ctx: &ProbeContext) -> Result<(), i64> {
    let config = probe_config();
    let env = KernelEnv { ctx };

    // First parameter (rdi / x0) is the THD*
    let thd: u64 = ctx.arg(0).ok_or(1i64)?;

    let started = dynamic_probe(&config).on_start(&env, &mut Inflight, scratch()?, thd)?;
    record_start(started);
    Ok(())
}

/// Hook: return of `mysql_execute_command`
#[uretprobe]
pub fn execute_command_return(ctx: RetProbeContext) -> u32 {
    let config = probe_config();
    let env = KernelEnv { ctx: &ctx };
    let outcome = dynamic_probe(&config).on_completion(&env, &mut Inflight, &mut RingOutput);
    record_completion(outcome);
    0
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
