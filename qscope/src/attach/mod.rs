//! # Attachment Strategy
//!
//! Turns a [`TraceConfig`] into a running probe pair in two steps:
//!
//! 1. [`plan()`] inspects the target binary (and, for uprobes, its version)
//!    and decides every probe site. It touches nothing in the kernel, so
//!    configuration and version errors surface before anything is attached.
//! 2. [`attach()`] loads the eBPF object with the plan's constants and
//!    attaches exactly one probe pair.
//!
//! ## Modes
//!
//! - **USDT**: `mysql:query__exec__start` / `mysql:query__exec__done` from the
//!   `.note.stapsdt` notes; argument #1 of the start probe is the query text
//! - **Uprobe**: entry and return of every `mysql_execute_command` symbol; the
//!   query is read from the `THD` at offsets chosen by server version

pub mod ebpf_setup;
pub mod symbols;
pub mod usdt;

use aya::maps::{HashMap, MapData, RingBuf};
use aya::Ebpf;
use log::info;
use object::Object as _;

use crate::config::{AttachMode, TraceConfig};
use crate::domain::TracerError;
use crate::events::diagnostics::ProbeStats;
use crate::layout::{LayoutEntry, ServerVersion};
use crate::version::{parse_version, VersionSource};
use ebpf_setup::{attach_uprobe, init_ebpf_logger, load_ebpf_program};
use qscope_common::{PendingQuery, ProbeConfig, UsdtArg};
use symbols::FunctionSite;
use usdt::{Arch, Semaphore, UsdtSite};

pub use symbols::{matching_sites, SymbolFilter};

const USDT_PROVIDER: &str = "mysql";
const USDT_START: &str = "query__exec__start";
const USDT_DONE: &str = "query__exec__done";

/// Probe sites for the static tracepoint pair
#[derive(Debug, Clone)]
pub struct UsdtPlan {
    pub start: UsdtSite,
    pub done: UsdtSite,
    /// Location of the query text argument at `start`
    pub query_arg: UsdtArg,
}

/// Probe sites for the dynamic function pair
#[derive(Debug, Clone)]
pub struct DynamicPlan {
    pub version: ServerVersion,
    pub layout: LayoutEntry,
    pub functions: Vec<FunctionSite>,
}

/// Everything decided about the target before touching the kernel
#[derive(Debug, Clone)]
pub enum AttachPlan {
    Static(UsdtPlan),
    Dynamic(DynamicPlan),
}

impl AttachPlan {
    /// Attachment-time constants for the probes
    ///
    /// `stale_after_ns` of 0 lets in-flight records match at any age.
    #[must_use]
    pub fn probe_config(&self, threshold_ns: u64, stale_after_ns: u64) -> ProbeConfig {
        let mut config = ProbeConfig::zeroed();
        config.threshold_ns = threshold_ns;
        config.stale_after_ns = stale_after_ns;
        match self {
            Self::Static(plan) => config.query_arg = plan.query_arg,
            Self::Dynamic(plan) => {
                config.query_ptr_offset = plan.layout.query_ptr_offset;
                config.query_len_offset = plan.layout.query_len_offset;
            }
        }
        config
    }

    /// Number of uprobes [`attach()`] will create
    #[must_use]
    pub fn probe_count(&self) -> usize {
        match self {
            Self::Static(_) => 2,
            Self::Dynamic(plan) => plan.functions.len() * 2,
        }
    }
}

/// Inspect the target and decide every probe site
///
/// # Errors
/// - `TracerError::UnsupportedVersion` if uprobe mode finds no layout for the server version
/// - `TracerError::Attachment` if the probe sites are missing from the binary
/// - `TracerError::Io` if the binary cannot be read
pub fn plan(config: &TraceConfig, versions: &dyn VersionSource) -> Result<AttachPlan, TracerError> {
    let target = config.target_display();

    // Version first: an unknown layout must fail before the binary is even parsed
    let version = match config.mode {
        AttachMode::Uprobe => {
            let line = versions.detect(&config.target_path)?;
            let version = parse_version(&line)?;
            info!("MySQL version: {version}");
            Some(version)
        }
        AttachMode::Usdt => None,
    };

    let data = std::fs::read(&config.target_path)?;
    let obj = object::File::parse(&*data)
        .map_err(|e| TracerError::attachment(&target, format!("not an ELF binary: {e}")))?;

    match version {
        None => plan_static(&obj, &target).map(AttachPlan::Static),
        Some(version) => {
            let filter = SymbolFilter::execute_command()?;
            let functions = matching_sites(&obj, &filter);
            if functions.is_empty() {
                return Err(TracerError::attachment(
                    &target,
                    format!("no symbols matching {}", filter.source()),
                ));
            }
            Ok(AttachPlan::Dynamic(DynamicPlan { version, layout: *version.layout(), functions }))
        }
    }
}

fn plan_static(obj: &object::File<'_>, target: &str) -> Result<UsdtPlan, TracerError> {
    let probes = usdt::probes_in(obj, target)?;
    let start = usdt::find_site(obj, &probes, USDT_PROVIDER, USDT_START, target)?;
    let done = usdt::find_site(obj, &probes, USDT_PROVIDER, USDT_DONE, target)?;

    let arch = Arch::of(obj).ok_or_else(|| {
        TracerError::attachment(target, format!("USDT arguments on {:?}", obj.architecture()))
    })?;
    let spec = start.probe.arg(1).ok_or_else(|| {
        TracerError::attachment(target, format!("{USDT_PROVIDER}:{USDT_START} has no arguments"))
    })?;
    let query_arg = usdt::parse_arg_spec(spec, arch)?;

    Ok(UsdtPlan { start, done, query_arg })
}

/// A loaded eBPF object with one probe pair attached
///
/// Dropping it detaches the probes and restores USDT semaphores.
pub struct AttachedTracer {
    bpf: Ebpf,
    // Released after `bpf`, once the probes are detached
    _semaphores: Vec<Semaphore>,
}

/// Load the probes and attach the planned pair
///
/// # Errors
/// Returns an error if loading fails or the kernel refuses any probe
pub fn attach(config: &TraceConfig, plan: &AttachPlan) -> Result<AttachedTracer, TracerError> {
    let probe_config = plan.probe_config(config.threshold_ns, config.stale_after_ns());
    let mut bpf = load_ebpf_program(&probe_config, config.ring_bytes())?;
    init_ebpf_logger(&mut bpf);

    let target = config.target_path.as_path();
    let pid = config.target_pid;
    let mut semaphores = Vec::new();

    match plan {
        AttachPlan::Static(usdt) => {
            attach_uprobe(&mut bpf, "query_exec_start", target, usdt.start.file_offset, pid)?;
            attach_uprobe(&mut bpf, "query_exec_done", target, usdt.done.file_offset, pid)?;

            let mut offsets: Vec<u64> =
                [&usdt.start, &usdt.done].iter().filter_map(|s| s.semaphore_offset).collect();
            offsets.dedup();
            for offset in offsets {
                semaphores.push(Semaphore::enable(pid, target, offset)?);
            }
        }
        AttachPlan::Dynamic(dynamic) => {
            for site in &dynamic.functions {
                attach_uprobe(&mut bpf, "execute_command_entry", target, site.file_offset, pid)?;
                attach_uprobe(&mut bpf, "execute_command_return", target, site.file_offset, pid)?;
                info!("✓ Hooked {}", site.name);
            }
        }
    }

    Ok(AttachedTracer { bpf, _semaphores: semaphores })
}

impl AttachedTracer {
    /// The event channel consumer side
    ///
    /// # Errors
    /// Returns an error if the map was already taken
    pub fn take_events(&mut self) -> Result<RingBuf<MapData>, TracerError> {
        let map = self.bpf.take_map("EVENTS").ok_or_else(|| missing_map("EVENTS"))?;
        Ok(RingBuf::try_from(map)?)
    }

    /// The in-flight query map, for sweeping stale records
    ///
    /// # Errors
    /// Returns an error if the map was already taken
    pub fn take_inflight(&mut self) -> Result<HashMap<MapData, u32, PendingQuery>, TracerError> {
        let map = self.bpf.take_map("INFLIGHT").ok_or_else(|| missing_map("INFLIGHT"))?;
        Ok(HashMap::try_from(map)?)
    }

    /// Probe outcome counters summed over CPUs
    ///
    /// # Errors
    /// Returns an error if the `STATS` map cannot be read
    pub fn probe_stats(&self) -> Result<ProbeStats, TracerError> {
        ProbeStats::read(&self.bpf)
    }
}

fn missing_map(name: &str) -> TracerError {
    TracerError::Map(aya::maps::MapError::InvalidName { name: name.to_string() })
}
