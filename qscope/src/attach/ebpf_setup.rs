//! # eBPF Program Loading and Attachment
//!
//! Loads the compiled eBPF object with its attachment-time constants and
//! attaches programs to uprobe sites of the target.
//!
//! ## Functions
//!
//! - [`load_ebpf_program()`] - Load the embedded object with `PROBE_CONFIG` and ring size set
//! - [`init_ebpf_logger()`] - Forward `aya-log` records from the probes
//! - [`attach_uprobe()`] - Load a program (once) and attach it at a file offset

use aya::{include_bytes_aligned, programs::UProbe, Ebpf, EbpfLoader};
use aya_log::EbpfLogger;
use log::{info, warn};
use std::path::Path;

use crate::domain::{Pid, TracerError};
use qscope_common::ProbeConfig;

/// The eBPF object, always the release build (see xtask)
static EBPF_OBJECT: &[u8] = include_bytes_aligned!(concat!(env!("OUT_DIR"), "/qscope.bpf.o"));

/// Load the eBPF program binary
///
/// `config` is written into the read-only `PROBE_CONFIG` global and the
/// `EVENTS` ring buffer is resized to `ring_bytes` before the kernel sees
/// either.
///
/// # Errors
/// Returns an error if the object is missing from this build or the kernel rejects it
pub fn load_ebpf_program(config: &ProbeConfig, ring_bytes: u32) -> Result<Ebpf, TracerError> {
    if EBPF_OBJECT.is_empty() {
        return Err(TracerError::MissingProbeObject);
    }

    let bpf = EbpfLoader::new()
        .set_global("PROBE_CONFIG", config, true)
        .set_max_entries("EVENTS", ring_bytes)
        .load(EBPF_OBJECT)?;
    Ok(bpf)
}

/// Initialize eBPF logger
pub fn init_ebpf_logger(bpf: &mut Ebpf) {
    if let Err(e) = EbpfLogger::init(bpf) {
        warn!("Failed to initialize eBPF logger: {e}");
    }
}

/// Attach uprobe program `program` at `file_offset` of `target` for `pid`
///
/// The program is loaded into the kernel on first use; the same program can be
/// attached to many sites.
///
/// # Errors
/// Returns `TracerError::Attachment` if the program is missing or the kernel
/// refuses the probe
pub fn attach_uprobe(
    bpf: &mut Ebpf,
    program: &str,
    target: &Path,
    file_offset: u64,
    pid: Pid,
) -> Result<(), TracerError> {
    let target_name = target.display().to_string();
    let uprobe: &mut UProbe = bpf
        .program_mut(program)
        .ok_or_else(|| TracerError::attachment(&target_name, format!("{program} program not found")))?
        .try_into()?;

    if uprobe.fd().is_err() {
        uprobe.load()?;
    }

    uprobe.attach(None, file_offset, target, Some(pid.0)).map_err(|e| {
        TracerError::attachment(&target_name, format!("{program} at 0x{file_offset:x}: {e}"))
    })?;
    info!("✓ Attached {program} at {target_name}+0x{file_offset:x}");
    Ok(())
}
