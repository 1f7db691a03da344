//! # qscope - eBPF MySQL Query Latency Tracer
//!
//! qscope measures how long each query takes inside a running `mysqld`,
//! without restarting or reconfiguring the server, and prints the queries
//! slower than a threshold together with their (possibly truncated) text.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        mysqld (target)                          │
//! │   query__exec__start/done USDT  or  mysql_execute_command()     │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ uprobes / uretprobes
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     eBPF Programs (Kernel)                      │
//! │  • start probe: record start time (+ text) per thread           │
//! │  • completion probe: elapsed >= threshold → ring buffer         │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ ring buffer events
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      qscope (This Crate)                        │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │    Attach    │   │  Dispatcher  │──▶│   Handler    │         │
//! │  │ (plan, load) │   │   (decode)   │   │ (text/json)  │         │
//! │  └──────────────┘   └──────────────┘   └──────────────┘         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`attach`]: decide probe sites from the binary, load and attach the probes
//!   - `usdt`: `.note.stapsdt` parsing, argument specs, semaphores
//!   - `symbols`: `mysql_execute_command` symbol scan
//!   - `ebpf_setup`: object loading with attachment-time constants
//! - [`layout`] / [`version`]: per-version `THD` offsets and version detection
//! - [`events`]: ring buffer decoding, dispatch, output handlers, probe counters
//! - [`config`] / [`cli`]: command line and validated configuration
//! - [`preflight`]: privilege, kernel and target checks
//! - [`sim`]: the probe logic driven by a simulated target, without a kernel
//!
//! The probe logic itself lives in `qscope-common` so the same code runs in
//! the kernel and in [`sim`].
//!
//! ## Typical Usage
//!
//! ```bash
//! # Every query, via the server's static tracepoints
//! sudo qscope $(pidof mysqld)
//!
//! # Queries slower than 50ms, via uprobes on a server built without DTrace
//! sudo qscope -m uprobe -p /usr/sbin/mysqld -t 50 $(pidof mysqld)
//! ```

pub mod attach;
pub mod cli;
pub mod clock;
pub mod config;
pub mod domain;
pub mod events;
pub mod layout;
pub mod memory_maps;
pub mod preflight;
pub mod sim;
pub mod version;
