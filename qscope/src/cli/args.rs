//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

use crate::config::{AttachMode, OutputFormat, DEFAULT_TARGET_PATH};
use qscope_common::DEFAULT_RING_PAGES;

#[derive(Parser, Debug)]
#[command(
    name = "qscope",
    about = "Trace MySQL query latency via USDT or uprobe",
    after_help = "\
EXAMPLES:
    sudo qscope $(pidof mysqld)                      Every query, USDT probes
    sudo qscope -t 100 $(pidof mysqld)               Queries slower than 100ms
    sudo qscope -m uprobe -p /usr/sbin/mysqld 1234   mysql_execute_command uprobes"
)]
pub struct Args {
    /// Mechanism to trace with
    #[arg(short, long, value_enum, default_value_t = AttachMode::Usdt)]
    pub mode: AttachMode,

    /// Path to the mysqld binary
    #[arg(short, long, default_value = DEFAULT_TARGET_PATH)]
    pub path: PathBuf,

    /// Minimum query latency to report, in milliseconds
    #[arg(short, long, value_name = "MS", default_value = "0")]
    pub threshold: u64,

    /// Process ID of the server to trace
    #[arg(value_name = "PID", default_value = "1")]
    pub pid: i32,

    /// Ring buffer size in pages (power of two)
    #[arg(long, value_name = "N", default_value_t = DEFAULT_RING_PAGES)]
    pub ring_pages: u32,

    /// Drop queries still in flight after N seconds (0 = never)
    #[arg(long, value_name = "SECS", default_value = "60")]
    pub stale_after: u64,

    /// Stop after N seconds (0 = unlimited)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Output format of traced queries
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}
