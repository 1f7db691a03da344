//! Validated tracer configuration
//!
//! [`TraceConfig`] is what the rest of the crate consumes; [`crate::cli::Args`]
//! only exists to fill it in.

use clap::ValueEnum;
use std::path::PathBuf;
use std::time::Duration;

use crate::cli::Args;
use crate::domain::{Pid, TracerError};
use qscope_common::{DEFAULT_RING_PAGES, PAGE_SIZE};

/// Default location of the server binary
pub const DEFAULT_TARGET_PATH: &str = "/usr/local/mysql/bin/mysqld";

const NS_PER_MS: u64 = 1_000_000;

/// Which probe pair to attach
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AttachMode {
    /// Static tracepoints `mysql:query__exec__start` / `mysql:query__exec__done`
    Usdt,
    /// Entry and return of `mysql_execute_command`
    Uprobe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Tab-separated lines
    Text,
    /// One JSON object per line
    Json,
}

#[derive(Debug, Clone)]
pub struct TraceConfig {
    pub mode: AttachMode,
    pub target_path: PathBuf,
    pub target_pid: Pid,
    pub threshold_ns: u64,
    pub ring_pages: u32,
    /// `None` disables the userspace sweep of in-flight records
    pub stale_after: Option<Duration>,
    /// `None` traces until interrupted or the target exits
    pub duration: Option<Duration>,
    pub format: OutputFormat,
    pub quiet: bool,
}

impl TraceConfig {
    /// Configuration for `target_path`/`target_pid` with every other setting at its default
    #[must_use]
    pub fn new(mode: AttachMode, target_path: impl Into<PathBuf>, target_pid: i32) -> Self {
        Self {
            mode,
            target_path: target_path.into(),
            target_pid: Pid(target_pid),
            threshold_ns: 0,
            ring_pages: DEFAULT_RING_PAGES,
            stale_after: Some(Duration::from_secs(60)),
            duration: None,
            format: OutputFormat::Text,
            quiet: false,
        }
    }

    /// Build and validate a configuration from parsed arguments
    ///
    /// # Errors
    /// Returns `TracerError::Configuration` if any value is out of range
    pub fn from_args(args: &Args) -> Result<Self, TracerError> {
        let threshold_ns = args.threshold.checked_mul(NS_PER_MS).ok_or_else(|| {
            TracerError::Configuration(format!("threshold of {}ms is too large", args.threshold))
        })?;

        let config = Self {
            mode: args.mode,
            target_path: args.path.clone(),
            target_pid: Pid(args.pid),
            threshold_ns,
            ring_pages: args.ring_pages,
            stale_after: (args.stale_after > 0).then(|| Duration::from_secs(args.stale_after)),
            duration: (args.duration > 0).then(|| Duration::from_secs(args.duration)),
            format: args.format,
            quiet: args.quiet,
        };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns `TracerError::Configuration` describing the first invalid value
    pub fn validate(&self) -> Result<(), TracerError> {
        if self.target_pid.0 < 1 {
            return Err(TracerError::Configuration(format!(
                "pid must be at least 1, got {}",
                self.target_pid.0
            )));
        }
        if self.target_path.as_os_str().is_empty() {
            return Err(TracerError::Configuration("target path is empty".to_string()));
        }
        if !self.ring_pages.is_power_of_two() {
            return Err(TracerError::Configuration(format!(
                "ring buffer size must be a power of two pages, got {}",
                self.ring_pages
            )));
        }
        if self.ring_pages.checked_mul(PAGE_SIZE).is_none() {
            return Err(TracerError::Configuration(format!(
                "ring buffer of {} pages is too large",
                self.ring_pages
            )));
        }
        Ok(())
    }

    /// Maximum in-flight record age in nanoseconds, 0 when unlimited
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn stale_after_ns(&self) -> u64 {
        self.stale_after.map_or(0, |age| age.as_nanos() as u64)
    }

    /// Ring buffer size in bytes, as passed to the loader
    #[must_use]
    pub fn ring_bytes(&self) -> u32 {
        self.ring_pages * PAGE_SIZE
    }

    /// Target path as a string for messages and the loader
    #[must_use]
    pub fn target_display(&self) -> String {
        self.target_path.to_string_lossy().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_threshold_converted_to_ns() {
        let args = Args::parse_from(["qscope", "-t", "100", "42"]);
        let config = TraceConfig::from_args(&args).unwrap();
        assert_eq!(config.threshold_ns, 100_000_000);
        assert_eq!(config.target_pid, Pid(42));
        assert_eq!(config.stale_after, Some(Duration::from_secs(60)));
        assert_eq!(config.duration, None);
    }

    #[test]
    fn test_rejects_pid_zero() {
        let args = Args::parse_from(["qscope", "0"]);
        let err = TraceConfig::from_args(&args).unwrap_err();
        assert!(matches!(err, TracerError::Configuration(_)));
    }

    #[test]
    fn test_rejects_ring_size_not_power_of_two() {
        let args = Args::parse_from(["qscope", "--ring-pages", "48"]);
        let err = TraceConfig::from_args(&args).unwrap_err();
        assert!(err.to_string().contains("power of two"));
    }

    #[test]
    fn test_stale_after_zero_disables_sweep() {
        let args = Args::parse_from(["qscope", "--stale-after", "0"]);
        let config = TraceConfig::from_args(&args).unwrap();
        assert_eq!(config.stale_after, None);
        assert_eq!(config.stale_after_ns(), 0);
    }

    #[test]
    fn test_stale_after_in_nanoseconds() {
        let config = TraceConfig::new(AttachMode::Usdt, "/usr/sbin/mysqld", 1);
        assert_eq!(config.stale_after_ns(), 60_000_000_000);
    }

    #[test]
    fn test_ring_bytes() {
        let config = TraceConfig::new(AttachMode::Usdt, DEFAULT_TARGET_PATH, 1);
        assert_eq!(config.ring_bytes(), 64 * 4096);
    }
}
