//! Pre-flight checks for qscope
//!
//! Validates system requirements before attempting to load eBPF programs.
//! Provides clear, actionable error messages when requirements aren't met.

#![allow(unsafe_code)] // geteuid() requires unsafe

use anyhow::{bail, Context, Result};
use object::Object;
use std::path::Path;

use crate::config::{AttachMode, TraceConfig};
use crate::domain::Pid;

/// Minimum kernel version required for the BPF ring buffer
const MIN_KERNEL_VERSION: (u32, u32) = (5, 8);

/// Run all pre-flight checks before eBPF loading
///
/// # Errors
/// Returns an error describing the first unmet requirement
pub fn run_preflight_checks(config: &TraceConfig) -> Result<()> {
    check_privileges()?;
    check_kernel_version()?;
    check_binary_exists(&config.target_path)?;
    check_process_exists(config.target_pid)?;
    if config.mode == AttachMode::Usdt && !config.quiet {
        warn_without_usdt_notes(&config.target_path)?;
    }
    Ok(())
}

/// Check if running with sufficient privileges for eBPF
fn check_privileges() -> Result<()> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    bail!(
        "Permission denied: qscope requires root privileges to load eBPF programs.\n\n\
         Run with: sudo qscope ..."
    );
}

/// Parse `major.minor` from a kernel release such as `6.1.0-arch1-1`
fn parse_kernel_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()?
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()?;
    Some((major, minor))
}

/// Check if the kernel version is sufficient for eBPF features
fn check_kernel_version() -> Result<()> {
    let version_str = std::fs::read_to_string("/proc/version")
        .context("Failed to read kernel version from /proc/version")?;

    // "Linux version 5.15.0-generic ..."
    let release = version_str.split_whitespace().nth(2).unwrap_or("unknown");

    let Some((major, minor)) = parse_kernel_release(release) else {
        // Can't parse, assume it's fine
        return Ok(());
    };

    if (major, minor) < MIN_KERNEL_VERSION {
        bail!(
            "Kernel version {major}.{minor} is too old.\n\n\
             qscope requires Linux {}.{} or newer for eBPF ring buffer support.\n\
             Current kernel: {release}",
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1,
        );
    }

    Ok(())
}

/// Check if the target binary exists and is readable
fn check_binary_exists(target_path: &Path) -> Result<()> {
    if !target_path.exists() {
        bail!(
            "Binary not found: {}\n\n\
             Pass the server binary with --path.",
            target_path.display()
        );
    }
    if !target_path.is_file() {
        bail!(
            "Not a file: {}\n\n\
             --path must point to the mysqld executable, not a directory.",
            target_path.display()
        );
    }
    Ok(())
}

/// Check if the target process exists
///
/// # Errors
/// Returns an error if `/proc/<pid>` is missing
pub fn check_process_exists(pid: Pid) -> Result<()> {
    let pid = pid.0;
    if !Path::new(&format!("/proc/{pid}")).exists() {
        bail!(
            "Process {pid} not found.\n\n\
             Is the server still running? Check with: ps -p {pid}"
        );
    }
    Ok(())
}

/// Hint at `--mode uprobe` when the binary has no USDT notes at all
fn warn_without_usdt_notes(target_path: &Path) -> Result<()> {
    let file_data = std::fs::read(target_path)
        .with_context(|| format!("Failed to read binary: {}", target_path.display()))?;

    let Ok(obj) = object::File::parse(&*file_data) else {
        // Not a valid object file, let later stages handle it
        return Ok(());
    };

    if obj.section_by_name(".note.stapsdt").is_none() {
        eprintln!("warning: no USDT probes in binary, try --mode uprobe");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_version_check() {
        // Just ensure it doesn't panic; the test may run on an old kernel
        let _ = check_kernel_version();
    }

    #[test]
    fn test_parse_kernel_release() {
        assert_eq!(parse_kernel_release("6.1.0-arch1-1"), Some((6, 1)));
        assert_eq!(parse_kernel_release("5.15.0-generic"), Some((5, 15)));
        assert_eq!(parse_kernel_release("4.19rc1"), Some((4, 19)));
        assert_eq!(parse_kernel_release("6"), None);
        assert_eq!(parse_kernel_release("unknown"), None);
    }

    #[test]
    fn test_binary_not_found() {
        let result = check_binary_exists(Path::new("/nonexistent/path/to/mysqld"));
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Binary not found"));
    }

    #[test]
    fn test_directory_is_not_a_binary() {
        let dir = tempfile::tempdir().unwrap();
        let err = check_binary_exists(dir.path()).unwrap_err().to_string();
        assert!(err.contains("Not a file"));
    }

    #[test]
    fn test_note_check_tolerates_any_file() {
        let exe = std::env::current_exe().unwrap();
        assert!(warn_without_usdt_notes(&exe).is_ok());

        let mut script = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut script, b"#!/bin/sh\n").unwrap();
        assert!(warn_without_usdt_notes(script.path()).is_ok());
    }

    #[test]
    fn test_process_not_found() {
        let err = check_process_exists(Pid(999_999_999)).unwrap_err().to_string();
        assert!(err.contains("not found"));
    }
}
