//! Server version detection
//!
//! The default source runs `<mysqld> --version`, which prints a line such as
//! `/usr/sbin/mysqld  Ver 8.0.36 for Linux on x86_64 (MySQL Community Server - GPL)`.

use log::debug;
use std::path::Path;
use std::process::Command;

use crate::domain::TracerError;
use crate::layout::ServerVersion;

/// Something that can report the version string of a server binary
pub trait VersionSource {
    /// # Errors
    /// Returns an error if the version cannot be obtained
    fn detect(&self, target_path: &Path) -> Result<String, TracerError>;
}

/// Runs the binary with `--version`
pub struct CommandVersionSource;

impl VersionSource for CommandVersionSource {
    fn detect(&self, target_path: &Path) -> Result<String, TracerError> {
        let output = Command::new(target_path).arg("--version").output()?;
        if !output.status.success() {
            return Err(TracerError::UnsupportedVersion(format!(
                "{} --version exited with {}",
                target_path.display(),
                output.status
            )));
        }
        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!("{} --version: {text}", target_path.display());
        Ok(text)
    }
}

/// Fixed version string, for tests and for overriding detection
pub struct StaticVersionSource(pub String);

impl VersionSource for StaticVersionSource {
    fn detect(&self, _target_path: &Path) -> Result<String, TracerError> {
        Ok(self.0.clone())
    }
}

/// Parse the release series from a `--version` line
///
/// Only the number following `Ver` is considered, so build or distribution
/// suffixes (`-0ubuntu0.18.04.1`) never select a series.
///
/// # Errors
/// Returns `TracerError::UnsupportedVersion` if the line has no `Ver` token or
/// names a series without a known layout
pub fn parse_version(version_line: &str) -> Result<ServerVersion, TracerError> {
    let unsupported = || TracerError::UnsupportedVersion(version_line.to_string());

    let mut tokens = version_line.split_whitespace();
    tokens.find(|token| token.eq_ignore_ascii_case("ver")).ok_or_else(unsupported)?;
    let number = tokens.next().ok_or_else(unsupported)?;

    let mut parts = number.split(|c: char| !c.is_ascii_digit());
    let major = parts.next().and_then(|p| p.parse().ok()).ok_or_else(unsupported)?;
    let minor = parts.next().and_then(|p| p.parse().ok()).ok_or_else(unsupported)?;

    ServerVersion::from_series(major, minor).ok_or_else(unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mysql80() {
        let line = "/usr/sbin/mysqld  Ver 8.0.36 for Linux on x86_64 (MySQL Community Server - GPL)";
        assert_eq!(parse_version(line).unwrap(), ServerVersion::Mysql80);
    }

    #[test]
    fn test_parse_mysql57() {
        let line = "mysqld  Ver 5.7.44 for Linux on x86_64 (MySQL Community Server (GPL))";
        assert_eq!(parse_version(line).unwrap(), ServerVersion::Mysql57);
    }

    #[test]
    fn test_distribution_suffix_does_not_select_series() {
        // "18.04" contains "8.0" but the server is 5.7
        let line = "/usr/sbin/mysqld  Ver 5.7.42-0ubuntu0.18.04.1 for Linux on x86_64 ((Ubuntu))";
        assert_eq!(parse_version(line).unwrap(), ServerVersion::Mysql57);
    }

    #[test]
    fn test_unknown_series_rejected() {
        let err = parse_version("/usr/sbin/mysqld  Ver 8.4.0 for Linux on x86_64").unwrap_err();
        assert!(matches!(err, TracerError::UnsupportedVersion(_)));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(parse_version("").is_err());
        assert!(parse_version("mysqld Ver").is_err());
        assert!(parse_version("mysqld Ver x.y").is_err());
    }

    #[test]
    fn test_command_source_missing_binary() {
        let result = CommandVersionSource.detect(Path::new("/nonexistent/mysqld"));
        assert!(matches!(result, Err(TracerError::Io(_))));
    }
}
