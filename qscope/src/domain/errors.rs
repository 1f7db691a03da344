//! Structured error types for qscope
//!
//! Using thiserror for automatic Display implementation and error chaining.

use thiserror::Error;

/// Fatal tracer errors: nothing is traced after one of these
#[derive(Error, Debug)]
pub enum TracerError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Unsupported MySQL version: {0}")]
    UnsupportedVersion(String),

    #[error("Failed to attach to {target}: {reason}")]
    Attachment { target: String, reason: String },

    #[error("eBPF object missing from this build, run `cargo xtask build-ebpf` and rebuild")]
    MissingProbeObject,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ebpf(#[from] aya::EbpfError),

    #[error(transparent)]
    Program(#[from] aya::programs::ProgramError),

    #[error(transparent)]
    Map(#[from] aya::maps::MapError),
}

impl TracerError {
    pub(crate) fn attachment(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Attachment { target: target.into(), reason: reason.into() }
    }
}

/// A ring buffer record that could not be decoded
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record of {actual} bytes is shorter than an event ({expected} bytes)")]
    ShortRecord { actual: usize, expected: usize },
}
