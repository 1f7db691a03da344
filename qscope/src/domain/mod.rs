//! Domain model for qscope
//!
//! Newtypes and errors shared by the attachment and event modules.

pub mod errors;

pub use errors::{DecodeError, TracerError};

use std::fmt;

/// Process ID of the traced server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pid(pub i32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}
