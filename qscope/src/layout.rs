//! `THD` layout per server version
//!
//! `mysql_execute_command` receives the connection's `THD*`. The query text
//! pointer and its length live at fixed offsets that differ between release
//! series; only the series listed in [`LAYOUT_TABLE`] can be traced with uprobes.

use std::fmt;

/// Release series with a known `THD` layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerVersion {
    Mysql57,
    Mysql80,
}

impl ServerVersion {
    /// Map a `major.minor` pair to a supported series
    #[must_use]
    pub fn from_series(major: u32, minor: u32) -> Option<Self> {
        match (major, minor) {
            (5, 7) => Some(Self::Mysql57),
            (8, 0) => Some(Self::Mysql80),
            _ => None,
        }
    }

    /// Offsets of the query fields inside `THD` for this series
    #[must_use]
    pub fn layout(self) -> &'static LayoutEntry {
        match self {
            Self::Mysql57 => &LAYOUT_TABLE[0],
            Self::Mysql80 => &LAYOUT_TABLE[1],
        }
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mysql57 => write!(f, "5.7"),
            Self::Mysql80 => write!(f, "8.0"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutEntry {
    pub version: ServerVersion,
    /// Offset of `m_query_string.str` (`const char*`)
    pub query_ptr_offset: u64,
    /// Offset of `m_query_string.length` (`size_t`)
    pub query_len_offset: u64,
}

pub const LAYOUT_TABLE: [LayoutEntry; 2] = [
    LayoutEntry { version: ServerVersion::Mysql57, query_ptr_offset: 472, query_len_offset: 480 },
    LayoutEntry { version: ServerVersion::Mysql80, query_ptr_offset: 512, query_len_offset: 520 },
];
