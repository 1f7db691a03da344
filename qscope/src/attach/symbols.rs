//! ELF symbol scan and address translation
//!
//! Uprobes are attached by file offset, so every probe site found in the
//! target (function symbol or USDT note) is translated from its virtual
//! address through the loadable segments.

use log::debug;
use object::{Object, ObjectSegment, ObjectSymbol, SymbolKind};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;

use crate::domain::TracerError;

/// Pattern of the (possibly mangled) symbol names of the query executor
///
/// Anchored at the start: at least one word character must precede
/// `mysql_execute_command` and follow it, so the unmangled C name alone never
/// matches while `_Z21mysql_execute_commandP3THDb` does.
pub const EXECUTE_COMMAND_PATTERN: &str = r"^\w+mysql_execute_command\w+";

/// A function to hook, by name and file offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSite {
    pub name: String,
    pub file_offset: u64,
}

/// Compiled symbol name pattern
#[derive(Clone)]
pub struct SymbolFilter {
    regex: Regex,
    source: String,
}

impl fmt::Debug for SymbolFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymbolFilter({})", self.source)
    }
}

impl SymbolFilter {
    /// # Errors
    /// Returns `TracerError::Configuration` if `pattern` is not a valid regex
    pub fn new(pattern: &str) -> Result<Self, TracerError> {
        let regex = Regex::new(pattern).map_err(|e| {
            TracerError::Configuration(format!("invalid symbol pattern '{pattern}': {e}"))
        })?;
        Ok(Self { regex, source: pattern.to_string() })
    }

    /// The `mysql_execute_command` filter
    ///
    /// # Errors
    /// Only if [`EXECUTE_COMMAND_PATTERN`] fails to compile
    pub fn execute_command() -> Result<Self, TracerError> {
        Self::new(EXECUTE_COMMAND_PATTERN)
    }

    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Translate a virtual address to a file offset via the loadable segments
#[must_use]
pub fn file_offset(obj: &object::File<'_>, vaddr: u64) -> Option<u64> {
    obj.segments().find_map(|segment| {
        let start = segment.address();
        let (offset, size) = segment.file_range();
        (vaddr >= start && vaddr < start + size).then(|| vaddr - start + offset)
    })
}

/// Defined text symbols matching `filter`, one per file offset
///
/// Static and dynamic symbol tables often list the same function; aliases at
/// one address are hooked once.
#[must_use]
pub fn matching_sites(obj: &object::File<'_>, filter: &SymbolFilter) -> Vec<FunctionSite> {
    let mut sites = BTreeMap::new();

    for symbol in obj.symbols().chain(obj.dynamic_symbols()) {
        if symbol.kind() != SymbolKind::Text || symbol.is_undefined() || symbol.address() == 0 {
            continue;
        }
        let Ok(name) = symbol.name() else { continue };
        if !filter.matches(name) {
            continue;
        }
        let Some(offset) = file_offset(obj, symbol.address()) else {
            debug!("{name} at 0x{:x} is outside any segment", symbol.address());
            continue;
        };
        sites.entry(offset).or_insert_with(|| name.to_string());
    }

    sites.into_iter().map(|(file_offset, name)| FunctionSite { name, file_offset }).collect()
}
