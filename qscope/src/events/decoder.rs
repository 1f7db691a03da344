//! Ring buffer record decoding

use serde::Serialize;

use crate::domain::DecodeError;
use qscope_common::QueryEvent;

/// Size of one raw event record
pub const RECORD_SIZE: usize = std::mem::size_of::<QueryEvent>();

/// A query that passed the latency threshold
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinishedQuery {
    /// Query start, monotonic nanoseconds
    pub timestamp_ns: u64,
    pub elapsed_ns: u64,
    /// Length reported by the server (measured for USDT, see `truncated`)
    pub query_len: u64,
    pub truncated: bool,
    /// Captured text, lossily decoded as UTF-8
    pub query: String,
}

impl From<&QueryEvent> for FinishedQuery {
    fn from(event: &QueryEvent) -> Self {
        Self {
            timestamp_ns: event.timestamp_ns,
            elapsed_ns: event.elapsed_ns,
            query_len: event.query_len,
            truncated: event.is_truncated(),
            query: String::from_utf8_lossy(event.text()).into_owned(),
        }
    }
}

impl FinishedQuery {
    /// Elapsed time in milliseconds
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed_ns as f64 / 1_000_000.0
    }
}

/// Decode one raw record
///
/// # Errors
/// Returns `DecodeError::ShortRecord` if the record is smaller than an event
pub fn decode(bytes: &[u8]) -> Result<FinishedQuery, DecodeError> {
    if bytes.len() < RECORD_SIZE {
        return Err(DecodeError::ShortRecord { actual: bytes.len(), expected: RECORD_SIZE });
    }

    // SAFETY: The buffer holds at least size_of::<QueryEvent>() bytes, and
    // QueryEvent is plain data valid for any bit pattern
    #[allow(unsafe_code)]
    let event = unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<QueryEvent>()) };

    Ok(FinishedQuery::from(&event))
}

/// Raw bytes of an event, as the probes write it to the ring buffer
#[must_use]
pub fn encode(event: &QueryEvent) -> Vec<u8> {
    // SAFETY: QueryEvent is #[repr(C)] without implicit padding, so every byte
    // is initialized
    #[allow(unsafe_code)]
    let bytes = unsafe {
        std::slice::from_raw_parts(std::ptr::from_ref(event).cast::<u8>(), RECORD_SIZE)
    };
    bytes.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(text: &str) -> QueryEvent {
        let mut event = QueryEvent::zeroed();
        event.timestamp_ns = 10;
        event.elapsed_ns = 2_500_000;
        event.query_len = text.len() as u64;
        event.query[..text.len()].copy_from_slice(text.as_bytes());
        event
    }

    #[test]
    fn test_record_size() {
        assert_eq!(RECORD_SIZE, 288);
    }

    #[test]
    fn test_decode_event() {
        let query = decode(&encode(&event("SELECT 1"))).unwrap();
        assert_eq!(query.query, "SELECT 1");
        assert_eq!(query.query_len, 8);
        assert!(!query.truncated);
        assert!((query.elapsed_ms() - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_short_record_rejected() {
        let bytes = encode(&event("SELECT 1"));
        let err = decode(&bytes[..100]).unwrap_err();
        assert_eq!(err, DecodeError::ShortRecord { actual: 100, expected: 288 });
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut raw = event("");
        raw.query[..3].copy_from_slice(&[b'a', 0xff, b'b']);
        let query = decode(&encode(&raw)).unwrap();
        assert_eq!(query.query, "a\u{fffd}b");
    }
}
