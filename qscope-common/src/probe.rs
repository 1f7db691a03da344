//! # Probe Pairs
//!
//! The logic executed at each instrumentation point. Two pairs exist:
//!
//! - [`StaticTracepointProbe`] - USDT `query__exec__start` / `query__exec__done`.
//!   The start probe only records the query address; the text is read at
//!   completion, after the threshold filter, so discarded queries cost no copy.
//! - [`DynamicFunctionProbe`] - uprobe/uretprobe on `mysql_execute_command`.
//!   The text is copied at entry because `THD` may drop the query before return.
//!
//! Both share [`ProbePair::on_completion`]: take the record for the calling
//! thread, apply the threshold, emit. Nothing here allocates or blocks.

use crate::{is_stale, is_truncated, PendingQuery, QueryEvent, QUERY_CAPACITY};

/// Access to the probed thread: clock, identity, registers and user memory
pub trait ProbeEnv {
    /// Monotonic nanoseconds
    fn now_ns(&self) -> u64;

    /// Execution-context key (thread id)
    fn context_id(&self) -> u32;

    /// Read 8 bytes from the saved register file at `offset`
    ///
    /// # Errors
    /// Negative errno of the failed read
    fn read_register(&self, offset: u32) -> Result<u64, i64>;

    /// # Errors
    /// Negative errno of the failed read
    fn read_user_u64(&self, addr: u64) -> Result<u64, i64>;

    /// # Errors
    /// Negative errno of the failed read
    fn read_user_u8(&self, addr: u64) -> Result<u8, i64>;

    /// Copy a NUL-terminated string into `dst`
    ///
    /// Copies at most `QUERY_CAPACITY - 1` bytes, always terminates `dst`, and
    /// returns the copied length including the terminator.
    ///
    /// # Errors
    /// Negative errno of the failed read
    fn read_user_str(&self, addr: u64, dst: &mut [u8; QUERY_CAPACITY]) -> Result<usize, i64>;
}

/// Fixed-capacity map of in-flight queries keyed by thread id
pub trait CorrelationStore {
    /// Insert or overwrite the record for `key`
    ///
    /// # Errors
    /// Negative errno when the store rejects the record
    fn insert(&mut self, key: u32, record: &PendingQuery) -> Result<(), i64>;

    fn get_mut(&mut self, key: u32) -> Option<&mut PendingQuery>;

    fn remove(&mut self, key: u32);
}

/// Event channel producer side
pub trait EventOutput {
    /// # Errors
    /// Negative errno when the channel has no room for the event
    fn output(&mut self, event: &QueryEvent) -> Result<(), i64>;
}

/// What a completion probe did with the record of the calling thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Passed the threshold and written to the channel
    Emitted,
    /// Written to the channel, but the query text could not be read
    EmittedWithoutText,
    /// Below the threshold
    Filtered,
    /// No start record for this thread, or only a stale one
    Missed,
    /// Passed the threshold but the channel was full
    Dropped,
}

/// What a start probe recorded for the calling thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Started {
    Recorded,
    /// Recorded, but target memory (length, pointer or text) was unreadable
    RecordedWithoutText,
}

/// A start/completion probe pair
pub trait ProbePair {
    fn threshold_ns(&self) -> u64;

    /// Maximum age of an in-flight record, 0 for no limit
    fn stale_after_ns(&self) -> u64;

    /// Record the start of a query on the calling thread
    ///
    /// `arg` is the probe's query argument: the text address for USDT, the
    /// `THD*` for the function probe. `scratch` is per-CPU working memory the
    /// record is built in before it is copied into `store`.
    ///
    /// # Errors
    /// Negative errno of a failed store insert
    fn on_start<E: ProbeEnv, S: CorrelationStore>(
        &self,
        env: &E,
        store: &mut S,
        scratch: &mut PendingQuery,
        arg: u64,
    ) -> Result<Started, i64>;

    /// Finish a record that passed the threshold, right before emission
    ///
    /// # Errors
    /// Negative errno of a failed text read; the event is still emitted
    fn prepare<E: ProbeEnv>(&self, _env: &E, _record: &mut PendingQuery) -> Result<(), i64> {
        Ok(())
    }

    /// Take the calling thread's record, filter it, and emit it
    #[inline(always)]
    fn on_completion<E: ProbeEnv, S: CorrelationStore, O: EventOutput>(
        &self,
        env: &E,
        store: &mut S,
        out: &mut O,
    ) -> Completion {
        let key = env.context_id();
        let now = env.now_ns();

        let Some(record) = store.get_mut(key) else {
            return Completion::Missed;
        };

        // Left behind by a start whose completion never fired
        let max_age = self.stale_after_ns();
        if max_age != 0 && is_stale(record.started_ns(), now, max_age) {
            store.remove(key);
            return Completion::Missed;
        }

        let elapsed = now.saturating_sub(record.event.timestamp_ns);
        let outcome = if elapsed >= self.threshold_ns() {
            record.event.elapsed_ns = elapsed;
            let text_ok = self.prepare(env, record).is_ok();
            match (out.output(&record.event), text_ok) {
                (Err(_), _) => Completion::Dropped,
                (Ok(()), true) => Completion::Emitted,
                (Ok(()), false) => Completion::EmittedWithoutText,
            }
        } else {
            Completion::Filtered
        };

        store.remove(key);
        outcome
    }
}

/// USDT `query__exec__start` / `query__exec__done`
#[derive(Clone, Copy)]
pub struct StaticTracepointProbe {
    threshold_ns: u64,
    stale_after_ns: u64,
}

impl StaticTracepointProbe {
    #[must_use]
    pub const fn new(threshold_ns: u64) -> Self {
        Self { threshold_ns, stale_after_ns: 0 }
    }

    #[must_use]
    pub const fn with_stale_after(mut self, stale_after_ns: u64) -> Self {
        self.stale_after_ns = stale_after_ns;
        self
    }
}

impl ProbePair for StaticTracepointProbe {
    fn threshold_ns(&self) -> u64 {
        self.threshold_ns
    }

    fn stale_after_ns(&self) -> u64 {
        self.stale_after_ns
    }

    #[inline(always)]
    fn on_start<E: ProbeEnv, S: CorrelationStore>(
        &self,
        env: &E,
        store: &mut S,
        scratch: &mut PendingQuery,
        query_addr: u64,
    ) -> Result<Started, i64> {
        scratch.event.timestamp_ns = env.now_ns();
        scratch.event.elapsed_ns = 0;
        scratch.event.query_len = 0;
        scratch.event.truncated = 0;
        scratch.event.query = [0; QUERY_CAPACITY];
        scratch.query_addr = query_addr;
        store.insert(env.context_id(), scratch)?;
        Ok(Started::Recorded)
    }

    #[inline(always)]
    fn prepare<E: ProbeEnv>(&self, env: &E, record: &mut PendingQuery) -> Result<(), i64> {
        let addr = record.query_addr;
        let text_len = match copy_query(env, addr, &mut record.event.query) {
            Ok(len) => len,
            Err(e) => {
                record.event.query[0] = 0;
                return Err(e);
            }
        };

        // A full buffer is ambiguous: the text is either exactly
        // QUERY_CAPACITY - 1 bytes or longer. The byte after the copy decides.
        let full = text_len == (QUERY_CAPACITY - 1) as u64;
        let more = full && env.read_user_u8(addr.wrapping_add(text_len)).is_ok_and(|b| b != 0);

        record.event.query_len = if more { QUERY_CAPACITY as u64 } else { text_len };
        record.event.truncated = u8::from(is_truncated(record.event.query_len));
        Ok(())
    }
}

/// Layout offsets read from the `THD` passed to `mysql_execute_command`
#[derive(Clone, Copy)]
pub struct QueryOffsets {
    pub query_ptr: u64,
    pub query_len: u64,
}

/// uprobe/uretprobe on `mysql_execute_command(THD*, ...)`
#[derive(Clone, Copy)]
pub struct DynamicFunctionProbe {
    threshold_ns: u64,
    stale_after_ns: u64,
    offsets: QueryOffsets,
}

impl DynamicFunctionProbe {
    #[must_use]
    pub const fn new(threshold_ns: u64, offsets: QueryOffsets) -> Self {
        Self { threshold_ns, stale_after_ns: 0, offsets }
    }

    #[must_use]
    pub const fn with_stale_after(mut self, stale_after_ns: u64) -> Self {
        self.stale_after_ns = stale_after_ns;
        self
    }
}

impl ProbePair for DynamicFunctionProbe {
    fn threshold_ns(&self) -> u64 {
        self.threshold_ns
    }

    fn stale_after_ns(&self) -> u64 {
        self.stale_after_ns
    }

    #[inline(always)]
    fn on_start<E: ProbeEnv, S: CorrelationStore>(
        &self,
        env: &E,
        store: &mut S,
        scratch: &mut PendingQuery,
        thd: u64,
    ) -> Result<Started, i64> {
        scratch.event.timestamp_ns = env.now_ns();
        scratch.event.elapsed_ns = 0;
        // The string copy stops at the NUL; bytes past it would be an earlier query
        scratch.event.query = [0; QUERY_CAPACITY];

        let query_len = env.read_user_u64(thd.wrapping_add(self.offsets.query_len));
        let query_addr = env.read_user_u64(thd.wrapping_add(self.offsets.query_ptr));

        let len = query_len.unwrap_or(0);
        scratch.event.query_len = len;
        scratch.event.truncated = u8::from(is_truncated(len));
        scratch.query_addr = query_addr.unwrap_or(0);

        // Copied now: the query field may already be cleared on return
        let copied = query_addr.and_then(|addr| copy_query(env, addr, &mut scratch.event.query));
        if copied.is_err() {
            scratch.event.query[0] = 0;
        }

        store.insert(env.context_id(), scratch)?;
        if query_len.is_ok() && copied.is_ok() {
            Ok(Started::Recorded)
        } else {
            Ok(Started::RecordedWithoutText)
        }
    }
}

/// Copy the query text and return its length without the terminator
#[inline(always)]
fn copy_query<E: ProbeEnv>(
    env: &E,
    addr: u64,
    dst: &mut [u8; QUERY_CAPACITY],
) -> Result<u64, i64> {
    let copied = env.read_user_str(addr, dst)?;
    Ok(copied.saturating_sub(1) as u64)
}
