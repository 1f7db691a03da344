//! Probe pair behavior against a simulated target
//!
//! Both probe pairs run the same code that is compiled into the eBPF object;
//! records they emit are decoded by the same dispatcher the tracer uses.

use qscope::events::{DispatchStats, Dispatcher, FinishedQuery};
use qscope::layout::ServerVersion;
use qscope::sim::SimTracer;
use qscope_common::probe::{
    Completion, DynamicFunctionProbe, ProbePair, QueryOffsets, Started, StaticTracepointProbe,
};
use qscope_common::{QueryEvent, UsdtArg, QUERY_CAPACITY};

const MS: u64 = 1_000_000;

fn static_tracer(threshold_ns: u64) -> SimTracer<StaticTracepointProbe> {
    SimTracer::new(StaticTracepointProbe::new(threshold_ns))
}

fn dynamic_tracer(threshold_ns: u64) -> SimTracer<DynamicFunctionProbe> {
    let layout = ServerVersion::Mysql80.layout();
    SimTracer::new(DynamicFunctionProbe::new(
        threshold_ns,
        QueryOffsets { query_ptr: layout.query_ptr_offset, query_len: layout.query_len_offset },
    ))
}

/// Decode every emitted record through the dispatcher
fn drain<P: ProbePair>(tracer: &mut SimTracer<P>) -> Vec<FinishedQuery> {
    let mut queries = Vec::new();
    let mut dispatcher = Dispatcher::new(|q: &FinishedQuery| -> std::io::Result<()> {
        queries.push(q.clone());
        Ok(())
    });
    for record in tracer.take_records() {
        dispatcher.dispatch_record(&record).unwrap();
    }
    assert_eq!(dispatcher.stats().malformed, 0);
    drop(dispatcher);
    queries
}

/// Run one query on `tid` taking `elapsed_ns`, static pair
fn run_static(tracer: &mut SimTracer<StaticTracepointProbe>, tid: u32, text: &str, elapsed_ns: u64) -> Completion {
    let addr = tracer.target.alloc_str(text);
    assert_eq!(tracer.start(tid, addr), Ok(Started::Recorded));
    tracer.target.advance(elapsed_ns);
    tracer.complete(tid)
}

/// Run one query on `tid` taking `elapsed_ns`, dynamic pair
fn run_dynamic(tracer: &mut SimTracer<DynamicFunctionProbe>, tid: u32, text: &str, elapsed_ns: u64) -> Completion {
    let thd = tracer.target.alloc_query_thd(ServerVersion::Mysql80.layout(), text);
    assert_eq!(tracer.start(tid, thd), Ok(Started::Recorded));
    tracer.target.advance(elapsed_ns);
    tracer.complete(tid)
}

#[test]
fn test_select_one_without_threshold_static() {
    let mut tracer = static_tracer(0);
    assert_eq!(run_static(&mut tracer, 42, "SELECT 1", 0), Completion::Emitted);

    let queries = drain(&mut tracer);
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].query, "SELECT 1");
    assert_eq!(queries[0].query_len, 8);
    assert!(!queries[0].truncated);
    assert_eq!(tracer.in_flight(), 0);
}

#[test]
fn test_select_one_without_threshold_dynamic() {
    let mut tracer = dynamic_tracer(0);
    assert_eq!(run_dynamic(&mut tracer, 42, "SELECT 1", 0), Completion::Emitted);

    let queries = drain(&mut tracer);
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].query, "SELECT 1");
    assert_eq!(queries[0].query_len, 8);
    assert!(!queries[0].truncated);
}

#[test]
fn test_fast_query_below_threshold_is_filtered() {
    let mut tracer = static_tracer(100 * MS);
    assert_eq!(run_static(&mut tracer, 1, "SELECT SLEEP(0.05)", 50 * MS), Completion::Filtered);
    assert!(drain(&mut tracer).is_empty());
    assert_eq!(tracer.in_flight(), 0);

    let mut tracer = dynamic_tracer(100 * MS);
    assert_eq!(run_dynamic(&mut tracer, 1, "SELECT SLEEP(0.05)", 50 * MS), Completion::Filtered);
    assert!(drain(&mut tracer).is_empty());
}

#[test]
fn test_emitted_events_respect_threshold() {
    let threshold = 10 * MS;
    let mut tracer = static_tracer(threshold);
    for (tid, elapsed) in [(1, 9 * MS), (2, 10 * MS), (3, 11 * MS), (4, 0), (5, 500 * MS)] {
        run_static(&mut tracer, tid, "UPDATE t SET a = 1", elapsed);
    }

    let queries = drain(&mut tracer);
    assert_eq!(queries.len(), 3);
    assert!(queries.iter().all(|q| q.elapsed_ns >= threshold));
}

#[test]
fn test_truncation_boundaries_static() {
    for (len, truncated, reported) in [
        (QUERY_CAPACITY - 1, false, QUERY_CAPACITY - 1),
        (QUERY_CAPACITY, true, QUERY_CAPACITY),
        // The server reports no length: the capacity is a lower bound
        (QUERY_CAPACITY + 1, true, QUERY_CAPACITY),
    ] {
        let mut tracer = static_tracer(0);
        let text = "x".repeat(len);
        run_static(&mut tracer, 1, &text, MS);

        let query = &drain(&mut tracer)[0];
        assert_eq!(query.truncated, truncated, "length {len}");
        assert_eq!(query.query_len, reported as u64, "length {len}");
        assert_eq!(query.query, "x".repeat(len.min(QUERY_CAPACITY - 1)));
    }
}

#[test]
fn test_truncation_boundaries_dynamic() {
    for (len, truncated) in
        [(QUERY_CAPACITY - 1, false), (QUERY_CAPACITY, true), (QUERY_CAPACITY + 1, true)]
    {
        let mut tracer = dynamic_tracer(0);
        let text = "y".repeat(len);
        run_dynamic(&mut tracer, 1, &text, MS);

        let query = &drain(&mut tracer)[0];
        assert_eq!(query.truncated, truncated, "length {len}");
        assert_eq!(query.query_len, len as u64);
        assert_eq!(query.query.len(), len.min(QUERY_CAPACITY - 1));
    }
}

#[test]
fn test_completion_without_start() {
    let mut tracer = static_tracer(0);
    assert_eq!(tracer.complete(7), Completion::Missed);
    assert!(drain(&mut tracer).is_empty());
    assert_eq!(tracer.in_flight(), 0);

    let mut tracer = dynamic_tracer(0);
    assert_eq!(tracer.complete(7), Completion::Missed);
    assert!(drain(&mut tracer).is_empty());
}

#[test]
fn test_interleaved_threads_are_matched_independently() {
    let mut tracer = static_tracer(0);
    let a = tracer.target.alloc_str("SELECT a FROM t1");
    let b = tracer.target.alloc_str("SELECT b FROM t2");

    tracer.start(100, a).unwrap();
    tracer.target.advance(3 * MS);
    tracer.start(200, b).unwrap();
    tracer.target.advance(4 * MS);
    assert_eq!(tracer.complete(100), Completion::Emitted);
    tracer.target.advance(5 * MS);
    assert_eq!(tracer.complete(200), Completion::Emitted);

    let queries = drain(&mut tracer);
    assert_eq!(queries.len(), 2);
    assert_eq!(queries[0].query, "SELECT a FROM t1");
    assert_eq!(queries[0].elapsed_ns, 7 * MS);
    assert_eq!(queries[1].query, "SELECT b FROM t2");
    assert_eq!(queries[1].elapsed_ns, 9 * MS);
    assert_eq!(queries[1].timestamp_ns - queries[0].timestamp_ns, 3 * MS);
}

#[test]
fn test_new_start_replaces_abandoned_record() {
    let mut tracer = dynamic_tracer(0);
    let layout = ServerVersion::Mysql80.layout();
    let abandoned = tracer.target.alloc_query_thd(layout, "SELECT abandoned");
    let current = tracer.target.alloc_query_thd(layout, "SELECT current");

    tracer.start(9, abandoned).unwrap();
    tracer.target.advance(60 * MS);
    tracer.start(9, current).unwrap();
    tracer.target.advance(MS);
    tracer.complete(9);

    let queries = drain(&mut tracer);
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].query, "SELECT current");
    assert_eq!(queries[0].elapsed_ns, MS);
}

#[test]
fn test_full_channel_drops_event_and_clears_record() {
    let mut tracer = static_tracer(0).with_channel_capacity(1);
    assert_eq!(run_static(&mut tracer, 1, "SELECT 1", MS), Completion::Emitted);
    assert_eq!(run_static(&mut tracer, 2, "SELECT 2", MS), Completion::Dropped);
    assert_eq!(tracer.in_flight(), 0);

    let queries = drain(&mut tracer);
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].query, "SELECT 1");
}

#[test]
fn test_stale_records_are_evicted() {
    let mut tracer = static_tracer(0);
    let addr = tracer.target.alloc_str("SELECT 1");
    tracer.start(1, addr).unwrap();
    tracer.target.advance(30 * MS);
    tracer.start(2, addr).unwrap();
    tracer.target.advance(30 * MS);

    assert_eq!(tracer.evict_stale(40 * MS), 1);
    assert_eq!(tracer.complete(1), Completion::Missed);
    assert_eq!(tracer.complete(2), Completion::Emitted);
}

#[test]
fn test_completion_past_age_limit_is_missed() {
    let mut tracer = SimTracer::new(StaticTracepointProbe::new(0).with_stale_after(40 * MS));
    assert_eq!(run_static(&mut tracer, 1, "SELECT SLEEP(60)", 60 * MS), Completion::Missed);
    assert_eq!(tracer.in_flight(), 0);
    assert!(drain(&mut tracer).is_empty());

    assert_eq!(run_static(&mut tracer, 1, "SELECT 1", 10 * MS), Completion::Emitted);
    assert_eq!(drain(&mut tracer).len(), 1);
}

#[test]
fn test_age_limit_applies_to_dynamic_pair() {
    let layout = ServerVersion::Mysql80.layout();
    let offsets = QueryOffsets { query_ptr: layout.query_ptr_offset, query_len: layout.query_len_offset };
    let mut tracer = SimTracer::new(DynamicFunctionProbe::new(0, offsets).with_stale_after(40 * MS));

    assert_eq!(run_dynamic(&mut tracer, 3, "SELECT 1", 41 * MS), Completion::Missed);
    assert_eq!(run_dynamic(&mut tracer, 3, "SELECT 1", 40 * MS), Completion::Emitted);
    assert_eq!(tracer.in_flight(), 0);
}

/// Bytes of the emitted text buffer past the first `len` bytes
fn text_tail(record: &[u8], len: usize) -> &[u8] {
    let at = std::mem::offset_of!(QueryEvent, query);
    &record[at + len..at + QUERY_CAPACITY]
}

#[test]
fn test_short_query_after_long_one_carries_no_old_text_dynamic() {
    let mut tracer = dynamic_tracer(0);
    run_dynamic(&mut tracer, 1, "SELECT * FROM users WHERE password = 'hunter2'", 0);
    run_dynamic(&mut tracer, 2, "SELECT 1", 0);

    let records = tracer.take_records();
    assert_eq!(records.len(), 2);
    assert!(text_tail(&records[1], 8).iter().all(|&b| b == 0));
}

#[test]
fn test_short_query_after_long_one_carries_no_old_text_static() {
    let mut tracer = static_tracer(0);
    run_static(&mut tracer, 1, "SELECT * FROM users WHERE password = 'hunter2'", 0);
    run_static(&mut tracer, 2, "SELECT 1", 0);

    let records = tracer.take_records();
    assert_eq!(records.len(), 2);
    assert!(text_tail(&records[1], 8).iter().all(|&b| b == 0));
}

#[test]
fn test_static_start_resolves_register_argument() {
    let mut tracer = static_tracer(0);
    let addr = tracer.target.alloc_str("DELETE FROM t");
    // %rdi on x86_64
    tracer.target.set_register(112, addr);

    tracer.start_with_arg(5, &UsdtArg::register(112, 8)).unwrap();
    tracer.target.advance(MS);
    tracer.complete(5);

    assert_eq!(drain(&mut tracer)[0].query, "DELETE FROM t");
}

#[test]
fn test_static_start_resolves_stack_argument() {
    let mut tracer = static_tracer(0);
    let text = tracer.target.alloc_str("INSERT INTO t VALUES (1)");
    // Spilled to -8(%rbp)
    let slot = tracer.target.alloc(&text.to_ne_bytes());
    tracer.target.set_register(32, slot + 8);

    tracer.start_with_arg(5, &UsdtArg::deref(32, -8, 8)).unwrap();
    tracer.target.advance(MS);
    tracer.complete(5);

    assert_eq!(drain(&mut tracer)[0].query, "INSERT INTO t VALUES (1)");
}

#[test]
fn test_unreadable_text_is_emitted_empty() {
    let mut tracer = static_tracer(0);
    tracer.start(3, 0xdead_0000).unwrap();
    tracer.target.advance(MS);
    assert_eq!(tracer.complete(3), Completion::EmittedWithoutText);

    let queries = drain(&mut tracer);
    assert_eq!(queries[0].query, "");
    assert_eq!(queries[0].elapsed_ns, MS);
}

#[test]
fn test_unreadable_thd_is_recorded_without_text() {
    let mut tracer = dynamic_tracer(0);
    assert_eq!(tracer.start(3, 0xdead_0000), Ok(Started::RecordedWithoutText));
    tracer.target.advance(MS);
    assert_eq!(tracer.complete(3), Completion::Emitted);

    let queries = drain(&mut tracer);
    assert_eq!(queries[0].query, "");
    assert_eq!(queries[0].query_len, 0);
    assert!(!queries[0].truncated);
}

#[test]
fn test_dispatcher_counts_every_delivery() {
    let mut tracer = static_tracer(0);
    for tid in 1..=5 {
        run_static(&mut tracer, tid, "SELECT 1", MS);
    }

    let mut dispatcher = Dispatcher::new(|_: &FinishedQuery| -> std::io::Result<()> { Ok(()) });
    for record in tracer.take_records() {
        dispatcher.dispatch_record(&record).unwrap();
    }
    assert_eq!(dispatcher.stats(), DispatchStats { delivered: 5, malformed: 0 });
}
