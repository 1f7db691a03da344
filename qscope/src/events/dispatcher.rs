//! # Event Dispatch
//!
//! Drains the `EVENTS` ring buffer and hands every decoded query to a single
//! [`QueryHandler`], synchronously and in arrival order.
//!
//! The loop only suspends while waiting for ring buffer readiness; shutdown
//! (Ctrl+C, target exit, duration limit) ends it after a final drain.

use aya::maps::{MapData, RingBuf};
use log::{debug, warn};
use std::future::Future;
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio::io::unix::AsyncFd;

use super::decoder::{decode, FinishedQuery};
use super::sweeper::StaleSweeper;
use crate::domain::{Pid, TracerError};

/// How often stale in-flight records are swept
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// How often the target's liveness is checked
const LIVENESS_INTERVAL: Duration = Duration::from_millis(500);

/// Receives every finished query
pub trait QueryHandler {
    /// # Errors
    /// An error stops the dispatcher
    fn handle(&mut self, query: &FinishedQuery) -> io::Result<()>;
}

impl<F> QueryHandler for F
where
    F: FnMut(&FinishedQuery) -> io::Result<()>,
{
    fn handle(&mut self, query: &FinishedQuery) -> io::Result<()> {
        self(query)
    }
}

/// Dispatcher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Queries handed to the handler
    pub delivered: u64,
    /// Records that could not be decoded
    pub malformed: u64,
}

/// Why tracing stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Interrupted,
    TargetExited,
    DurationElapsed,
}

impl ShutdownReason {
    #[must_use]
    pub fn describe(self) -> &'static str {
        match self {
            Self::Interrupted => "interrupted",
            Self::TargetExited => "process exited",
            Self::DurationElapsed => "duration limit reached",
        }
    }
}

pub struct Dispatcher<H: QueryHandler> {
    handler: H,
    stats: DispatchStats,
}

impl<H: QueryHandler> Dispatcher<H> {
    pub fn new(handler: H) -> Self {
        Self { handler, stats: DispatchStats::default() }
    }

    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    pub fn into_handler(self) -> H {
        self.handler
    }

    /// Decode one raw record and deliver it
    ///
    /// Malformed records are counted and skipped.
    ///
    /// # Errors
    /// Returns the handler's error
    pub fn dispatch_record(&mut self, bytes: &[u8]) -> io::Result<()> {
        match decode(bytes) {
            Ok(query) => {
                debug!("query: {:.3}ms {:?}", query.elapsed_ms(), query.query);
                self.handler.handle(&query)?;
                self.stats.delivered += 1;
            }
            Err(e) => {
                warn!("Skipping ring buffer record: {e}");
                self.stats.malformed += 1;
            }
        }
        Ok(())
    }

    /// Consume the ring buffer until `shutdown` resolves
    ///
    /// # Errors
    /// Returns an error if polling the ring buffer or the handler fails
    pub async fn run<S>(
        &mut self,
        ring_buf: RingBuf<MapData>,
        mut sweeper: Option<StaleSweeper>,
        shutdown: S,
    ) -> Result<ShutdownReason, TracerError>
    where
        S: Future<Output = ShutdownReason>,
    {
        let mut fd = AsyncFd::new(ring_buf)?;
        tokio::pin!(shutdown);

        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                reason = &mut shutdown => {
                    // Events emitted before shutdown are still delivered
                    let ring_buf = fd.get_mut();
                    while let Some(item) = ring_buf.next() {
                        self.dispatch_record(&item)?;
                    }
                    return Ok(reason);
                }
                guard = fd.readable_mut() => {
                    let mut guard = guard?;
                    let ring_buf = guard.get_inner_mut();
                    while let Some(item) = ring_buf.next() {
                        self.dispatch_record(&item)?;
                    }
                    guard.clear_ready();
                }
                _ = sweep.tick(), if sweeper.is_some() => {
                    if let Some(sweeper) = sweeper.as_mut() {
                        sweeper.sweep();
                    }
                }
            }
        }
    }
}

/// Resolves on Ctrl+C, when the target exits, or after `limit`
pub async fn wait_for_shutdown(pid: Pid, limit: Option<Duration>) -> ShutdownReason {
    let proc_path = format!("/proc/{}", pid.0);

    let target_exit = async {
        let mut check = tokio::time::interval(LIVENESS_INTERVAL);
        loop {
            check.tick().await;
            if !Path::new(&proc_path).exists() {
                return;
            }
        }
    };

    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => ShutdownReason::Interrupted,
        () = target_exit => ShutdownReason::TargetExited,
        () = deadline => ShutdownReason::DurationElapsed,
    }
}
