//! Event channel consumer side
//!
//! - [`decoder`]: raw ring buffer records → [`FinishedQuery`]
//! - [`dispatcher`]: drains the ring buffer into one [`QueryHandler`]
//! - [`display`]: text and JSON-lines handlers
//! - [`diagnostics`]: probe outcome counters
//! - [`sweeper`]: eviction of in-flight records that never completed

pub mod decoder;
pub mod diagnostics;
pub mod dispatcher;
pub mod display;
pub mod sweeper;

pub use decoder::{decode, FinishedQuery};
pub use diagnostics::ProbeStats;
pub use dispatcher::{wait_for_shutdown, DispatchStats, Dispatcher, QueryHandler, ShutdownReason};
pub use display::{JsonHandler, TextHandler};
pub use sweeper::StaleSweeper;
