//! Output handlers for finished queries

use serde::Serialize;
use std::io::{self, Write};

use super::decoder::FinishedQuery;
use super::dispatcher::QueryHandler;
use crate::clock::{format_epoch, WallClock};

/// Tab-separated lines: `<epoch>\t<elapsed ms>\t<len> (<truncated>)\t<query>`
pub struct TextHandler<W: Write> {
    out: W,
    clock: WallClock,
}

impl<W: Write> TextHandler<W> {
    pub fn new(out: W, clock: WallClock) -> Self {
        Self { out, clock }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> QueryHandler for TextHandler<W> {
    fn handle(&mut self, query: &FinishedQuery) -> io::Result<()> {
        writeln!(
            self.out,
            "{}\t{:.1}\t{} ({})\t{}",
            format_epoch(self.clock.epoch_ns(query.timestamp_ns)),
            query.elapsed_ms(),
            query.query_len,
            u8::from(query.truncated),
            query.query
        )?;
        self.out.flush()
    }
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    /// Query start as Unix epoch nanoseconds
    epoch_ns: u64,
    elapsed_ms: f64,
    #[serde(flatten)]
    query: &'a FinishedQuery,
}

/// One JSON object per line
pub struct JsonHandler<W: Write> {
    out: W,
    clock: WallClock,
}

impl<W: Write> JsonHandler<W> {
    pub fn new(out: W, clock: WallClock) -> Self {
        Self { out, clock }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> QueryHandler for JsonHandler<W> {
    fn handle(&mut self, query: &FinishedQuery) -> io::Result<()> {
        let record = JsonRecord {
            epoch_ns: self.clock.epoch_ns(query.timestamp_ns),
            elapsed_ms: query.elapsed_ms(),
            query,
        };
        serde_json::to_writer(&mut self.out, &record)?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }
}
