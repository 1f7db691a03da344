//! # qscope - Main Entry Point
//!
//! Plans the attachment, runs pre-flight checks, attaches one probe pair and
//! streams traced queries to stdout until Ctrl+C, target exit or `--duration`.
//! Status output goes to stderr so stdout stays machine-readable.

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::io;

use qscope::attach::{self, AttachPlan, AttachedTracer};
use qscope::cli::Args;
use qscope::clock::WallClock;
use qscope::config::{OutputFormat, TraceConfig};
use qscope::domain::TracerError;
use qscope::events::{
    wait_for_shutdown, Dispatcher, JsonHandler, QueryHandler, StaleSweeper, TextHandler,
};
use qscope::preflight::run_preflight_checks;
use qscope::version::CommandVersionSource;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(TracerError::Configuration(_)) = err.downcast_ref::<TracerError>() {
        return EXIT_USAGE;
    }
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied")
        || msg.contains("requires root")
        || msg.contains("operation not permitted")
    {
        EXIT_NOPERM
    } else {
        EXIT_ERROR
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let config = TraceConfig::from_args(&args)?;

    run_preflight_checks(&config)?;

    // Version and probe sites are settled before anything touches the kernel
    let plan = attach::plan(&config, &CommandVersionSource)?;

    if !config.quiet {
        eprintln!("qscope v{}", env!("CARGO_PKG_VERSION"));
        eprintln!("target: {}", config.target_display());
        eprintln!("pid: {}", config.target_pid.0);
        match &plan {
            AttachPlan::Static(_) => eprintln!("mode: usdt (mysql:query__exec__start/done)"),
            AttachPlan::Dynamic(dynamic) => eprintln!(
                "mode: uprobe ({} mysql_execute_command symbols, MySQL {})",
                dynamic.functions.len(),
                dynamic.version
            ),
        }
        eprintln!("threshold: {}ms", args.threshold);
    }

    let mut tracer = attach::attach(&config, &plan).context("Failed to attach probes")?;
    info!("✓ {} probes attached", plan.probe_count());

    let clock = WallClock::now();
    let stdout = io::stdout().lock();
    match config.format {
        OutputFormat::Text => trace(&config, &mut tracer, TextHandler::new(stdout, clock)).await,
        OutputFormat::Json => trace(&config, &mut tracer, JsonHandler::new(stdout, clock)).await,
    }
}

async fn trace<H: QueryHandler>(
    config: &TraceConfig,
    tracer: &mut AttachedTracer,
    handler: H,
) -> Result<()> {
    let ring_buf = tracer.take_events()?;
    let sweeper = match config.stale_after {
        Some(max_age) => Some(StaleSweeper::new(tracer.take_inflight()?, max_age)),
        None => None,
    };

    let started = std::time::Instant::now();
    let mut dispatcher = Dispatcher::new(handler);
    let reason = dispatcher
        .run(ring_buf, sweeper, wait_for_shutdown(config.target_pid, config.duration))
        .await?;

    if !config.quiet {
        let dispatched = dispatcher.stats();
        eprintln!(
            "\n{}: {:.1}s, {} queries ({} malformed records)",
            reason.describe(),
            started.elapsed().as_secs_f64(),
            dispatched.delivered,
            dispatched.malformed,
        );
        match tracer.probe_stats() {
            Ok(stats) => eprintln!("probes: {stats}"),
            Err(e) => eprintln!("warning: probe statistics unavailable: {e}"),
        }
    }

    Ok(())
}
