//! # sigsampler - Demo Entry Point
//!
//! Spawns a few CPU-bound worker threads, profiles the whole process with the
//! native frame-pointer tracer for a fixed duration, then decodes the ring
//! buffer and prints a per-thread summary:
//! - **Text** (default): thread table, stack errors, error annotations
//! - **JSON** (`--json`): the same summary plus the session config

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::bounded;
use log::{info, warn};
use serde::Serialize;
use sigsampler::buffer::RingBuffer;
use sigsampler::cli::Args;
use sigsampler::config::SessionConfig;
use sigsampler::domain::{Pid, SamplerError, Tid};
use sigsampler::entries::Logger;
use sigsampler::os;
use sigsampler::profiler::{thread_name, SamplingProfiler};
use sigsampler::report::SessionReport;
use sigsampler::tracer::{NativeTracer, Tracer};
use sigsampler_common::tracers;
use std::hint::black_box;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

const LOGGER_THREAD_NAME: &str = "sampler-logger";

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
    match err.downcast_ref::<SamplerError>() {
        Some(SamplerError::InvalidConfig(_) | SamplerError::NoTracersEnabled { .. }) => EXIT_USAGE,
        _ if err.to_string().starts_with("invalid argument") => EXIT_USAGE,
        _ => EXIT_ERROR,
    }
}

#[derive(Serialize)]
struct JsonSummary<'a> {
    config: &'a SessionConfig,
    duration_ms: u64,
    #[serde(flatten)]
    report: &'a SessionReport,
}

fn run() -> Result<()> {
    let args = Args::parse();
    if args.threads == 0 {
        anyhow::bail!("invalid argument: --threads must be at least 1");
    }
    if args.buffer_packets == 0 {
        anyhow::bail!("invalid argument: --buffer-packets must be at least 1");
    }

    let buffer = Arc::new(RingBuffer::new(args.buffer_packets));
    let logger = Arc::new(Logger::new(Arc::clone(&buffer)));
    let native: Arc<dyn Tracer> = Arc::new(NativeTracer::new(Arc::clone(&logger)));
    let profiler = Arc::new(SamplingProfiler::new(logger));
    profiler
        .initialize(tracers::NATIVE, vec![(tracers::NATIVE, native)])
        .context("Failed to initialize the sampling profiler")?;

    // ── Workers ─────────────────────────────────────────────────────────
    let stop = Arc::new(AtomicBool::new(false));
    let (workers, worker_tids) = spawn_workers(args.threads, &stop)?;
    info!("Spawned {} workers: {worker_tids:?}", workers.len());

    // ── Session ─────────────────────────────────────────────────────────
    let config = args.session_config(&worker_tids);
    let start = buffer.current_tail();
    profiler.start_profiling(&config).context("Failed to start profiling")?;

    let loop_profiler = Arc::clone(&profiler);
    let logger_thread = std::thread::Builder::new()
        .name(LOGGER_THREAD_NAME.into())
        .spawn(move || loop_profiler.logger_loop())
        .context("Failed to spawn the logger thread")?;

    std::thread::sleep(Duration::from_millis(args.duration));

    let counts = profiler.stop_profiling().context("Failed to stop profiling")?;
    match logger_thread.join() {
        Ok(result) => result.context("Logger loop failed")?,
        Err(_) => warn!("Logger thread panicked"),
    }

    stop.store(true, Ordering::Release);
    for worker in workers {
        if worker.join().is_err() {
            warn!("Worker thread panicked");
        }
    }
    info!(
        "Session errors: {} signal crashes, {} slot misses, {} stack overflows",
        counts.signal_crashes, counts.slot_misses, counts.stack_overflows
    );

    // ── Summary ─────────────────────────────────────────────────────────
    let mut report = SessionReport::collect(buffer, start);
    let pid = Pid::current();
    report.name_threads(|tid| thread_name(pid, Tid(tid)));

    if args.json {
        let summary = JsonSummary { config: &config, duration_ms: args.duration, report: &report };
        println!("{}", serde_json::to_string_pretty(&summary).context("Failed to serialize summary")?);
    } else {
        println!("sigsampler v{}", env!("CARGO_PKG_VERSION"));
        println!("pid: {}  duration: {} ms  rate: {} ms", pid.0, args.duration, args.rate);
        print!("{report}");
    }

    Ok(())
}

/// Start `count` spinning workers; returns their handles and kernel tids
fn spawn_workers(count: usize, stop: &Arc<AtomicBool>) -> Result<(Vec<JoinHandle<()>>, Vec<u32>)> {
    let (tid_tx, tid_rx) = bounded(count);
    let mut handles = Vec::with_capacity(count);

    for index in 0..count {
        let stop = Arc::clone(stop);
        let tid_tx = tid_tx.clone();
        let handle = std::thread::Builder::new()
            .name(format!("worker-{index}"))
            .spawn(move || {
                let _ = tid_tx.send(os::thread_id());
                let mut seed = index as u64 + 1;
                while !stop.load(Ordering::Relaxed) {
                    seed = black_box(outer_work(seed));
                }
            })
            .with_context(|| format!("Failed to spawn worker {index}"))?;
        handles.push(handle);
    }
    drop(tid_tx);

    let tids = tid_rx.iter().take(count).collect();
    Ok((handles, tids))
}

#[inline(never)]
fn outer_work(seed: u64) -> u64 {
    (0..64).fold(seed, |acc, i| inner_work(acc ^ i))
}

#[inline(never)]
fn inner_work(mut x: u64) -> u64 {
    for _ in 0..256 {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
    }
    black_box(x)
}
