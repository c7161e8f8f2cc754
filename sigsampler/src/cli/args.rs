//! CLI argument definitions

use crate::config::{SessionConfig, DEFAULT_SAMPLING_RATE_MS, DEFAULT_THREAD_DETECT_INTERVAL_MS};
use clap::Parser;
use sigsampler_common::tracers;

#[derive(Parser, Debug)]
#[command(
    name = "sigsampler",
    about = "Sample this process's own threads with SIGPROF and summarize the stacks",
    after_help = "\
EXAMPLES:
    sigsampler                               4 busy threads, 2 seconds, CPU clock
    sigsampler --threads 8 --rate 5          Faster sampling of more threads
    sigsampler --wall-clock --json           Wall-clock sampling, JSON summary"
)]
pub struct Args {
    /// Number of busy worker threads to spawn and profile
    #[arg(short, long, default_value = "4")]
    pub threads: usize,

    /// Sampling interval per thread in milliseconds
    #[arg(short, long, default_value_t = DEFAULT_SAMPLING_RATE_MS)]
    pub rate: u32,

    /// How long to profile, in milliseconds
    #[arg(short, long, default_value = "2000")]
    pub duration: u64,

    /// Thread rescan interval in milliseconds (raised to at least 7)
    #[arg(long, default_value_t = DEFAULT_THREAD_DETECT_INTERVAL_MS)]
    pub detect_interval: u32,

    /// Sample on elapsed time instead of thread CPU time (workers only)
    #[arg(long)]
    pub wall_clock: bool,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,

    /// Ring buffer capacity in packets
    #[arg(long, default_value = "65536")]
    pub buffer_packets: usize,
}

impl Args {
    /// Session settings for the native tracer; `workers` feed the whitelist
    pub fn session_config(&self, workers: &[u32]) -> SessionConfig {
        SessionConfig {
            tracers: tracers::NATIVE,
            sampling_rate_ms: self.rate,
            thread_detect_interval_ms: self.detect_interval,
            wall_clock_mode: self.wall_clock,
            whitelist: workers.to_vec(),
        }
    }
}
