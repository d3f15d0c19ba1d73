use clap::{Args, Parser, Subcommand};
use std::time::Duration;

fn parse_duration(input: &str) -> Result<Duration, String> {
    surge_core::parse_duration(input)
        .map_err(|e| format!("invalid duration '{input}' (expected e.g. 10s, 250ms, 2min): {e}"))
}

fn parse_error_rate(input: &str) -> Result<f64, String> {
    let rate: f64 = input
        .trim()
        .parse()
        .map_err(|_| format!("invalid error rate '{input}'"))?;
    if !(0.0..=1.0).contains(&rate) {
        return Err(format!("error rate must be within [0, 1] (got {rate})"));
    }
    Ok(rate)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable summary.
    HumanReadable,
    /// One JSON line per sample (NDJSON), then a summary line.
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "surge",
    author,
    version,
    about = "Load generation engine with closed and open concurrency models",
    after_help = concat!(
        "Examples:\n",
        "  surge run --users 20 --ramp-up 10s --duration 1min --latency 50ms\n",
        "  surge run --model open --schedule 'rate(50/sec) random_arrivals(10s) pause(5s)'\n",
        "  surge run --users 5 --loops 50 --pacing 'throughput(600/min, all-active)' --output json",
    )
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one thread group against the built-in synthetic sampler
    Run(Box<RunArgs>),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Thread group name
    #[arg(long, default_value = "default")]
    pub name: String,

    /// Concurrency model: closed (fixed pool of looping users) or open (arrival schedule)
    #[arg(long, env = "SURGE_MODEL")]
    pub model: Option<String>,

    /// Closed model: number of virtual users
    #[arg(long)]
    pub users: Option<u64>,

    /// Closed model: time over which user starts are spread (e.g. 10s)
    #[arg(long, value_parser = parse_duration)]
    pub ramp_up: Option<Duration>,

    /// Closed model: iterations per user
    #[arg(long)]
    pub loops: Option<u64>,

    /// Closed model: group duration (e.g. 30s, 2min)
    #[arg(long, value_parser = parse_duration)]
    pub duration: Option<Duration>,

    /// Closed model: delay before the first user starts
    #[arg(long, value_parser = parse_duration)]
    pub delay: Option<Duration>,

    /// Open model: arrival schedule, e.g. "rate(50/sec) random_arrivals(100ms) pause(2s)"
    #[arg(long)]
    pub schedule: Option<String>,

    /// Open model: distribution of random arrivals (uniform or exponential)
    #[arg(long)]
    pub distribution: Option<String>,

    /// Seed for arrival schedules, pacing and sampler randomness
    #[arg(long)]
    pub seed: Option<u64>,

    /// Pacing between iterations: none, fixed(200ms), uniform(100ms, 50ms),
    /// throughput(600/min[, mode])
    #[arg(long)]
    pub pacing: Option<String>,

    /// Action after a failed sample: continue, start-next-loop, stop-user, stop-group,
    /// stop-group-now
    #[arg(long)]
    pub on_error: Option<String>,

    /// Latency of the synthetic sampler
    #[arg(long, value_parser = parse_duration, default_value = "0ms")]
    pub latency: Duration,

    /// Probability in [0, 1] that a synthetic sample fails
    #[arg(long, value_parser = parse_error_rate, default_value_t = 0.0)]
    pub error_rate: f64,

    /// How long a graceful stop waits for users before interrupting them
    #[arg(long, value_parser = parse_duration)]
    pub stop_timeout: Option<Duration>,

    /// How long interrupted users get before they are abandoned
    #[arg(long, value_parser = parse_duration)]
    pub interrupt_grace: Option<Duration>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::HumanReadable)]
    pub output: OutputFormat,
}
