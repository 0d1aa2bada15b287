use anyhow::Context;
use clap::Parser;
use rds_slowlog_csv::parser::LogMode;
use rds_slowlog_csv::{run, RunConfig};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the slow query log file
    input: PathBuf,

    /// Log layout
    #[arg(long, value_enum, default_value_t = LogMode::Standard)]
    mode: LogMode,

    /// Shorthand for `--mode cloudwatch`
    #[arg(long, conflicts_with = "mode")]
    cloudwatch: bool,

    /// Where to write per-query timing statistics
    #[arg(long, default_value = "query-times.csv")]
    timing_output: PathBuf,

    /// Where to write per-timestamp connection statistics
    #[arg(long, default_value = "connections.csv")]
    connections_output: PathBuf,

    /// Timezone offset for the connections report (e.g., "+09:00"); local time if omitted
    #[arg(long)]
    timezone: Option<String>,

    /// Number of queries to show in the console summary (0 disables it)
    #[arg(long, default_value_t = 20)]
    limit: usize,

    /// Log progress every N lines (0 disables it)
    #[arg(long, default_value_t = 100_000)]
    progress_interval: usize,

    /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level);

    let timezone = args
        .timezone
        .as_deref()
        .map(|tz| {
            tz.parse::<chrono::FixedOffset>()
                .with_context(|| format!("invalid timezone offset '{}'", tz))
        })
        .transpose()?;

    let config = RunConfig {
        input: args.input,
        mode: if args.cloudwatch { LogMode::Cloudwatch } else { args.mode },
        timing_output: args.timing_output,
        connections_output: args.connections_output,
        timezone,
        limit: args.limit,
        progress_interval: args.progress_interval,
    };

    let summary = run(&config, &mut std::io::stdout())?;
    tracing::info!(
        lines = summary.lines,
        queries = summary.distinct_queries,
        timestamps = summary.connection_buckets,
        "done"
    );

    Ok(())
}
