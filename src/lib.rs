pub mod aggregator;
pub mod error;
pub mod fingerprint;
pub mod parser;
pub mod report;

use anyhow::Context;
use chrono::FixedOffset;
use parser::LogMode;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Everything a run needs to know.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub input: PathBuf,
    pub mode: LogMode,
    pub timing_output: PathBuf,
    pub connections_output: PathBuf,
    /// Fixed offset for the connections report; local time when `None`.
    pub timezone: Option<FixedOffset>,
    /// Rows in the console summary; `0` prints nothing.
    pub limit: usize,
    pub progress_interval: usize,
}

/// What a finished run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub lines: usize,
    pub distinct_queries: usize,
    pub connection_buckets: usize,
}

/// Reads the whole log, then writes both reports.
///
/// Nothing is written if the log cannot be read or parsed to the end.
pub fn run(config: &RunConfig, console: &mut dyn Write) -> anyhow::Result<RunSummary> {
    let file = File::open(&config.input)
        .with_context(|| format!("could not open {}", config.input.display()))?;
    tracing::info!(path = %config.input.display(), mode = ?config.mode, "reading slow query log");

    let mut entries = parser::parse_log(BufReader::new(file), config.mode)
        .with_progress_interval(config.progress_interval);
    let stats = aggregator::aggregate(entries.by_ref())
        .with_context(|| format!("failed to parse {}", config.input.display()))?;
    let lines = entries.lines_read();
    tracing::info!(lines, distinct_queries = stats.len(), "finished reading log");

    let rows = report::timing_rows(&stats);
    let buckets = report::connection_buckets(&stats);

    write_file(&config.timing_output, |w| report::write_timing_csv(&rows, w))?;
    write_file(&config.connections_output, |w| {
        report::write_connections_csv(&buckets, config.timezone.as_ref(), w)
    })?;

    if config.limit > 0 && !rows.is_empty() {
        report::print_summary(&rows, config.limit, console)?;
    }

    Ok(RunSummary {
        lines,
        distinct_queries: stats.len(),
        connection_buckets: buckets.len(),
    })
}

fn write_file(
    path: &Path,
    write: impl FnOnce(&mut dyn Write) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("could not create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    write(&mut writer)?;
    writer.flush()?;
    tracing::info!(path = %path.display(), "report written");
    Ok(())
}
