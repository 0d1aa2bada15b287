use crate::error::ParseError;
use crate::fingerprint::normalize;
use regex::Regex;
use std::io::BufRead;
use std::mem;
use std::sync::OnceLock;

/// Layout of the log being scanned.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogMode {
    /// Plain slow query log: `# Time:` starts the line.
    #[default]
    Standard,
    /// CloudWatch export: each line carries extra leading fields.
    Cloudwatch,
}

/// A log record still being assembled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawEntry {
    pub query_text: String,
    pub query_time: Option<f64>,
    pub lock_time: Option<f64>,
    pub unix_timestamp: Option<i64>,
    pub connection_id: Option<u64>,
}

impl RawEntry {
    /// Commits the entry, or returns `None` when it holds no query once normalized.
    pub fn finalize(self) -> Option<FinalizedEntry> {
        let fingerprint = normalize(&self.query_text);
        if fingerprint.is_empty() {
            return None;
        }
        Some(FinalizedEntry {
            query_text: self.query_text,
            fingerprint,
            query_time: self.query_time,
            lock_time: self.lock_time,
            unix_timestamp: self.unix_timestamp,
            connection_id: self.connection_id,
        })
    }
}

/// A committed log record, ready for aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedEntry {
    pub query_text: String,
    /// `normalize(query_text)`, never empty.
    pub fingerprint: String,
    pub query_time: Option<f64>,
    pub lock_time: Option<f64>,
    pub unix_timestamp: Option<i64>,
    pub connection_id: Option<u64>,
}

#[derive(Debug, Default)]
enum EntryState {
    #[default]
    Idle,
    Accumulating(RawEntry),
}

const BOUNDARY_MARKER: &str = "# Time:";

const NOISE_PREFIXES: [&str; 7] = [
    "#",
    "Tcp port:",
    "use ",
    "/* ",
    "/rdsdbbin",
    "@timestamp,@message",
    "Time         ",
];

static RE_TIMING: OnceLock<Regex> = OnceLock::new();
static RE_TIMESTAMP: OnceLock<Regex> = OnceLock::new();
static RE_TRAILING_INT: OnceLock<Regex> = OnceLock::new();
static RE_CONNECTION_ID: OnceLock<Regex> = OnceLock::new();

/// Rebuilds log records one line at a time.
///
/// Records are only committed when the next `# Time:` boundary arrives, so
/// the record after the last boundary is never emitted by `process_line`.
#[derive(Debug, Default)]
pub struct EntryAccumulator {
    mode: LogMode,
    state: EntryState,
}

impl EntryAccumulator {
    pub fn new(mode: LogMode) -> Self {
        Self {
            mode,
            state: EntryState::Idle,
        }
    }

    /// Classifies one line. Returns the previous record when `line` is a boundary.
    pub fn process_line(
        &mut self,
        line: &str,
        line_number: usize,
    ) -> Result<Option<FinalizedEntry>, ParseError> {
        if self.is_boundary(line) {
            return Ok(match mem::take(&mut self.state) {
                EntryState::Idle => None,
                EntryState::Accumulating(entry) => entry.finalize(),
            });
        }

        if line.starts_with("# Query_time") {
            let re = RE_TIMING.get_or_init(|| {
                Regex::new(r"Query_time:\s*([\d.]+)\s+Lock_time:\s*([\d.]+)\s+Rows_sent:\s*([\d.]+)\s+Rows_examined:\s*([\d.]+)").unwrap()
            });
            let malformed = || ParseError::MalformedTiming {
                line_number,
                line: line.to_string(),
            };
            let caps = re.captures(line).ok_or_else(malformed)?;
            let query_time: f64 = caps[1].parse().map_err(|_| malformed())?;
            let lock_time: f64 = caps[2].parse().map_err(|_| malformed())?;
            let entry = self.current();
            entry.query_time = Some(query_time);
            entry.lock_time = Some(lock_time);
        } else if line.starts_with("SET timestamp=") {
            let re = RE_TIMESTAMP.get_or_init(|| Regex::new(r"^SET timestamp=(\d+)").unwrap());
            let parsed = re.captures(line).and_then(|caps| caps[1].parse().ok());
            match parsed {
                Some(ts) => self.current().unix_timestamp = Some(ts),
                None => {
                    tracing::debug!(line_number, "ignoring unparseable timestamp: {}", line);
                    self.current();
                }
            }
        } else if line.starts_with("# Thread_id:") {
            let re = RE_TRAILING_INT.get_or_init(|| Regex::new(r"(\d+)\s*$").unwrap());
            self.set_connection_id(re, line, line_number);
        } else if line.starts_with("# User@Host") {
            let re = RE_CONNECTION_ID.get_or_init(|| Regex::new(r"Id:\s*(\d+)").unwrap());
            self.set_connection_id(re, line, line_number);
        } else if NOISE_PREFIXES.iter().any(|prefix| line.starts_with(prefix)) {
            // Headers and session statements carry no query content.
        } else {
            self.current().query_text.push_str(line);
        }

        Ok(None)
    }

    /// Consumes the accumulator, handing back the record that never saw a closing boundary.
    pub fn finish(self) -> Option<RawEntry> {
        match self.state {
            EntryState::Idle => None,
            EntryState::Accumulating(entry) => Some(entry),
        }
    }

    fn is_boundary(&self, line: &str) -> bool {
        match self.mode {
            LogMode::Standard => line.starts_with(BOUNDARY_MARKER),
            LogMode::Cloudwatch => line.contains(BOUNDARY_MARKER),
        }
    }

    fn current(&mut self) -> &mut RawEntry {
        if let EntryState::Idle = self.state {
            self.state = EntryState::Accumulating(RawEntry::default());
        }
        match &mut self.state {
            EntryState::Accumulating(entry) => entry,
            EntryState::Idle => unreachable!("state was just set to Accumulating"),
        }
    }

    fn set_connection_id(&mut self, re: &Regex, line: &str, line_number: usize) {
        let parsed = re.captures(line).and_then(|caps| caps[1].parse().ok());
        let entry = self.current();
        match parsed {
            Some(id) => entry.connection_id = Some(id),
            None => tracing::debug!(line_number, "no connection id in: {}", line),
        }
    }
}

/// Streams finalized entries out of a slow query log.
pub struct LogParser<R> {
    reader: R,
    accumulator: Option<EntryAccumulator>,
    read_buffer: Vec<u8>,
    line_number: usize,
    progress_interval: usize,
}

impl<R: BufRead> LogParser<R> {
    /// Creates a new `LogParser` for the given reader.
    pub fn new(reader: R, mode: LogMode) -> Self {
        Self {
            reader,
            accumulator: Some(EntryAccumulator::new(mode)),
            read_buffer: Vec::new(),
            line_number: 0,
            progress_interval: 0,
        }
    }

    /// Logs progress every `interval` lines; `0` keeps quiet.
    pub fn with_progress_interval(mut self, interval: usize) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Number of lines consumed so far.
    pub fn lines_read(&self) -> usize {
        self.line_number
    }

    fn read_line(&mut self) -> Result<Option<String>, ParseError> {
        self.read_buffer.clear();
        if self.reader.read_until(b'\n', &mut self.read_buffer)? == 0 {
            return Ok(None);
        }
        if self.read_buffer.ends_with(b"\n") {
            self.read_buffer.pop();
            if self.read_buffer.ends_with(b"\r") {
                self.read_buffer.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&self.read_buffer).into_owned()))
    }

    fn close(&mut self) {
        if let Some(pending) = self.accumulator.take().and_then(EntryAccumulator::finish) {
            if !pending.query_text.is_empty() {
                tracing::warn!(
                    lines = self.line_number,
                    "log ends without a closing `# Time:` line; last entry not counted"
                );
            }
        }
    }
}

impl<R: BufRead> Iterator for LogParser<R> {
    type Item = Result<FinalizedEntry, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.accumulator.as_ref()?;

        loop {
            let line = match self.read_line() {
                Ok(Some(line)) => line,
                Ok(None) => {
                    self.close();
                    return None;
                }
                Err(e) => {
                    self.accumulator = None;
                    return Some(Err(e));
                }
            };
            self.line_number += 1;

            if self.progress_interval > 0 && self.line_number % self.progress_interval == 0 {
                tracing::info!(lines = self.line_number, "processing log");
            }

            let accumulator = self.accumulator.as_mut()?;
            match accumulator.process_line(&line, self.line_number) {
                Ok(Some(entry)) => return Some(Ok(entry)),
                Ok(None) => {}
                Err(e) => {
                    self.accumulator = None;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Convenience function to create a `LogParser`.
pub fn parse_log<R: BufRead>(reader: R, mode: LogMode) -> LogParser<R> {
    LogParser::new(reader, mode)
}
