use thiserror::Error;

/// Errors raised while scanning a slow query log.
#[derive(Error, Debug)]
pub enum ParseError {
    /// A `# Query_time` header did not carry the four expected metrics.
    #[error("malformed Query_time header at line {line_number}: {line}")]
    MalformedTiming { line_number: usize, line: String },

    /// The underlying reader failed.
    #[error("failed to read log: {0}")]
    Io(#[from] std::io::Error),
}
