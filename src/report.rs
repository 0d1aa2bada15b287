use crate::aggregator::{AggregatedStat, Aggregator};
use crate::fingerprint::query_id;
use chrono::{DateTime, FixedOffset, Local};
use std::collections::BTreeMap;
use std::io::Write;
use tabled::{Table, Tabled};

/// Longest field value written to a CSV cell, elision marker included.
pub const MAX_FIELD_LENGTH: usize = 50_000;
const ELISION: &str = "...";

const TIMING_HEADER: [&str; 6] = [
    "Total Time",
    "Total Query Time",
    "Total Lock Time",
    "Average Time",
    "Count",
    "Query",
];
const CONNECTIONS_HEADER: [&str; 3] = ["Time", "Connection Count", "Queries"];

/// One line of the timing report.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingRow {
    pub total_time: f64,
    pub query_time: f64,
    pub lock_time: f64,
    pub average_time: f64,
    pub count: u64,
    pub query: String,
}

impl From<&AggregatedStat> for TimingRow {
    fn from(stat: &AggregatedStat) -> Self {
        Self {
            total_time: stat.total_time,
            query_time: stat.query_time,
            lock_time: stat.lock_time,
            average_time: stat.total_time / stat.count as f64,
            count: stat.count,
            query: stat.query.clone(),
        }
    }
}

/// Distinct queries first seen at one timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionBucket {
    pub unix_timestamp: Option<i64>,
    pub queries: Vec<String>,
}

impl ConnectionBucket {
    pub fn count(&self) -> usize {
        self.queries.len()
    }
}

/// Timing rows, slowest total first. Ties keep first-seen order.
pub fn timing_rows(aggregator: &Aggregator) -> Vec<TimingRow> {
    let mut rows: Vec<TimingRow> = aggregator.stats().iter().map(TimingRow::from).collect();
    rows.sort_by(|a, b| b.total_time.total_cmp(&a.total_time));
    rows
}

/// Queries grouped by first-seen timestamp, earliest first.
///
/// Stats without a timestamp share one bucket, placed before all others.
pub fn connection_buckets(aggregator: &Aggregator) -> Vec<ConnectionBucket> {
    let mut grouped: BTreeMap<Option<i64>, Vec<String>> = BTreeMap::new();
    for stat in aggregator.stats() {
        grouped
            .entry(stat.unix_timestamp)
            .or_default()
            .push(stat.query.clone());
    }
    grouped
        .into_iter()
        .map(|(unix_timestamp, queries)| ConnectionBucket {
            unix_timestamp,
            queries,
        })
        .collect()
}

/// Quotes a CSV field, doubling embedded quotes and shortening oversized values.
pub fn csv_field(value: &str) -> String {
    let value = if value.chars().count() > MAX_FIELD_LENGTH {
        let mut kept: String = value.chars().take(MAX_FIELD_LENGTH - ELISION.len()).collect();
        kept.push_str(ELISION);
        kept
    } else {
        value.to_string()
    };
    format!("\"{}\"", value.replace('"', "\"\""))
}

fn write_row<S: AsRef<str>>(writer: &mut dyn Write, fields: &[S]) -> std::io::Result<()> {
    let line = fields
        .iter()
        .map(|f| csv_field(f.as_ref()))
        .collect::<Vec<_>>()
        .join(",");
    writeln!(writer, "{}", line)
}

/// Renders a Unix timestamp as `YYYY-MM-DD HH:MM:SS`, in `offset` or local time.
pub fn format_timestamp(unix_timestamp: Option<i64>, offset: Option<&FixedOffset>) -> String {
    let Some(dt) = unix_timestamp.and_then(|ts| DateTime::from_timestamp(ts, 0)) else {
        return "N/A".to_string();
    };
    const FORMAT: &str = "%Y-%m-%d %H:%M:%S";
    match offset {
        Some(offset) => dt.with_timezone(offset).format(FORMAT).to_string(),
        None => dt.with_timezone(&Local).format(FORMAT).to_string(),
    }
}

pub fn write_timing_csv(rows: &[TimingRow], writer: &mut dyn Write) -> anyhow::Result<()> {
    write_row(writer, &TIMING_HEADER)?;
    for row in rows {
        write_row(
            writer,
            &[
                row.total_time.to_string(),
                row.query_time.to_string(),
                row.lock_time.to_string(),
                row.average_time.to_string(),
                row.count.to_string(),
                row.query.clone(),
            ],
        )?;
    }
    Ok(())
}

pub fn write_connections_csv(
    buckets: &[ConnectionBucket],
    offset: Option<&FixedOffset>,
    writer: &mut dyn Write,
) -> anyhow::Result<()> {
    write_row(writer, &CONNECTIONS_HEADER)?;
    for bucket in buckets {
        write_row(
            writer,
            &[
                format_timestamp(bucket.unix_timestamp, offset),
                bucket.count().to_string(),
                bucket.queries.join("\n"),
            ],
        )?;
    }
    Ok(())
}

#[derive(Tabled)]
struct Row {
    #[tabled(rename = "Rank")]
    rank: usize,
    #[tabled(rename = "Count")]
    count: u64,
    #[tabled(rename = "Total Time")]
    total_time: String,
    #[tabled(rename = "Mean Time")]
    mean_time: String,
    #[tabled(rename = "Query ID")]
    query_id: String,
    #[tabled(rename = "Query")]
    query: String,
}

/// Prints the slowest `limit` queries as a table.
pub fn print_summary(rows: &[TimingRow], limit: usize, writer: &mut dyn Write) -> anyhow::Result<()> {
    let rows: Vec<Row> = rows
        .iter()
        .take(limit)
        .enumerate()
        .map(|(i, row)| Row {
            rank: i + 1,
            count: row.count,
            total_time: format!("{:.3}s", row.total_time),
            mean_time: format!("{:.3}s", row.average_time),
            query_id: query_id(&row.query),
            query: shorten_query(&row.query),
        })
        .collect();

    let table = Table::new(rows).to_string();
    writeln!(writer, "{}", table)?;
    Ok(())
}

fn shorten_query(query: &str) -> String {
    let q = query.replace('\n', " ");
    if q.chars().count() > 50 {
        let mut short: String = q.chars().take(47).collect();
        short.push_str(ELISION);
        short
    } else {
        q
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::RawEntry;

    fn merge(agg: &mut Aggregator, sql: &str, query_time: f64, lock_time: f64, ts: Option<i64>) {
        let raw = RawEntry {
            query_text: sql.to_string(),
            query_time: Some(query_time),
            lock_time: Some(lock_time),
            unix_timestamp: ts,
            connection_id: None,
        };
        agg.merge(raw.finalize().unwrap());
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    #[test]
    fn test_timing_rows_sorted_descending_with_stable_ties() {
        let mut agg = Aggregator::new();
        merge(&mut agg, "SELECT a", 1.0, 0.0, None);
        merge(&mut agg, "SELECT b", 3.0, 0.0, None);
        merge(&mut agg, "SELECT c", 1.0, 0.0, None);
        merge(&mut agg, "SELECT d", 2.0, 0.0, None);

        let queries: Vec<String> = timing_rows(&agg).into_iter().map(|r| r.query).collect();
        assert_eq!(queries, ["SELECT b", "SELECT d", "SELECT a", "SELECT c"]);
    }

    #[test]
    fn test_timing_row_average() {
        let mut agg = Aggregator::new();
        merge(&mut agg, "SELECT 1", 1.0, 0.5, None);
        merge(&mut agg, "SELECT 2", 2.0, 0.5, None);

        let row = &timing_rows(&agg)[0];
        assert_eq!(row.total_time, 4.0);
        assert_eq!(row.average_time, 2.0);
        assert_eq!(row.count, 2);
    }

    #[test]
    fn test_connection_buckets_ascending() {
        let mut agg = Aggregator::new();
        merge(&mut agg, "SELECT a", 1.0, 0.0, Some(300));
        merge(&mut agg, "SELECT b", 1.0, 0.0, Some(100));
        merge(&mut agg, "SELECT c", 1.0, 0.0, Some(300));
        merge(&mut agg, "SELECT d", 1.0, 0.0, None);

        let buckets = connection_buckets(&agg);
        let keys: Vec<Option<i64>> = buckets.iter().map(|b| b.unix_timestamp).collect();
        assert_eq!(keys, [None, Some(100), Some(300)]);
        assert_eq!(buckets[2].count(), 2);
        assert_eq!(buckets[2].queries, ["SELECT a", "SELECT c"]);
    }

    #[test]
    fn test_csv_field_escapes_quotes() {
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field(""), "\"\"");
    }

    #[test]
    fn test_csv_field_truncates() {
        let long = "x".repeat(MAX_FIELD_LENGTH + 10);
        let field = csv_field(&long);
        let inner = &field[1..field.len() - 1];
        assert_eq!(inner.chars().count(), MAX_FIELD_LENGTH);
        assert!(inner.ends_with("..."));

        let exact = "y".repeat(MAX_FIELD_LENGTH);
        assert_eq!(csv_field(&exact).len(), MAX_FIELD_LENGTH + 2);
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(Some(1672531200), Some(&utc())), "2023-01-01 00:00:00");
        let tokyo = FixedOffset::east_opt(9 * 3600).unwrap();
        assert_eq!(format_timestamp(Some(1672531200), Some(&tokyo)), "2023-01-01 09:00:00");
        assert_eq!(format_timestamp(None, Some(&utc())), "N/A");
    }

    #[test]
    fn test_write_timing_csv() {
        let mut agg = Aggregator::new();
        merge(&mut agg, "SELECT * FROM t WHERE id = 5;", 1.5, 0.2, Some(1672531200));

        let mut out = Vec::new();
        write_timing_csv(&timing_rows(&agg), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert_eq!(
            text,
            "\"Total Time\",\"Total Query Time\",\"Total Lock Time\",\"Average Time\",\"Count\",\"Query\"\n\
             \"1.7\",\"1.5\",\"0.2\",\"1.7\",\"1\",\"SELECT * FROM t WHERE id = ?;\"\n"
        );
    }

    #[test]
    fn test_write_connections_csv() {
        let mut agg = Aggregator::new();
        merge(&mut agg, "SELECT a", 1.0, 0.0, Some(1672531200));
        merge(&mut agg, "SELECT b", 1.0, 0.0, Some(1672531200));
        merge(&mut agg, "SELECT c", 1.0, 0.0, None);

        let mut out = Vec::new();
        write_connections_csv(&connection_buckets(&agg), Some(&utc()), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert_eq!(
            text,
            "\"Time\",\"Connection Count\",\"Queries\"\n\
             \"N/A\",\"1\",\"SELECT c\"\n\
             \"2023-01-01 00:00:00\",\"2\",\"SELECT a\nSELECT b\"\n"
        );
    }

    #[test]
    fn test_print_summary_limits_rows() {
        let mut agg = Aggregator::new();
        merge(&mut agg, "SELECT a", 2.0, 0.0, None);
        merge(&mut agg, "SELECT b", 1.0, 0.0, None);

        let mut out = Vec::new();
        print_summary(&timing_rows(&agg), 1, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("Query ID"));
        assert!(text.contains("SELECT a"));
        assert!(!text.contains("SELECT b"));
        assert!(text.contains(&query_id("SELECT a")));
    }

    #[test]
    fn test_shorten_query() {
        assert_eq!(shorten_query("SELECT\n1"), "SELECT 1");
        let long = format!("SELECT {}", "c, ".repeat(30));
        let short = shorten_query(&long);
        assert_eq!(short.chars().count(), 50);
        assert!(short.ends_with("..."));
    }
}
