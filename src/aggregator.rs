use crate::parser::FinalizedEntry;
use std::collections::HashMap;

/// Running totals for one normalized query.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedStat {
    pub query: String,
    pub count: u64,
    pub query_time: f64,
    pub lock_time: f64,
    /// Always `query_time + lock_time`.
    pub total_time: f64,
    /// Timestamp of the first entry seen for this query.
    pub unix_timestamp: Option<i64>,
    pub connection_id: Option<u64>,
}

impl AggregatedStat {
    fn from_entry(entry: FinalizedEntry, query_time: f64, lock_time: f64) -> Self {
        Self {
            query: entry.fingerprint,
            count: 1,
            query_time,
            lock_time,
            total_time: query_time + lock_time,
            unix_timestamp: entry.unix_timestamp,
            connection_id: entry.connection_id,
        }
    }

    fn update_with(&mut self, query_time: f64, lock_time: f64) {
        self.count += 1;
        self.query_time += query_time;
        self.lock_time += lock_time;
        self.total_time += query_time + lock_time;
    }
}

/// Groups finalized entries by normalized query, remembering first-seen order.
#[derive(Debug, Default)]
pub struct Aggregator {
    stats: Vec<AggregatedStat>,
    index: HashMap<String, usize>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one entry into the statistics.
    ///
    /// An entry that never saw a `# Query_time` header counts with zero times.
    pub fn merge(&mut self, entry: FinalizedEntry) {
        if entry.query_time.is_none() || entry.lock_time.is_none() {
            tracing::warn!(
                query = %entry.fingerprint,
                "entry has no Query_time header; counting it with zero time"
            );
        }
        let query_time = entry.query_time.unwrap_or(0.0);
        let lock_time = entry.lock_time.unwrap_or(0.0);

        match self.index.get(&entry.fingerprint) {
            Some(&i) => self.stats[i].update_with(query_time, lock_time),
            None => {
                self.index.insert(entry.fingerprint.clone(), self.stats.len());
                self.stats
                    .push(AggregatedStat::from_entry(entry, query_time, lock_time));
            }
        }
    }

    /// Statistics in first-seen order.
    pub fn stats(&self) -> &[AggregatedStat] {
        &self.stats
    }

    pub fn get(&self, query: &str) -> Option<&AggregatedStat> {
        self.index.get(query).map(|&i| &self.stats[i])
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}

/// Aggregates a stream of parsed entries, stopping at the first error.
pub fn aggregate<E>(
    entries: impl Iterator<Item = Result<FinalizedEntry, E>>,
) -> Result<Aggregator, E> {
    let mut aggregator = Aggregator::new();
    for entry in entries {
        aggregator.merge(entry?);
    }
    Ok(aggregator)
}
