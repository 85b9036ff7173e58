pub mod column_store;
pub mod emit;
pub mod health;
pub mod row_store;

use spancheck_core::{bounded, Bounded, Clock, FieldWarning, StoreError};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::sync::watch;

/// How long a store handle gets to close before it is abandoned.
pub(crate) const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// What every validator needs besides its store.
#[derive(Clone)]
pub struct StageContext<'a> {
    pub clock: &'a dyn Clock,
    pub shutdown: Option<watch::Receiver<bool>>,
    pub pipeline_id: &'a str,
    /// Trace ids of the records emitted this run; each must be observed once.
    pub trace_ids: &'a [String],
}

impl StageContext<'_> {
    pub fn expected(&self) -> usize {
        self.trace_ids.len()
    }

    pub fn elapsed_since(&self, started: std::time::Instant) -> Duration {
        self.clock.now().saturating_duration_since(started)
    }

    /// Close a store handle, giving up after [`CLOSE_TIMEOUT`].
    pub(crate) async fn close<F>(&self, store: &str, close: F)
    where
        F: std::future::Future<Output = Result<(), StoreError>>,
    {
        match bounded(self.clock, CLOSE_TIMEOUT, &mut None, close).await {
            Bounded::Finished(Ok(())) => {}
            Bounded::Finished(Err(e)) => {
                tracing::warn!(store, error = %e, "Failed to close store handle");
            }
            Bounded::TimedOut | Bounded::Interrupted => {
                tracing::warn!(
                    store,
                    timeout_s = CLOSE_TIMEOUT.as_secs(),
                    "Abandoned store handle that would not close"
                );
            }
        }
    }
}

/// First eight characters of an id, for log lines.
pub(crate) fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Trace ids may come back hyphenated or upper-case depending on column type.
fn trace_key(trace_id: &str) -> String {
    trace_id
        .chars()
        .filter(|c| *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// What one stored row meant for the tally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Sighting {
    /// Not one of this run's traces.
    Unrelated,
    /// Row id already counted on an earlier poll.
    Repeat,
    /// First row for this trace.
    First,
    /// Another row for a trace that already had one.
    Duplicate { rows: usize },
}

/// Rows seen per emitted trace. A trace counts once however many rows it has.
#[derive(Debug)]
pub(crate) struct TraceTally {
    rows: BTreeMap<String, BTreeSet<String>>,
}

impl TraceTally {
    pub fn new(trace_ids: &[String]) -> Self {
        Self {
            rows: trace_ids.iter().map(|t| (trace_key(t), BTreeSet::new())).collect(),
        }
    }

    pub fn record(&mut self, trace_id: &str, row_id: &str) -> Sighting {
        let Some(rows) = self.rows.get_mut(&trace_key(trace_id)) else {
            return Sighting::Unrelated;
        };
        if !rows.insert(row_id.to_string()) {
            return Sighting::Repeat;
        }
        match rows.len() {
            1 => Sighting::First,
            rows => Sighting::Duplicate { rows },
        }
    }

    /// Emitted traces with at least one stored row.
    pub fn found(&self) -> usize {
        self.rows.values().filter(|r| !r.is_empty()).count()
    }

    pub fn duplicates(&self) -> Vec<FieldWarning> {
        self.rows
            .iter()
            .filter(|(_, r)| r.len() > 1)
            .map(|(trace_id, r)| FieldWarning::DuplicateRecord {
                trace_id: trace_id.clone(),
                rows: r.len(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_tally_counts_traces_not_rows() {
        let mut tally = TraceTally::new(&ids(&["aa", "bb", "cc"]));

        assert_eq!(tally.record("aa", "r1"), Sighting::First);
        assert_eq!(tally.record("aa", "r2"), Sighting::Duplicate { rows: 2 });
        assert_eq!(tally.record("aa", "r1"), Sighting::Repeat);
        assert_eq!(tally.record("bb", "r3"), Sighting::First);
        assert_eq!(tally.record("zz", "r4"), Sighting::Unrelated);

        assert_eq!(tally.found(), 2);
        assert_eq!(
            tally.duplicates(),
            vec![FieldWarning::DuplicateRecord {
                trace_id: "aa".to_string(),
                rows: 2
            }]
        );
    }

    #[test]
    fn test_tally_ignores_trace_id_formatting() {
        let mut tally = TraceTally::new(&ids(&["0af7651916cd43dd8448eb211c80319c"]));

        assert_eq!(
            tally.record("0AF76519-16CD-43DD-8448-EB211C80319C", "r1"),
            Sighting::First
        );
        assert_eq!(tally.found(), 1);
    }
}
