//! Column-store stage: wait for replicated spans in ClickHouse.
//!
//! Replication from the row store is asynchronous, so this stage settles
//! first and polls on a longer budget. Payload problems and undecodable
//! rows are reported once each and never affect the outcome.

use super::{short_id, Sighting, StageContext, TraceTally};
use crate::report::{Stage, StageReport};
use async_trait::async_trait;
use spancheck_core::matching::{check_span, CorrelationFilter};
use spancheck_core::store::{ColumnStore, ColumnStoreConnector};
use spancheck_core::{bounded, Bounded, FieldWarning, PollOutcome, Poller, Probe, Progress, StoreError};
use std::collections::BTreeSet;

struct SpanProbe<'a> {
    store: &'a mut dyn ColumnStore,
    filter: &'a CorrelationFilter,
    pipeline_id: &'a str,
    expected: usize,
    tally: TraceTally,
    skipped: BTreeSet<String>,
    warnings: Vec<String>,
}

#[async_trait]
impl<'a> Probe for SpanProbe<'a> {
    type Output = usize;
    type Error = StoreError;

    async fn probe(&mut self) -> Result<Progress<usize>, StoreError> {
        let batch = self.store.recent_spans(self.pipeline_id).await?;

        for error in batch.skipped {
            if self.skipped.insert(error.clone()) {
                let warning = FieldWarning::Undecodable { error };
                tracing::warn!("{}", warning);
                self.warnings.push(warning.to_string());
            }
        }

        for span in batch.spans.iter().filter(|s| self.filter.matches_span(s)) {
            let trace_id = span.trace_id.as_deref().unwrap_or_default();
            match self.tally.record(trace_id, &span.id) {
                Sighting::Unrelated | Sighting::Repeat => continue,
                Sighting::First => {}
                Sighting::Duplicate { rows } => {
                    tracing::warn!(trace_id, rows, "Span replicated more than once");
                }
            }

            tracing::info!(name = %span.name, id = short_id(&span.id), "Found ClickHouse span");
            let warnings = check_span(span);
            if warnings.is_empty() {
                tracing::debug!(name = %span.name, "Payload JSON valid");
            }
            for warning in warnings {
                tracing::warn!(name = %span.name, id = %span.id, "{}", warning);
                self.warnings.push(format!("{}: {}", span.name, warning));
            }
        }

        let found = self.tally.found();
        if found >= self.expected {
            Ok(Progress::Done(found))
        } else {
            tracing::debug!(found, expected = self.expected, "Waiting for replication");
            Ok(Progress::Pending(found))
        }
    }
}

/// Settle, then poll the column store until every emitted trace has a
/// span tagged with `marker`, or `poller.max_wait` (settle included) runs
/// out. Any query error ends the stage immediately.
pub async fn wait_for_replicated_spans(
    ctx: &StageContext<'_>,
    connector: &dyn ColumnStoreConnector,
    marker: &str,
    poller: Poller,
    name_fallback: bool,
) -> StageReport {
    tracing::info!(
        marker,
        settle_s = poller.settle.as_secs(),
        max_wait_s = poller.max_wait.as_secs(),
        "Validating ClickHouse replication (eventually consistent)"
    );
    let started = ctx.clock.now();
    let expected = ctx.expected();

    let mut shutdown = ctx.shutdown.clone();
    let connected = match bounded(ctx.clock, poller.max_wait, &mut shutdown, connector.connect()).await {
        Bounded::Finished(Ok(store)) => Ok(store),
        Bounded::Finished(Err(e)) => {
            tracing::error!(error = %e, "Failed to connect to ClickHouse");
            Err(format!("connect failed: {e}"))
        }
        Bounded::TimedOut => {
            tracing::error!("Timed out connecting to ClickHouse");
            Err(format!("connect timed out after {}s", poller.max_wait.as_secs()))
        }
        Bounded::Interrupted => Err("interrupted before connecting".to_string()),
    };
    let mut store = match connected {
        Ok(store) => store,
        Err(detail) => {
            return StageReport::failed(Stage::ColumnStore, detail)
                .with_counts(0, expected)
                .with_elapsed(ctx.elapsed_since(started));
        }
    };

    let filter = CorrelationFilter::new(marker).with_name_fallback(name_fallback);
    let mut probe = SpanProbe {
        store: store.as_mut(),
        filter: &filter,
        pipeline_id: ctx.pipeline_id,
        expected,
        tally: TraceTally::new(ctx.trace_ids),
        skipped: BTreeSet::new(),
        warnings: Vec::new(),
    };
    let outcome = poller.run(ctx.clock, shutdown, &mut probe).await;
    let SpanProbe { tally, mut warnings, .. } = probe;

    ctx.close("clickhouse", store.close()).await;

    warnings.extend(tally.duplicates().iter().map(ToString::to_string));
    let found = tally.found();
    let report = match outcome {
        Ok(PollOutcome::Ready(_)) => {
            tracing::info!(found, "ClickHouse validation successful");
            StageReport::passed(Stage::ColumnStore, format!("{found}/{expected} spans found"))
        }
        Ok(PollOutcome::TimedOut(_)) => {
            tracing::error!(found, expected, "ClickHouse validation failed");
            StageReport::failed(
                Stage::ColumnStore,
                format!(
                    "timed out after {}s with {found}/{expected} spans",
                    poller.max_wait.as_secs()
                ),
            )
        }
        Ok(PollOutcome::Interrupted(_)) => {
            tracing::warn!(found, "ClickHouse validation interrupted");
            StageReport::failed(Stage::ColumnStore, format!("interrupted with {found}/{expected} spans"))
        }
        Err(e) => {
            tracing::error!(error = %e, "Error querying ClickHouse");
            StageReport::failed(Stage::ColumnStore, format!("query failed: {e}"))
        }
    };

    report
        .with_counts(found, expected)
        .with_warnings(warnings)
        .with_elapsed(ctx.elapsed_since(started))
}
