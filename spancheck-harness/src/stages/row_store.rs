//! Row-store stage: wait for the run's spans to land in Postgres.

use super::{short_id, Sighting, StageContext, TraceTally};
use crate::report::{Stage, StageReport};
use async_trait::async_trait;
use spancheck_core::matching::{check_row, CorrelationFilter};
use spancheck_core::store::{RowStore, RowStoreConnector};
use spancheck_core::{bounded, Bounded, PollOutcome, Poller, Probe, Progress, StoreError};

/// One poll against the row store. Sightings accumulate across polls.
struct RowProbe<'a> {
    store: &'a mut dyn RowStore,
    filter: &'a CorrelationFilter,
    pipeline_id: &'a str,
    expected: usize,
    tally: TraceTally,
    warnings: Vec<String>,
}

#[async_trait]
impl<'a> Probe for RowProbe<'a> {
    type Output = usize;
    type Error = StoreError;

    async fn probe(&mut self) -> Result<Progress<usize>, StoreError> {
        let rows = self.store.recent_rows(self.pipeline_id).await?;

        for row in rows.iter().filter(|r| self.filter.matches_row(r)) {
            match self.tally.record(&row.trace_id, &row.id) {
                Sighting::Unrelated | Sighting::Repeat => continue,
                Sighting::First => {}
                Sighting::Duplicate { rows } => {
                    tracing::warn!(trace_id = %row.trace_id, rows, "Record stored more than once");
                }
            }
            tracing::info!(
                name = %row.name,
                span_type = row.span_type.as_deref().unwrap_or("-"),
                trace_id = short_id(&row.trace_id),
                "Found span"
            );
            for warning in check_row(row, self.pipeline_id) {
                tracing::warn!(name = %row.name, id = %row.id, "{}", warning);
                self.warnings.push(format!("{}: {}", row.name, warning));
            }
        }

        let found = self.tally.found();
        if found >= self.expected {
            Ok(Progress::Done(found))
        } else {
            tracing::debug!(found, expected = self.expected, "Waiting for more rows");
            Ok(Progress::Pending(found))
        }
    }
}

/// Poll the row store until every emitted trace has a row tagged with
/// `marker`, or `poller.max_wait` runs out.
///
/// The connection is opened here and closed before returning, whatever the
/// outcome. Connecting is bounded by the same budget.
pub async fn wait_for_rows(
    ctx: &StageContext<'_>,
    connector: &dyn RowStoreConnector,
    marker: &str,
    poller: Poller,
) -> StageReport {
    tracing::info!(marker, max_wait_s = poller.max_wait.as_secs(), "Validating Postgres ingestion");
    let started = ctx.clock.now();
    let expected = ctx.expected();

    let mut shutdown = ctx.shutdown.clone();
    let connected = match bounded(ctx.clock, poller.max_wait, &mut shutdown, connector.connect()).await {
        Bounded::Finished(Ok(store)) => Ok(store),
        Bounded::Finished(Err(e)) => {
            tracing::error!(error = %e, "Failed to connect to Postgres");
            Err(format!("connect failed: {e}"))
        }
        Bounded::TimedOut => {
            tracing::error!("Timed out connecting to Postgres");
            Err(format!("connect timed out after {}s", poller.max_wait.as_secs()))
        }
        Bounded::Interrupted => Err("interrupted before connecting".to_string()),
    };
    let mut store = match connected {
        Ok(store) => store,
        Err(detail) => {
            return StageReport::failed(Stage::RowStore, detail)
                .with_counts(0, expected)
                .with_elapsed(ctx.elapsed_since(started));
        }
    };

    let filter = CorrelationFilter::new(marker);
    let mut probe = RowProbe {
        store: store.as_mut(),
        filter: &filter,
        pipeline_id: ctx.pipeline_id,
        expected,
        tally: TraceTally::new(ctx.trace_ids),
        warnings: Vec::new(),
    };
    let outcome = poller.run(ctx.clock, shutdown, &mut probe).await;
    let RowProbe { tally, mut warnings, .. } = probe;

    ctx.close("postgres", store.close()).await;

    warnings.extend(tally.duplicates().iter().map(ToString::to_string));
    let found = tally.found();
    let report = match outcome {
        Ok(PollOutcome::Ready(_)) => {
            tracing::info!(found, expected, "Postgres validation successful");
            StageReport::passed(Stage::RowStore, format!("{found}/{expected} traces found"))
        }
        Ok(PollOutcome::TimedOut(_)) => {
            tracing::error!(found, expected, "Postgres validation failed");
            StageReport::failed(
                Stage::RowStore,
                format!(
                    "timed out after {}s with {found}/{expected} traces",
                    poller.max_wait.as_secs()
                ),
            )
        }
        Ok(PollOutcome::Interrupted(_)) => {
            tracing::warn!(found, "Postgres validation interrupted");
            StageReport::failed(Stage::RowStore, format!("interrupted with {found}/{expected} traces"))
        }
        Err(e) => {
            tracing::error!(error = %e, "Error querying Postgres");
            StageReport::failed(Stage::RowStore, format!("query failed: {e}"))
        }
    };

    report
        .with_counts(found, expected)
        .with_warnings(warnings)
        .with_elapsed(ctx.elapsed_since(started))
}
