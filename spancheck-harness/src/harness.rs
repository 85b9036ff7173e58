//! Orchestrator: health → emit → row store → column store.
//!
//! Each stage turns its own failures into a `StageReport`; the run result
//! is the AND of all stages.

use crate::report::{RunReport, Stage, StageReport};
use crate::stages::{column_store, emit, health, row_store, StageContext};
use spancheck_core::clickhouse::ClickHouseConnector;
use spancheck_core::db::PgRowStoreConnector;
use spancheck_core::store::{ColumnStoreConnector, RowStoreConnector};
use spancheck_core::{Clock, HarnessConfig, OtlpHttpExporter, Poller, SpanSink, SpancheckError};
use std::time::Duration;
use tokio::sync::watch;

/// Production collaborators built from configuration.
pub struct Backends {
    pub exporter: OtlpHttpExporter,
    pub rows: PgRowStoreConnector,
    pub columns: ClickHouseConnector,
}

impl Backends {
    /// Validate `config` and build the clients it describes.
    pub fn from_config(config: &HarnessConfig) -> Result<Self, SpancheckError> {
        config.validate()?;
        Ok(Self {
            exporter: OtlpHttpExporter::new(&config.endpoint, &config.service.name)?,
            rows: PgRowStoreConnector::new(config.postgres.clone()),
            columns: ClickHouseConnector::new(&config.clickhouse)?,
        })
    }
}

pub struct Harness<'a> {
    config: &'a HarnessConfig,
    sink: &'a dyn SpanSink,
    rows: &'a dyn RowStoreConnector,
    columns: &'a dyn ColumnStoreConnector,
    clock: &'a dyn Clock,
    shutdown: Option<watch::Receiver<bool>>,
    health_check: bool,
}

impl<'a> Harness<'a> {
    pub fn new(
        config: &'a HarnessConfig,
        sink: &'a dyn SpanSink,
        rows: &'a dyn RowStoreConnector,
        columns: &'a dyn ColumnStoreConnector,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            config,
            sink,
            rows,
            columns,
            clock,
            shutdown: None,
            health_check: true,
        }
    }

    /// Abort the current poll loop once `shutdown` turns `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn with_health_check(mut self, enabled: bool) -> Self {
        self.health_check = enabled;
        self
    }

    pub async fn run(&self, marker: &str) -> RunReport {
        let config = self.config;
        let timing = &config.harness;
        let mut report = RunReport::new(marker);

        let postgres = format!("{}:{}", config.postgres.host, config.postgres.port);
        let clickhouse = format!("{}:{}", config.clickhouse.host, config.clickhouse.port);
        tracing::info!(
            marker,
            base_url = %config.endpoint.base_url,
            postgres = %postgres,
            clickhouse = %clickhouse,
            organization_id = %config.tenant.organization_id,
            pipeline_id = %config.tenant.pipeline_id,
            "Starting ingestion pipeline check"
        );

        if self.health_check {
            let health = health::check_endpoint(
                &config.endpoint.health_url(),
                timing.health_attempts,
                Duration::from_millis(timing.health_retry_delay_ms),
            )
            .await;
            let healthy = health.is_pass();
            report.push(health);
            if !healthy {
                skip_remaining(&mut report, &[Stage::Emit, Stage::RowStore, Stage::ColumnStore], "API unhealthy");
                return report;
            }
        }

        let (emitted, trace_ids) = emit::run(
            self.sink,
            &config.tenant.pipeline_id,
            marker,
            timing.flush_timeout(),
        )
        .await;
        let sent = emitted.is_pass();
        report.push(emitted);
        if !sent {
            skip_remaining(&mut report, &[Stage::RowStore, Stage::ColumnStore], "emission failed");
            return report;
        }

        let ctx = StageContext {
            clock: self.clock,
            shutdown: self.shutdown.clone(),
            pipeline_id: &config.tenant.pipeline_id,
            trace_ids: &trace_ids,
        };

        let row_poller = Poller::new(timing.row_poll_interval(), timing.row_max_wait());
        report.push(row_store::wait_for_rows(&ctx, self.rows, marker, row_poller).await);

        let column_poller = Poller::new(timing.column_poll_interval(), timing.column_max_wait())
            .with_settle(timing.column_settle());
        report.push(
            column_store::wait_for_replicated_spans(
                &ctx,
                self.columns,
                marker,
                column_poller,
                timing.column_name_fallback,
            )
            .await,
        );

        if report.success() {
            tracing::info!(marker, "All stages passed");
        } else {
            tracing::error!(marker, "Some stages failed");
        }
        report
    }
}

fn skip_remaining(report: &mut RunReport, stages: &[Stage], reason: &str) {
    for stage in stages {
        report.push(StageReport::skipped(*stage, reason));
    }
}
