//! Per-stage outcomes and the end-of-run summary table.

use std::fmt::Write as _;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Health,
    Emit,
    RowStore,
    ColumnStore,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Health => "API Health",
            Stage::Emit => "Trace Sending",
            Stage::RowStore => "Postgres Ingestion",
            Stage::ColumnStore => "ClickHouse Replication",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Passed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Passed => "PASS",
            StageStatus::Failed => "FAIL",
            StageStatus::Skipped => "SKIPPED",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,
    pub matched: usize,
    pub expected: usize,
    pub warnings: Vec<String>,
    pub detail: String,
    pub elapsed: Duration,
}

impl StageReport {
    pub fn new(stage: Stage, status: StageStatus, detail: impl Into<String>) -> Self {
        Self {
            stage,
            status,
            matched: 0,
            expected: 0,
            warnings: Vec::new(),
            detail: detail.into(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn passed(stage: Stage, detail: impl Into<String>) -> Self {
        Self::new(stage, StageStatus::Passed, detail)
    }

    pub fn failed(stage: Stage, detail: impl Into<String>) -> Self {
        Self::new(stage, StageStatus::Failed, detail)
    }

    pub fn skipped(stage: Stage, detail: impl Into<String>) -> Self {
        Self::new(stage, StageStatus::Skipped, detail)
    }

    pub fn with_counts(mut self, matched: usize, expected: usize) -> Self {
        self.matched = matched;
        self.expected = expected;
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    pub fn is_pass(&self) -> bool {
        self.status == StageStatus::Passed
    }
}

/// Everything one harness run observed.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub marker: String,
    pub stages: Vec<StageReport>,
}

impl RunReport {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            stages: Vec::new(),
        }
    }

    pub fn push(&mut self, report: StageReport) {
        self.stages.push(report);
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|r| r.stage == stage)
    }

    /// True only if at least one stage ran and every recorded stage passed.
    pub fn success(&self) -> bool {
        !self.stages.is_empty() && self.stages.iter().all(StageReport::is_pass)
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() {
            0
        } else {
            1
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Test Results Summary (marker {})", self.marker);
        let _ = writeln!(
            out,
            "{:<24} {:<8} {:>9} {:>9} {:>9}  {}",
            "Stage", "Status", "Matched", "Warnings", "Elapsed", "Detail"
        );

        for r in &self.stages {
            let matched = if r.expected > 0 {
                format!("{}/{}", r.matched, r.expected)
            } else {
                "-".to_string()
            };
            let _ = writeln!(
                out,
                "{:<24} {:<8} {:>9} {:>9} {:>8.1}s  {}",
                r.stage.label(),
                r.status.as_str(),
                matched,
                r.warnings.len(),
                r.elapsed.as_secs_f64(),
                r.detail
            );
        }

        let verdict = if self.success() {
            "All stages passed. Ingestion pipeline is working correctly."
        } else {
            "Some stages failed. Check the logs above for details."
        };
        let _ = write!(out, "{verdict}");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_run_is_not_a_success() {
        let report = RunReport::new("m");
        assert!(!report.success());
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_any_failed_or_skipped_stage_fails_the_run() {
        let mut report = RunReport::new("m");
        report.push(StageReport::passed(Stage::Emit, "3 records"));
        report.push(StageReport::passed(Stage::RowStore, "ok").with_counts(3, 3));
        assert_eq!(report.exit_code(), 0);

        report.push(StageReport::skipped(Stage::ColumnStore, "emit failed"));
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_render_lists_each_stage() {
        let mut report = RunReport::new("M1");
        report.push(
            StageReport::passed(Stage::RowStore, "3/3 rows found")
                .with_counts(3, 3)
                .with_elapsed(Duration::from_millis(1500)),
        );
        report.push(
            StageReport::failed(Stage::ColumnStore, "timed out")
                .with_counts(0, 3)
                .with_warnings(vec!["bad json".to_string()]),
        );

        let table = report.render();
        assert!(table.contains("marker M1"));
        assert!(table.contains("Postgres Ingestion"));
        assert!(table.contains("3/3"));
        assert!(table.contains("1.5s"));
        assert!(table.contains("ClickHouse Replication"));
        assert!(table.contains("FAIL"));
        assert!(table.contains("0/3"));
        assert!(table.ends_with("Check the logs above for details."));
    }
}
