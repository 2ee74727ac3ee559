use serde::Serialize;
use std::fmt;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    NotStarted,
    InProgress,
    Completed,
    CompletedWithSkips,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStatus::NotStarted => "NOT_STARTED",
            RunStatus::InProgress => "IN_PROGRESS",
            RunStatus::Completed => "COMPLETED",
            RunStatus::CompletedWithSkips => "COMPLETED_WITH_SKIPS",
        };
        f.write_str(label)
    }
}

/// Outcome of one stage invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub stage: &'static str,
    pub status: RunStatus,
    /// Items the stage looked at (identifiers, input rows, table rows).
    pub processed: usize,
    /// Rows written to an output file or upserted.
    pub written: usize,
    /// Items deliberately not processed because an earlier run already did them.
    pub already_done: usize,
    /// Items that failed and were left for a later run.
    pub skipped: usize,
}

/// Drives `NotStarted -> InProgress -> Completed | CompletedWithSkips` for one run.
#[derive(Debug)]
pub struct RunTracker {
    report: RunReport,
}

impl RunTracker {
    pub fn new(stage: &'static str) -> Self {
        Self {
            report: RunReport {
                stage,
                status: RunStatus::NotStarted,
                processed: 0,
                written: 0,
                already_done: 0,
                skipped: 0,
            },
        }
    }

    pub fn start(&mut self) {
        self.report.status = RunStatus::InProgress;
        info!(stage = self.report.stage, "Stage started");
    }

    pub fn status(&self) -> RunStatus {
        self.report.status
    }

    pub fn processed(&mut self, n: usize) {
        self.report.processed += n;
    }

    pub fn written(&mut self, n: usize) {
        self.report.written += n;
    }

    pub fn already_done(&mut self, n: usize) {
        self.report.already_done += n;
    }

    pub fn skipped(&mut self, n: usize) {
        self.report.skipped += n;
    }

    pub fn finish(mut self) -> RunReport {
        self.report.status = if self.report.skipped > 0 {
            RunStatus::CompletedWithSkips
        } else {
            RunStatus::Completed
        };
        info!(
            stage = self.report.stage,
            status = %self.report.status,
            processed = self.report.processed,
            written = self.report.written,
            already_done = self.report.already_done,
            skipped = self.report.skipped,
            "Stage finished"
        );
        self.report
    }
}
