//! Result aggregation and export.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use colored::Colorize;
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use statstore::TaskRecord;

/// Final account of one run, always produced, success or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub workflow: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub max_workers: u32,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub overall_success: bool,
}

impl RunReport {
    pub fn elapsed_secs(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    /// Process exit code: 0 on full success, 1 otherwise. The exclusive
    /// lock timeout (exit 5) is decided before a report exists.
    pub fn exit_code(&self) -> i32 {
        if self.overall_success { 0 } else { 1 }
    }
}

/// Consumes per-task records and the final report. One sink per export
/// target; the run controller fans records out to all of them.
pub trait ResultSink: Send {
    fn record_task(&mut self, record: &TaskRecord);

    fn finalize(&mut self, report: &RunReport) -> Result<()>;
}

/// Human-facing summary on stdout.
#[derive(Default)]
pub struct ConsoleSink {
    failures: Vec<(String, String)>,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultSink for ConsoleSink {
    fn record_task(&mut self, record: &TaskRecord) {
        if record.status == "failed" || record.status == "cancelled" {
            let reason = record.error_message.clone().unwrap_or_else(|| record.status.clone());
            self.failures.push((record.task_id.clone(), reason));
        }
    }

    fn finalize(&mut self, report: &RunReport) -> Result<()> {
        let verdict = if report.overall_success {
            "succeeded".green().bold()
        } else {
            "failed".red().bold()
        };
        println!(
            "Run {} of '{}' {} in {:.1}s ({} workers)",
            report.run_id,
            report.workflow,
            verdict,
            report.elapsed_secs(),
            report.max_workers,
        );
        println!(
            "  tasks: {} total, {} succeeded, {} failed, {} skipped, {} cancelled",
            report.total, report.succeeded, report.failed, report.skipped, report.cancelled,
        );
        for (task_id, reason) in &self.failures {
            println!("  {} {}: {}", "!".red(), task_id, reason);
        }
        Ok(())
    }
}

/// Full per-task records plus the summary as a JSON document.
pub struct JsonFileSink {
    path: PathBuf,
    tasks: Vec<TaskRecord>,
}

impl JsonFileSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path, tasks: Vec::new() }
    }
}

#[derive(Serialize)]
struct JsonExport<'a> {
    run: &'a RunReport,
    tasks: &'a [TaskRecord],
}

impl ResultSink for JsonFileSink {
    fn record_task(&mut self, record: &TaskRecord) {
        self.tasks.push(record.clone());
    }

    fn finalize(&mut self, report: &RunReport) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let export = JsonExport { run: report, tasks: &self.tasks };
        let payload = serde_json::to_string_pretty(&export)?;
        std::fs::write(&self.path, payload)
            .with_context(|| format!("Failed to write result file {}", self.path.display()))?;
        Ok(())
    }
}
