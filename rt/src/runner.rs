//! The run controller: owns one run from parse to final report.
//!
//! Construction order follows the data flow: resolve the DAG, validate,
//! wait for the session-registry lock, open the stats store, archive the
//! resolved workflow, spawn the checkpointer, drive the scheduler, then
//! persist history (task rows first, run row last), export results and
//! clean up on every path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use eyre::{Context, eyre};
use serde_json::json;
use statstore::{RunRecord, StatsStore, TaskRecord};
use thiserror::Error;
use tracing::{info, warn};

use crate::checkpoint::{self, Checkpointer};
use crate::estimate::Estimator;
use crate::executor::{ClientPool, Executor, abort_channel};
use crate::lock::{ExclusiveLock, LockError, session_tag};
use crate::model::{Dag, TaskStatus, task_signature};
use crate::parser::{ParseError, ParsedWorkflow, emit_structured, resolve_dag};
use crate::remote::ClientFactory;
use crate::scheduler::{RunStats, Scheduler, SchedulerConfig};
use crate::settings::Settings;
use crate::sink::{ResultSink, RunReport};
use crate::validate::validate_structural;

/// Run-fatal failures. The lock timeout is separated out because it
/// owns the reserved exit code 5.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Fatal(#[from] eyre::Report),
}

impl From<ParseError> for RunnerError {
    fn from(e: ParseError) -> Self {
        RunnerError::Fatal(eyre::Report::new(e))
    }
}

/// A workflow file, read once so content and hash agree.
pub struct WorkflowSource {
    pub path: PathBuf,
    pub content: String,
    pub workflow: String,
    pub parsed: ParsedWorkflow,
}

impl WorkflowSource {
    /// Read and parse a task file. The workflow name comes from the
    /// structured metadata when present, else from the file stem.
    pub fn read(path: &Path) -> Result<Self, ParseError> {
        let content = std::fs::read_to_string(path).map_err(|e| ParseError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let parsed = crate::parser::parse_str(&content)?;
        let workflow = parsed
            .workflow
            .clone()
            .or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "workflow".to_string());
        Ok(Self {
            path: path.to_path_buf(),
            content,
            workflow,
            parsed,
        })
    }
}

pub struct RunController {
    settings: Settings,
    factory: Arc<dyn ClientFactory>,
    console: bool,
}

impl RunController {
    pub fn new(settings: Settings, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            settings,
            factory,
            console: true,
        }
    }

    /// Silence the console summary (tests).
    pub fn without_console(mut self) -> Self {
        self.console = false;
        self
    }

    /// Execute (or resume) a workflow end to end.
    pub async fn run(&self, source: WorkflowSource, resume: bool, force: bool) -> Result<RunReport, RunnerError> {
        let workflow = source.workflow.clone();
        let tag = session_tag(&workflow, self.settings.exclusive);
        let run_id = Utc::now().format("%Y%m%d%H%M%S%3f").to_string();
        info!(%workflow, %run_id, exclusive = self.settings.exclusive, "Run starting");

        for warning in &source.parsed.warnings {
            warn!(%workflow, "{warning}");
        }

        // Parse -> expand -> DAG
        let (dag, warnings) = resolve_dag(source.parsed, self.factory.as_ref(), &tag).await?;
        for warning in warnings {
            warn!(%workflow, "{warning}");
        }
        let dag = Arc::new(dag);

        let report = validate_structural(&dag);
        for warning in &report.warnings {
            warn!(%workflow, "{warning}");
        }
        if !report.is_ok() {
            return Err(eyre!("workflow validation failed: {}", report.errors.join("; ")).into());
        }

        // Resume bootstrap
        let source_hash = checkpoint::content_hash(&source.content);
        let checkpoint_file = checkpoint::checkpoint_path(&self.settings.checkpoint_dir, &workflow);
        let initial = if resume {
            let snapshot = checkpoint::load(&checkpoint_file).map_err(|e| eyre::Report::new(e))?;
            let statuses = checkpoint::plan_resume(&snapshot, &dag, &source_hash, force)
                .map_err(|e| eyre::Report::new(e))?;
            let remaining = statuses.iter().filter(|s| !s.is_terminal()).count();
            info!(%workflow, remaining, "Resuming from checkpoint {}", snapshot.run_id);
            Some(statuses)
        } else {
            if checkpoint_file.exists() {
                warn!(%workflow, "Existing checkpoint will be replaced; use resume to continue it");
            }
            None
        };

        // Cluster-wide coordination over the session registry
        let lock = ExclusiveLock::new(
            self.factory.clone(),
            workflow.clone(),
            self.settings.exclusive,
            Duration::from_secs(self.settings.exclusive_polling_interval_sec),
            Duration::from_secs(self.settings.exclusive_timeout_sec),
        );
        lock.acquire(&dag.instances()).await?;

        // History store and scheduling weights
        let store = Arc::new(
            StatsStore::open(self.settings.stats_db_path()).context("Failed to open stats store")?,
        );
        if let Err(e) = store.purge_older_than(self.settings.retention_days) {
            warn!("Retention purge failed: {e}");
        }
        let estimator = Estimator::new(store.clone(), self.settings.estimator.clone());
        let estimates = estimator.costs(&dag);

        self.archive_workflow(&workflow, &run_id, &dag);

        // Executor and scheduler
        let (abort_tx, abort_rx) = abort_channel();
        let pool = ClientPool::new(self.factory.clone(), tag, self.settings.max_workers as usize);
        let executor = Arc::new(Executor::new(pool.clone(), self.settings.retries, abort_rx));
        let stage_workers = self
            .settings
            .stage_workers
            .iter()
            .map(|(k, &v)| (k.clone(), v as usize))
            .collect();
        let scheduler = Arc::new(Scheduler::new(
            dag.clone(),
            SchedulerConfig::new(self.settings.max_workers as usize, self.settings.optimize, stage_workers),
            executor,
            estimates,
            initial.clone(),
            abort_tx,
        ));

        let checkpointer = if self.settings.checkpoint {
            let seed = checkpoint::seed_from(
                &dag,
                initial.as_deref().unwrap_or(&vec![TaskStatus::Pending; dag.len()]),
            );
            Some(Checkpointer::spawn(
                checkpoint_file.clone(),
                run_id.clone(),
                workflow.clone(),
                source.path.display().to_string(),
                source_hash.clone(),
                seed,
                scheduler.subscribe(),
                Duration::from_secs(self.settings.checkpoint_interval_sec),
            ))
        } else {
            None
        };

        // First interrupt drains, a second one aborts in-flight work
        let signal_task = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    scheduler.stop().await;
                }
                if tokio::signal::ctrl_c().await.is_ok() {
                    scheduler.abort().await;
                }
            })
        };

        let started_at = Utc::now();
        let stats = scheduler.run().await;
        let finished_at = Utc::now();
        signal_task.abort();

        // Persist history: task rows first, the run row last
        let records = self.task_records(&run_id, &workflow, &dag, &stats);
        for record in &records {
            if let Err(e) = store.append_task(record) {
                warn!(task_id = %record.task_id, "History append failed: {e}");
            }
        }
        let report = self.build_report(&run_id, &workflow, started_at, finished_at, &stats);
        if let Err(e) = store.append_run(&run_record(&report)) {
            warn!("Run history append failed: {e}");
        }

        self.export(&records, &report);

        if let Some(checkpointer) = checkpointer {
            checkpointer.finish().await;
            if report.overall_success {
                if let Err(e) = checkpoint::delete(&checkpoint_file) {
                    warn!("Checkpoint cleanup failed: {e}");
                }
            } else {
                if let Err(e) = checkpoint::archive(&checkpoint_file, &run_id) {
                    warn!("Checkpoint archive failed: {e}");
                }
                info!(%workflow, "Checkpoint retained for resume");
            }
        }

        // Releases the run's claim on the session registry
        pool.shutdown().await;

        info!(%workflow, %run_id, success = report.overall_success, "Run finished");
        Ok(report)
    }

    fn archive_workflow(&self, workflow: &str, run_id: &str, dag: &Dag) {
        let dir = self.settings.archive_dir.join(workflow);
        let path = dir.join(format!("{run_id}.workflow"));
        let payload = emit_structured(dag.tasks(), Some(workflow), None);
        let result = std::fs::create_dir_all(&dir).and_then(|()| std::fs::write(&path, payload));
        match result {
            Ok(()) => info!(path = %path.display(), "Archived resolved workflow"),
            Err(e) => warn!("Workflow archive failed: {e}"),
        }
    }

    fn task_records(&self, run_id: &str, workflow: &str, dag: &Dag, stats: &RunStats) -> Vec<TaskRecord> {
        dag.tasks()
            .iter()
            .zip(stats.results.iter())
            .map(|(task, result)| {
                let params = json!(
                    task.parameters
                        .iter()
                        .cloned()
                        .collect::<std::collections::BTreeMap<String, String>>()
                );
                TaskRecord {
                    run_id: run_id.to_string(),
                    workflow: workflow.to_string(),
                    task_id: task.id.clone(),
                    signature: task_signature(task),
                    instance: task.instance.clone(),
                    process: task.process.clone(),
                    parameters: params.to_string(),
                    status: effective_status(result.status).to_string(),
                    started_at: result.outcome.as_ref().map(|o| o.started_at.timestamp_millis()),
                    finished_at: result.outcome.as_ref().map(|o| o.finished_at.timestamp_millis()),
                    attempts: result.outcome.as_ref().map(|o| o.attempts).unwrap_or(0),
                    error_kind: result
                        .outcome
                        .as_ref()
                        .and_then(|o| o.error_kind.map(|k| k.to_string())),
                    error_message: result.outcome.as_ref().and_then(|o| o.error_message.clone()),
                }
            })
            .collect()
    }

    fn build_report(
        &self,
        run_id: &str,
        workflow: &str,
        started_at: chrono::DateTime<Utc>,
        finished_at: chrono::DateTime<Utc>,
        stats: &RunStats,
    ) -> RunReport {
        RunReport {
            run_id: run_id.to_string(),
            workflow: workflow.to_string(),
            started_at,
            finished_at,
            max_workers: self.settings.max_workers,
            total: stats.results.len(),
            succeeded: stats.count(TaskStatus::Succeeded),
            failed: stats.count(TaskStatus::Failed),
            skipped: stats.count(TaskStatus::Skipped),
            // Tasks a stop kept from starting are reported as cancelled
            cancelled: stats.count(TaskStatus::Cancelled) + stats.unstarted(),
            overall_success: stats.overall_success(),
        }
    }

    fn export(&self, records: &[TaskRecord], report: &RunReport) {
        let mut sinks: Vec<Box<dyn ResultSink>> = Vec::new();
        if self.console {
            sinks.push(Box::new(crate::sink::ConsoleSink::new()));
        }
        if let Some(path) = &self.settings.result {
            sinks.push(Box::new(crate::sink::JsonFileSink::new(path.clone())));
        }

        for mut sink in sinks {
            for record in records {
                sink.record_task(record);
            }
            if let Err(e) = sink.finalize(report) {
                warn!("Result export failed: {e}");
            }
        }
    }
}

/// Never-started tasks surface as cancelled in history rows too.
fn effective_status(status: TaskStatus) -> TaskStatus {
    if status.is_terminal() { status } else { TaskStatus::Cancelled }
}

fn run_record(report: &RunReport) -> RunRecord {
    RunRecord {
        run_id: report.run_id.clone(),
        workflow: report.workflow.clone(),
        started_at: report.started_at.timestamp_millis(),
        finished_at: report.finished_at.timestamp_millis(),
        max_workers: report.max_workers,
        total: report.total as u32,
        succeeded: report.succeeded as u32,
        failed: report.failed as u32,
        skipped: report.skipped as u32,
        cancelled: report.cancelled as u32,
        success: report.overall_success,
    }
}
