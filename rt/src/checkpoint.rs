//! Durable run snapshots and the resume protocol.
//!
//! The checkpointer subscribes to the scheduler's event stream and keeps
//! its own mirror of task state, so neither component imports the other.
//! Snapshots go to a temporary file first and are renamed over the
//! authoritative path, which makes a torn write impossible.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::model::{Dag, TaskStatus};
use crate::scheduler::TaskEvent;

/// State of one task at snapshot time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCheckpoint {
    pub id: String,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub safe_retry: bool,
}

/// A durable snapshot of an in-flight run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    pub workflow: String,
    pub source_path: String,
    /// blake3 hash of the task file the run was started from
    pub source_hash: String,
    pub saved_at: DateTime<Utc>,
    pub tasks: Vec<TaskCheckpoint>,
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("no checkpoint at {0}")]
    NotFound(String),

    #[error("checkpoint io: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint is not readable: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error(
        "task file changed since the checkpoint was taken (expected {expected}, found {found}); \
         pass --force to resume anyway"
    )]
    SourceMismatch { expected: String, found: String },

    #[error(
        "resume is unsafe: tasks [{}] were running without safe_retry; pass --force to re-run them",
        .tasks.join(", ")
    )]
    UnsafeResume { tasks: Vec<String> },
}

/// blake3 hex digest of a task file payload.
pub fn content_hash(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_hex().to_string()
}

/// Authoritative checkpoint path for a workflow.
pub fn checkpoint_path(dir: &Path, workflow: &str) -> PathBuf {
    dir.join(format!("{workflow}.snapshot"))
}

/// Read a checkpoint back.
pub fn load(path: &Path) -> Result<Checkpoint, CheckpointError> {
    if !path.exists() {
        return Err(CheckpointError::NotFound(path.display().to_string()));
    }
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Map a checkpoint onto the freshly reconstructed DAG, yielding the
/// initial status per task:
/// succeeded and skipped stay finalized; failed and cancelled reset to
/// pending; running resets to pending when the task is safe to retry and
/// otherwise fails the resume unless forced.
pub fn plan_resume(
    checkpoint: &Checkpoint,
    dag: &Dag,
    current_hash: &str,
    force: bool,
) -> Result<Vec<TaskStatus>, CheckpointError> {
    if checkpoint.source_hash != current_hash && !force {
        return Err(CheckpointError::SourceMismatch {
            expected: checkpoint.source_hash.clone(),
            found: current_hash.to_string(),
        });
    }

    let by_id: HashMap<&str, &TaskCheckpoint> = checkpoint.tasks.iter().map(|t| (t.id.as_str(), t)).collect();

    let mut unsafe_tasks = Vec::new();
    let mut statuses = Vec::with_capacity(dag.len());
    for task in dag.tasks() {
        let status = match by_id.get(task.id.as_str()) {
            Some(entry) => match entry.status {
                TaskStatus::Succeeded => TaskStatus::Succeeded,
                TaskStatus::Skipped => TaskStatus::Skipped,
                TaskStatus::Running => {
                    if !entry.safe_retry {
                        unsafe_tasks.push(task.id.clone());
                    }
                    TaskStatus::Pending
                }
                // Failed and cancelled tasks are re-attempted
                _ => TaskStatus::Pending,
            },
            None => TaskStatus::Pending,
        };
        statuses.push(status);
    }

    if !unsafe_tasks.is_empty() && !force {
        return Err(CheckpointError::UnsafeResume { tasks: unsafe_tasks });
    }
    if !unsafe_tasks.is_empty() {
        warn!(tasks = ?unsafe_tasks, "Forced resume re-runs tasks that are not marked safe_retry");
    }

    Ok(statuses)
}

/// Remove the checkpoint after a fully successful run.
pub fn delete(path: &Path) -> Result<(), CheckpointError> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

/// Keep a per-run archival copy next to the authoritative file.
pub fn archive(path: &Path, run_id: &str) -> Result<(), CheckpointError> {
    if path.exists() {
        let archived = path.with_extension(format!("{run_id}.snapshot"));
        std::fs::copy(path, archived)?;
    }
    Ok(())
}

/// Background snapshot writer for one run.
pub struct Checkpointer {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Checkpointer {
    /// Spawn the snapshot loop. `seed` is the complete initial task
    /// state (statuses from a resume, or all pending); events received
    /// from the scheduler update the mirror between writes.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        path: PathBuf,
        run_id: String,
        workflow: String,
        source_path: String,
        source_hash: String,
        seed: Vec<TaskCheckpoint>,
        mut events: broadcast::Receiver<TaskEvent>,
        interval: Duration,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut mirror: Vec<TaskCheckpoint> = seed;
            let index: HashMap<String, usize> = mirror
                .iter()
                .enumerate()
                .map(|(i, t)| (t.id.clone(), i))
                .collect();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval is immediate
            ticker.tick().await;

            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => apply_event(&mut mirror, &index, event),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "Checkpointer lagged behind the event stream");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            write_snapshot(&path, &run_id, &workflow, &source_path, &source_hash, &mirror).await;
                            break;
                        }
                    },
                    _ = ticker.tick() => {
                        write_snapshot(&path, &run_id, &workflow, &source_path, &source_hash, &mirror).await;
                    }
                    _ = shutdown_rx.changed() => {
                        // Drain anything already queued, then final write
                        while let Ok(event) = events.try_recv() {
                            apply_event(&mut mirror, &index, event);
                        }
                        write_snapshot(&path, &run_id, &workflow, &source_path, &source_hash, &mirror).await;
                        break;
                    }
                }
            }
        });

        Self { shutdown, handle }
    }

    /// Write a final snapshot and stop the loop.
    pub async fn finish(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

fn apply_event(mirror: &mut [TaskCheckpoint], index: &HashMap<String, usize>, event: TaskEvent) {
    let Some(&i) = index.get(&event.task_id) else {
        return;
    };
    mirror[i].status = event.status;
    if event.started_at.is_some() {
        mirror[i].started_at = event.started_at;
    }
    if event.finished_at.is_some() {
        mirror[i].finished_at = event.finished_at;
    }
}

async fn write_snapshot(
    path: &Path,
    run_id: &str,
    workflow: &str,
    source_path: &str,
    source_hash: &str,
    tasks: &[TaskCheckpoint],
) {
    let checkpoint = Checkpoint {
        run_id: run_id.to_string(),
        workflow: workflow.to_string(),
        source_path: source_path.to_string(),
        source_hash: source_hash.to_string(),
        saved_at: Utc::now(),
        tasks: tasks.to_vec(),
    };

    let result = async {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let payload = serde_json::to_string_pretty(&checkpoint).unwrap_or_default();
        let tmp = path.with_extension("snapshot.tmp");
        tokio::fs::write(&tmp, payload).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok::<(), std::io::Error>(())
    }
    .await;

    match result {
        Ok(()) => debug!(path = %path.display(), "Checkpoint written"),
        Err(e) => warn!(path = %path.display(), "Checkpoint write failed: {e}"),
    }
}

/// Build the initial mirror for a DAG, honoring resumed statuses.
pub fn seed_from(dag: &Dag, statuses: &[TaskStatus]) -> Vec<TaskCheckpoint> {
    dag.tasks()
        .iter()
        .zip(statuses.iter())
        .map(|(task, &status)| TaskCheckpoint {
            id: task.id.clone(),
            status,
            started_at: None,
            finished_at: None,
            safe_retry: task.safe_retry,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Task;

    fn sample_dag() -> Dag {
        Dag::build(vec![
            Task::new("a", "prod", "p_a"),
            {
                let mut t = Task::new("b", "prod", "p_b").with_predecessors(["a"]);
                t.safe_retry = true;
                t
            },
            Task::new("c", "prod", "p_c").with_predecessors(["b"]),
        ])
        .unwrap()
    }

    fn entry(id: &str, status: TaskStatus, safe_retry: bool) -> TaskCheckpoint {
        TaskCheckpoint {
            id: id.to_string(),
            status,
            started_at: None,
            finished_at: None,
            safe_retry,
        }
    }

    fn sample_checkpoint(tasks: Vec<TaskCheckpoint>) -> Checkpoint {
        Checkpoint {
            run_id: "20240101120000000".to_string(),
            workflow: "wf".to_string(),
            source_path: "tasks.txt".to_string(),
            source_hash: content_hash("payload"),
            saved_at: Utc::now(),
            tasks,
        }
    }

    #[test]
    fn test_content_hash_is_stable_and_sensitive() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
    }

    #[test]
    fn test_plan_resume_mappings() {
        let dag = sample_dag();
        let checkpoint = sample_checkpoint(vec![
            entry("a", TaskStatus::Succeeded, false),
            entry("b", TaskStatus::Running, true),
            entry("c", TaskStatus::Failed, false),
        ]);

        let statuses = plan_resume(&checkpoint, &dag, &content_hash("payload"), false).unwrap();
        assert_eq!(statuses, vec![TaskStatus::Succeeded, TaskStatus::Pending, TaskStatus::Pending]);
    }

    #[test]
    fn test_plan_resume_rejects_changed_source() {
        let dag = sample_dag();
        let checkpoint = sample_checkpoint(vec![entry("a", TaskStatus::Succeeded, false)]);

        let err = plan_resume(&checkpoint, &dag, &content_hash("edited"), false).unwrap_err();
        assert!(matches!(err, CheckpointError::SourceMismatch { .. }));

        // force overrides
        assert!(plan_resume(&checkpoint, &dag, &content_hash("edited"), true).is_ok());
    }

    #[test]
    fn test_plan_resume_rejects_unsafe_running_tasks() {
        let dag = sample_dag();
        let checkpoint = sample_checkpoint(vec![
            entry("a", TaskStatus::Running, false),
            entry("b", TaskStatus::Running, true),
        ]);

        let err = plan_resume(&checkpoint, &dag, &content_hash("payload"), false).unwrap_err();
        match err {
            CheckpointError::UnsafeResume { tasks } => assert_eq!(tasks, vec!["a".to_string()]),
            other => panic!("expected UnsafeResume, got {other}"),
        }

        let statuses = plan_resume(&checkpoint, &dag, &content_hash("payload"), true).unwrap();
        assert_eq!(statuses[0], TaskStatus::Pending);
    }

    #[test]
    fn test_plan_resume_skipped_stays_finalized() {
        let dag = sample_dag();
        let checkpoint = sample_checkpoint(vec![
            entry("a", TaskStatus::Failed, false),
            entry("b", TaskStatus::Skipped, false),
        ]);
        let statuses = plan_resume(&checkpoint, &dag, &content_hash("payload"), false).unwrap();
        assert_eq!(statuses, vec![TaskStatus::Pending, TaskStatus::Skipped, TaskStatus::Pending]);
    }

    #[tokio::test]
    async fn test_checkpointer_writes_and_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let path = checkpoint_path(dir.path(), "wf");
        let dag = sample_dag();
        let statuses = vec![TaskStatus::Pending; dag.len()];

        let (events_tx, events_rx) = broadcast::channel(64);
        let checkpointer = Checkpointer::spawn(
            path.clone(),
            "run-1".to_string(),
            "wf".to_string(),
            "tasks.txt".to_string(),
            content_hash("payload"),
            seed_from(&dag, &statuses),
            events_rx,
            Duration::from_secs(3600),
        );

        let started = Utc::now();
        events_tx
            .send(TaskEvent {
                task_id: "a".to_string(),
                status: TaskStatus::Running,
                started_at: Some(started),
                finished_at: None,
                attempts: 0,
            })
            .unwrap();
        events_tx
            .send(TaskEvent {
                task_id: "a".to_string(),
                status: TaskStatus::Succeeded,
                started_at: Some(started),
                finished_at: Some(Utc::now()),
                attempts: 1,
            })
            .unwrap();

        checkpointer.finish().await;

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.run_id, "run-1");
        assert_eq!(loaded.tasks.len(), 3);
        let a = loaded.tasks.iter().find(|t| t.id == "a").unwrap();
        assert_eq!(a.status, TaskStatus::Succeeded);
        assert!(a.started_at.is_some() && a.finished_at.is_some());
        let b = loaded.tasks.iter().find(|t| t.id == "b").unwrap();
        assert_eq!(b.status, TaskStatus::Pending);
        assert!(b.safe_retry);
    }

    #[tokio::test]
    async fn test_archive_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = checkpoint_path(dir.path(), "wf");
        std::fs::write(&path, "{}").unwrap();

        archive(&path, "run-9").unwrap();
        assert!(dir.path().join("wf.run-9.snapshot").exists());

        delete(&path).unwrap();
        assert!(!path.exists());
        // deleting a missing checkpoint is fine
        delete(&path).unwrap();
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let err = load(Path::new("/nonexistent/wf.snapshot")).unwrap_err();
        assert!(matches!(err, CheckpointError::NotFound(_)));
    }
}
