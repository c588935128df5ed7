//! Remote invocation with retry, backoff, timeout and cancellation.

mod pool;

pub use pool::{ClientPool, PooledClient};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::model::{Task, TaskStatus};
use crate::remote::{ProcessCall, ProcessCompletion, RemoteError};

/// Exponential backoff schedule for transient remote failures:
/// `initial`, doubling per attempt, capped at `cap`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            cap: Duration::from_secs(16),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.initial.checked_mul(factor).map_or(self.cap, |d| d.min(self.cap))
    }
}

/// Failure classification recorded on a task outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeErrorKind {
    /// Remote invocation failed (after exhausting any retries)
    RemoteFailure,
    /// Deadline expired while the invocation was outstanding
    Timeout,
    /// The process completed with minor errors and the task did not
    /// opt into treating that as success
    MinorErrorReported,
    /// The run was aborted while the invocation was outstanding
    Aborted,
}

impl std::fmt::Display for OutcomeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RemoteFailure => write!(f, "remote_failure"),
            Self::Timeout => write!(f, "timeout"),
            Self::MinorErrorReported => write!(f, "minor_error_reported"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Final account of one task execution.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempts: u32,
    pub error_kind: Option<OutcomeErrorKind>,
    pub error_message: Option<String>,
}

/// Create the abort signal pair shared by a run. The sender side lives
/// in the run controller; every executor holds a receiver.
pub fn abort_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

enum AttemptEnd {
    Done(Result<ProcessCompletion, RemoteError>),
    TimedOut,
    Aborted,
}

/// Drives single task invocations against the remote.
pub struct Executor {
    pool: Arc<ClientPool>,
    retries: u32,
    backoff: BackoffPolicy,
    abort: watch::Receiver<bool>,
}

impl Executor {
    pub fn new(pool: Arc<ClientPool>, retries: u32, abort: watch::Receiver<bool>) -> Self {
        Self {
            pool,
            retries,
            backoff: BackoffPolicy::default(),
            abort,
        }
    }

    /// Override the backoff schedule (tests).
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    async fn aborted(&self) {
        let mut rx = self.abort.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone means no abort can ever arrive
                std::future::pending::<()>().await;
            }
        }
    }

    /// Execute one task to a terminal outcome. Task-local failures never
    /// escape as errors; they are encoded in the outcome.
    pub async fn execute(&self, task: &Task) -> TaskOutcome {
        let started_at = Utc::now();
        let deadline = task
            .timeout_sec
            .map(|s| tokio::time::Instant::now() + Duration::from_secs(s));
        let invocation_id = Uuid::now_v7().to_string();
        let call = ProcessCall {
            process: task.process.clone(),
            parameters: task.parameters.clone(),
            session_tag: self.pool.session_tag().to_string(),
            invocation_id: invocation_id.clone(),
            timeout: task.timeout_sec.map(Duration::from_secs),
        };

        let mut attempts: u32 = 0;
        loop {
            attempts += 1;

            let pooled = match self.pool.checkout(&task.instance).await {
                Ok(pooled) => pooled,
                Err(e) => {
                    if e.is_transient() && attempts <= self.retries {
                        let delay = self.backoff.delay(attempts - 1);
                        warn!(task_id = %task.id, attempt = attempts, ?delay, "Connect failed, backing off: {e}");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return self.failure(task, started_at, attempts, OutcomeErrorKind::RemoteFailure, e.to_string());
                }
            };

            let end = {
                let exec_fut = pooled.client.execute_process(&call);
                tokio::pin!(exec_fut);
                let sleep_until = deadline.unwrap_or_else(|| {
                    tokio::time::Instant::now() + Duration::from_secs(86_400 * 365)
                });
                tokio::select! {
                    result = &mut exec_fut => AttemptEnd::Done(result),
                    _ = tokio::time::sleep_until(sleep_until) => AttemptEnd::TimedOut,
                    _ = self.aborted() => AttemptEnd::Aborted,
                }
            };

            match end {
                AttemptEnd::Done(Ok(completion)) => {
                    self.pool.give_back(pooled).await;
                    return self.finish(task, started_at, attempts, completion);
                }
                AttemptEnd::Done(Err(e)) => {
                    // Transport state unknown; discard the client
                    drop(pooled);
                    if e.is_transient() && attempts <= self.retries {
                        let delay = self.backoff.delay(attempts - 1);
                        warn!(task_id = %task.id, attempt = attempts, ?delay, "Transient failure, backing off: {e}");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return self.failure(task, started_at, attempts, OutcomeErrorKind::RemoteFailure, e.to_string());
                }
                AttemptEnd::TimedOut => {
                    drop(pooled);
                    return self.handle_timeout(task, started_at, attempts, &invocation_id).await;
                }
                AttemptEnd::Aborted => {
                    drop(pooled);
                    debug!(task_id = %task.id, "Abort requested, cancelling invocation");
                    self.cancel_remote(task, &invocation_id).await;
                    return TaskOutcome {
                        status: TaskStatus::Cancelled,
                        started_at,
                        finished_at: Utc::now(),
                        attempts,
                        error_kind: Some(OutcomeErrorKind::Aborted),
                        error_message: Some("run aborted".to_string()),
                    };
                }
            }
        }
    }

    async fn handle_timeout(
        &self,
        task: &Task,
        started_at: DateTime<Utc>,
        attempts: u32,
        invocation_id: &str,
    ) -> TaskOutcome {
        let timeout = task.timeout_sec.unwrap_or_default();
        if task.cancel_at_timeout {
            self.cancel_remote(task, invocation_id).await;
            TaskOutcome {
                status: TaskStatus::Cancelled,
                started_at,
                finished_at: Utc::now(),
                attempts,
                error_kind: Some(OutcomeErrorKind::Timeout),
                error_message: Some(format!("deadline of {timeout}s exceeded; remote cancel issued")),
            }
        } else {
            // Detached: the invocation keeps running remotely
            TaskOutcome {
                status: TaskStatus::Failed,
                started_at,
                finished_at: Utc::now(),
                attempts,
                error_kind: Some(OutcomeErrorKind::Timeout),
                error_message: Some(format!("deadline of {timeout}s exceeded; invocation detached")),
            }
        }
    }

    async fn cancel_remote(&self, task: &Task, invocation_id: &str) {
        match self.pool.checkout(&task.instance).await {
            Ok(pooled) => {
                if let Err(e) = pooled.client.cancel_invocation(invocation_id).await {
                    warn!(task_id = %task.id, "Remote cancel failed: {e}");
                }
                self.pool.give_back(pooled).await;
            }
            Err(e) => warn!(task_id = %task.id, "Could not connect to issue cancel: {e}"),
        }
    }

    fn finish(
        &self,
        task: &Task,
        started_at: DateTime<Utc>,
        attempts: u32,
        completion: ProcessCompletion,
    ) -> TaskOutcome {
        let finished_at = Utc::now();
        match completion {
            ProcessCompletion::Success => TaskOutcome {
                status: TaskStatus::Succeeded,
                started_at,
                finished_at,
                attempts,
                error_kind: None,
                error_message: None,
            },
            ProcessCompletion::MinorErrors if task.succeed_on_minor_errors => TaskOutcome {
                status: TaskStatus::Succeeded,
                started_at,
                finished_at,
                attempts,
                error_kind: None,
                error_message: Some("completed with minor errors".to_string()),
            },
            ProcessCompletion::MinorErrors => TaskOutcome {
                status: TaskStatus::Failed,
                started_at,
                finished_at,
                attempts,
                error_kind: Some(OutcomeErrorKind::MinorErrorReported),
                error_message: Some("process completed with minor errors".to_string()),
            },
            ProcessCompletion::Failed { message } => TaskOutcome {
                status: TaskStatus::Failed,
                started_at,
                finished_at,
                attempts,
                error_kind: Some(OutcomeErrorKind::RemoteFailure),
                error_message: Some(message),
            },
        }
    }

    fn failure(
        &self,
        task: &Task,
        started_at: DateTime<Utc>,
        attempts: u32,
        kind: OutcomeErrorKind,
        message: String,
    ) -> TaskOutcome {
        warn!(task_id = %task.id, attempts, %message, "Task failed");
        TaskOutcome {
            status: TaskStatus::Failed,
            started_at,
            finished_at: Utc::now(),
            attempts,
            error_kind: Some(kind),
            error_message: Some(message),
        }
    }
}
