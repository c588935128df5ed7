//! Task and task status types.

use serde::{Deserialize, Serialize};

/// State of a task within a run. Any non-`Pending`/`Ready`/`Running`
/// status is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on predecessors or the stage gate
    #[default]
    Pending,
    /// All predecessors finalized, queued for a worker
    Ready,
    /// Claimed by a worker, invocation outstanding
    Running,
    /// Remote invocation reported success
    Succeeded,
    /// Invocation failed after retries, or deadline exceeded
    Failed,
    /// Never started: a predecessor failed and success was required
    Skipped,
    /// Deadline exceeded with remote cancel, or external cancellation
    Cancelled,
}

impl TaskStatus {
    /// True once the task can no longer change state within this run.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    /// True for terminal statuses that count as "not succeeded" when a
    /// successor requires predecessor success.
    pub fn is_failure_like(self) -> bool {
        matches!(self, Self::Failed | Self::Skipped | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One invocation of one remote process with one parameter set on one
/// instance. Parameters keep their declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique within a workflow
    pub id: String,
    /// Configured remote server this task runs on
    pub instance: String,
    /// Remote process name
    pub process: String,
    /// Ordered name -> value pairs handed to the process
    pub parameters: Vec<(String, String)>,
    /// Ids of tasks that must finalize before this one starts
    pub predecessors: Vec<String>,
    /// Optional stage label; stages execute in declared order
    pub stage: Option<String>,
    /// Deadline for the invocation, in seconds
    pub timeout_sec: Option<u64>,
    /// On deadline: issue a remote cancel instead of detaching
    pub cancel_at_timeout: bool,
    /// Skip this task when any predecessor did not succeed
    pub require_predecessor_success: bool,
    /// Idempotent: safe to re-invoke automatically during resume
    pub safe_retry: bool,
    /// Treat a "completed with minor errors" report as success
    pub succeed_on_minor_errors: bool,
}

impl Task {
    pub fn new(id: impl Into<String>, instance: impl Into<String>, process: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            instance: instance.into(),
            process: process.into(),
            parameters: Vec::new(),
            predecessors: Vec::new(),
            stage: None,
            timeout_sec: None,
            cancel_at_timeout: false,
            require_predecessor_success: false,
            safe_retry: false,
            succeed_on_minor_errors: false,
        }
    }

    /// Builder helper used heavily by tests.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push((key.into(), value.into()));
        self
    }

    /// Builder helper used heavily by tests.
    pub fn with_predecessors<I, S>(mut self, preds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.predecessors = preds.into_iter().map(Into::into).collect();
        self
    }

    /// Expansion directives carried by this task: `(target key, query
    /// expression)` for every parameter whose key ends with `*` and whose
    /// value is wrapped in `*{...}`.
    pub fn expansion_directives(&self) -> Vec<(String, String)> {
        self.parameters
            .iter()
            .filter_map(|(k, v)| {
                let key = k.strip_suffix('*')?;
                let expr = v.strip_prefix("*{")?.strip_suffix('}')?;
                Some((key.to_string(), expr.trim().to_string()))
            })
            .collect()
    }

    /// True when at least one parameter is an expansion directive.
    pub fn is_template(&self) -> bool {
        !self.expansion_directives().is_empty()
    }
}

/// One element of a parsed workflow file. After parametric expansion and
/// wait-barrier translation only `Task` items remain.
#[derive(Debug, Clone)]
pub enum ParsedItem {
    /// A concrete task
    Task(Task),
    /// A wait barrier from the legacy line form
    Wait,
    /// A task carrying one or more expansion directives
    Template(Task),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminality() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Ready.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Skipped.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_failure_like_excludes_success() {
        assert!(!TaskStatus::Succeeded.is_failure_like());
        assert!(TaskStatus::Failed.is_failure_like());
        assert!(TaskStatus::Skipped.is_failure_like());
        assert!(TaskStatus::Cancelled.is_failure_like());
    }

    #[test]
    fn test_expansion_directives() {
        let task = Task::new("t", "prod", "load")
            .with_param("pRegion*", "*{ [Region].Members }")
            .with_param("pYear", "2024");

        let directives = task.expansion_directives();
        assert_eq!(directives, vec![("pRegion".to_string(), "[Region].Members".to_string())]);
        assert!(task.is_template());
    }

    #[test]
    fn test_plain_task_is_not_template() {
        let task = Task::new("t", "prod", "load").with_param("pYear", "2024");
        assert!(!task.is_template());
        // A literal `*{...}` value under a normal key is not a directive
        let task = Task::new("t", "prod", "load").with_param("pExpr", "*{ raw }");
        assert!(!task.is_template());
    }

    #[test]
    fn test_status_display_snake_case() {
        assert_eq!(TaskStatus::Succeeded.to_string(), "succeeded");
        assert_eq!(TaskStatus::Cancelled.to_string(), "cancelled");
    }
}
