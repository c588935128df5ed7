//! The scheduler: drives a DAG to a terminal state under the worker cap,
//! the stage gate and the ordering policy.
//!
//! All task state lives behind one mutex. Workers report completions over
//! a join set; every mutation (dispatch, finalization, skip propagation,
//! gate release) happens under the lock, which is never held across
//! remote I/O.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::executor::{Executor, TaskOutcome};
use crate::model::{Dag, TaskStatus};

use super::queue::{OrderingPolicy, ReadyEntry, ReadyQueue};

/// Scheduler tuning for one run.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_workers: usize,
    pub policy: OrderingPolicy,
    /// Optional per-stage concurrency caps; clamped to `max_workers`
    pub stage_workers: BTreeMap<String, usize>,
}

impl SchedulerConfig {
    pub fn new(max_workers: usize, policy: OrderingPolicy, stage_workers: BTreeMap<String, usize>) -> Self {
        let max_workers = max_workers.max(1);
        let stage_workers = stage_workers
            .into_iter()
            .map(|(stage, cap)| {
                if cap > max_workers {
                    warn!(stage = %stage, cap, max_workers, "Stage cap exceeds worker cap, clamping");
                }
                (stage, cap.clamp(1, max_workers))
            })
            .collect();
        Self {
            max_workers,
            policy,
            stage_workers,
        }
    }
}

/// Status change notification consumed by the checkpointer and sinks.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub task_id: String,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: u32,
}

/// Per-task result of a run. `outcome` is present for tasks a worker
/// actually executed.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub status: TaskStatus,
    pub outcome: Option<TaskOutcome>,
}

/// Everything the run controller needs once the loop terminates.
#[derive(Debug)]
pub struct RunStats {
    /// Index-aligned with the DAG's tasks
    pub results: Vec<TaskResult>,
}

impl RunStats {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    /// Tasks the stop flag kept from ever starting.
    pub fn unstarted(&self) -> usize {
        self.results.iter().filter(|r| !r.status.is_terminal()).count()
    }

    pub fn overall_success(&self) -> bool {
        self.results.iter().all(|r| r.status == TaskStatus::Succeeded)
    }
}

struct SchedInner {
    statuses: Vec<TaskStatus>,
    pending: Vec<usize>,
    outcomes: Vec<Option<TaskOutcome>>,
    ready: ReadyQueue,
    /// pending_count == 0 but stage gate still closed
    waiting_gate: Vec<usize>,
    running: HashSet<usize>,
    running_per_stage: HashMap<String, usize>,
    /// Non-terminal task count per stage, indexed like `Dag::stage_order`
    stage_remaining: Vec<usize>,
    stopping: bool,
}

pub struct Scheduler {
    dag: Arc<Dag>,
    config: SchedulerConfig,
    executor: Arc<Executor>,
    estimates: Vec<Option<f64>>,
    stage_index: HashMap<String, usize>,
    inner: Mutex<SchedInner>,
    events: broadcast::Sender<TaskEvent>,
    abort_tx: watch::Sender<bool>,
}

impl Scheduler {
    /// Build a scheduler over `dag`. `initial` carries per-task statuses
    /// reconstructed from a checkpoint; tasks already terminal there are
    /// treated as finalized predecessors.
    pub fn new(
        dag: Arc<Dag>,
        config: SchedulerConfig,
        executor: Arc<Executor>,
        estimates: Vec<Option<f64>>,
        initial: Option<Vec<TaskStatus>>,
        abort_tx: watch::Sender<bool>,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        let statuses = initial.unwrap_or_else(|| vec![TaskStatus::Pending; dag.len()]);
        debug_assert_eq!(statuses.len(), dag.len());

        let stage_index: HashMap<String, usize> = dag
            .stage_order()
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i))
            .collect();

        let mut stage_remaining = vec![0usize; dag.stage_order().len()];
        for (i, task) in dag.tasks().iter().enumerate() {
            if let Some(stage) = &task.stage {
                if !statuses[i].is_terminal() {
                    stage_remaining[stage_index[stage]] += 1;
                }
            }
        }

        let pending: Vec<usize> = (0..dag.len())
            .map(|i| {
                dag.predecessors(i)
                    .iter()
                    .filter(|&&p| !statuses[p].is_terminal())
                    .count()
            })
            .collect();

        let inner = SchedInner {
            outcomes: vec![None; dag.len()],
            ready: ReadyQueue::new(config.policy),
            waiting_gate: Vec::new(),
            running: HashSet::new(),
            running_per_stage: HashMap::new(),
            stage_remaining,
            stopping: false,
            statuses,
            pending,
        };

        Self {
            dag,
            config,
            executor,
            estimates,
            stage_index,
            inner: Mutex::new(inner),
            events,
            abort_tx,
        }
    }

    /// Subscribe to status events. Call before [`Scheduler::run`].
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Stop admitting new tasks; in-flight tasks run to completion.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.stopping {
            info!("Stop requested, draining in-flight tasks");
            inner.stopping = true;
        }
    }

    /// Stop and additionally cancel every in-flight invocation.
    pub async fn abort(&self) {
        self.stop().await;
        info!("Abort requested, cancelling in-flight tasks");
        let _ = self.abort_tx.send(true);
    }

    /// Drive the DAG to a terminal state.
    pub async fn run(&self) -> RunStats {
        let mut join_set: JoinSet<(usize, TaskOutcome)> = JoinSet::new();
        let mut task_ids: HashMap<tokio::task::Id, usize> = HashMap::new();

        self.bootstrap().await;

        loop {
            self.dispatch(&mut join_set, &mut task_ids).await;

            {
                let inner = self.inner.lock().await;
                let queue_drained = inner.ready.is_empty() && inner.waiting_gate.is_empty();
                if inner.running.is_empty() && (queue_drained || inner.stopping) {
                    if !queue_drained && inner.stopping {
                        debug!("Stopping with {} tasks never started", inner.ready.len() + inner.waiting_gate.len());
                    }
                    break;
                }
                if inner.running.is_empty() && !queue_drained {
                    // Nothing running, nothing dispatchable: the stage
                    // gate cannot open. Misdeclared stage/predecessor
                    // combination; bail out rather than spin.
                    error!("Scheduler wedged: ready tasks exist but none are admissible");
                    break;
                }
            }

            match join_set.join_next_with_id().await {
                Some(Ok((id, (idx, outcome)))) => {
                    task_ids.remove(&id);
                    self.on_complete(idx, outcome).await;
                }
                Some(Err(join_err)) => {
                    let idx = task_ids.remove(&join_err.id());
                    if let Some(idx) = idx {
                        error!(task_id = %self.dag.task(idx).id, "Worker panicked: {join_err}");
                        let now = Utc::now();
                        let outcome = TaskOutcome {
                            status: TaskStatus::Failed,
                            started_at: now,
                            finished_at: now,
                            attempts: 0,
                            error_kind: None,
                            error_message: Some(format!("worker panicked: {join_err}")),
                        };
                        self.on_complete(idx, outcome).await;
                    }
                }
                None => break,
            }
        }

        let inner = self.inner.lock().await;
        RunStats {
            results: inner
                .statuses
                .iter()
                .zip(inner.outcomes.iter())
                .map(|(status, outcome)| TaskResult {
                    status: *status,
                    outcome: outcome.clone(),
                })
                .collect(),
        }
    }

    /// Seed the ready queue and propagate skips implied by statuses that
    /// were already terminal at start (resume).
    async fn bootstrap(&self) {
        let mut inner = self.inner.lock().await;

        // Propagate skips implied by pre-finalized statuses first, so a
        // flagged successor of an already-skipped task never gets
        // admitted below.
        let seeds: Vec<usize> = (0..self.dag.len())
            .filter(|&i| inner.statuses[i].is_failure_like())
            .collect();
        for t in seeds {
            for &s in self.dag.successors(t) {
                if self.dag.task(s).require_predecessor_success && inner.statuses[s] == TaskStatus::Pending {
                    self.finalize(&mut inner, s, TaskStatus::Skipped, None);
                }
            }
        }

        for i in 0..self.dag.len() {
            if inner.statuses[i] == TaskStatus::Pending && inner.pending[i] == 0 {
                self.admit(&mut inner, i);
            }
        }
        self.release_gate(&mut inner);
    }

    /// Fill free worker slots from the ready queue.
    async fn dispatch(&self, join_set: &mut JoinSet<(usize, TaskOutcome)>, task_ids: &mut HashMap<tokio::task::Id, usize>) {
        let mut inner = self.inner.lock().await;

        while inner.running.len() < self.config.max_workers && !inner.stopping {
            let running_per_stage = inner.running_per_stage.clone();
            let entry = inner.ready.pop_where(|e| {
                match &self.dag.task(e.task).stage {
                    None => true,
                    Some(stage) => match self.config.stage_workers.get(stage) {
                        None => true,
                        Some(&cap) => running_per_stage.get(stage).copied().unwrap_or(0) < cap,
                    },
                }
            });
            let Some(ReadyEntry { task: idx, .. }) = entry else {
                break;
            };

            inner.statuses[idx] = TaskStatus::Running;
            inner.running.insert(idx);
            let task = self.dag.task(idx).clone();
            if let Some(stage) = &task.stage {
                *inner.running_per_stage.entry(stage.clone()).or_insert(0) += 1;
            }
            self.emit(TaskEvent {
                task_id: task.id.clone(),
                status: TaskStatus::Running,
                started_at: Some(Utc::now()),
                finished_at: None,
                attempts: 0,
            });
            debug!(task_id = %task.id, "Dispatching");

            let executor = self.executor.clone();
            let handle = join_set.spawn(async move {
                let outcome = executor.execute(&task).await;
                (idx, outcome)
            });
            task_ids.insert(handle.id(), idx);
        }
    }

    /// Record a worker completion and unblock successors.
    async fn on_complete(&self, idx: usize, outcome: TaskOutcome) {
        let mut inner = self.inner.lock().await;
        inner.running.remove(&idx);
        if let Some(stage) = &self.dag.task(idx).stage {
            if let Some(count) = inner.running_per_stage.get_mut(stage) {
                *count = count.saturating_sub(1);
            }
        }
        let status = outcome.status;
        info!(task_id = %self.dag.task(idx).id, %status, attempts = outcome.attempts, "Task finalized");
        self.finalize(&mut inner, idx, status, Some(outcome));
        self.release_gate(&mut inner);
    }

    /// Finalize a task and walk its successors: decrement pending
    /// counts, skip flagged successors of failure-like outcomes
    /// (recursively, a task skipped here finalizes as SKIPPED and the
    /// rule re-applies through its own successors), admit tasks whose
    /// last predecessor just finalized.
    fn finalize(&self, inner: &mut SchedInner, idx: usize, status: TaskStatus, outcome: Option<TaskOutcome>) {
        self.mark_terminal(inner, idx, status, outcome);

        let mut stack = vec![(idx, status)];
        while let Some((t, st)) = stack.pop() {
            for &s in self.dag.successors(t) {
                inner.pending[s] = inner.pending[s].saturating_sub(1);
                if st.is_failure_like()
                    && self.dag.task(s).require_predecessor_success
                    && inner.statuses[s] == TaskStatus::Pending
                {
                    self.mark_terminal(inner, s, TaskStatus::Skipped, None);
                    stack.push((s, TaskStatus::Skipped));
                } else if inner.pending[s] == 0 && inner.statuses[s] == TaskStatus::Pending {
                    self.admit(inner, s);
                }
            }
        }
    }

    fn mark_terminal(&self, inner: &mut SchedInner, idx: usize, status: TaskStatus, outcome: Option<TaskOutcome>) {
        inner.statuses[idx] = status;
        let event = TaskEvent {
            task_id: self.dag.task(idx).id.clone(),
            status,
            started_at: outcome.as_ref().map(|o| o.started_at),
            finished_at: outcome.as_ref().map(|o| o.finished_at),
            attempts: outcome.as_ref().map(|o| o.attempts).unwrap_or(0),
        };
        inner.outcomes[idx] = outcome;
        if let Some(stage) = &self.dag.task(idx).stage {
            let k = self.stage_index[stage];
            inner.stage_remaining[k] = inner.stage_remaining[k].saturating_sub(1);
        }
        self.emit(event);
    }

    /// Queue a task whose predecessors have all finalized, or park it
    /// until its stage gate opens.
    fn admit(&self, inner: &mut SchedInner, idx: usize) {
        if self.gate_open(inner, idx) {
            inner.statuses[idx] = TaskStatus::Ready;
            inner.ready.push(ReadyEntry {
                task: idx,
                seq: idx,
                estimate: self.estimates.get(idx).copied().flatten(),
            });
            self.emit(TaskEvent {
                task_id: self.dag.task(idx).id.clone(),
                status: TaskStatus::Ready,
                started_at: None,
                finished_at: None,
                attempts: 0,
            });
        } else {
            inner.waiting_gate.push(idx);
        }
    }

    /// A task is admissible once every earlier stage has fully
    /// terminated. Unstaged tasks bypass the gate.
    fn gate_open(&self, inner: &SchedInner, idx: usize) -> bool {
        match &self.dag.task(idx).stage {
            None => true,
            Some(stage) => {
                let k = self.stage_index[stage];
                inner.stage_remaining[..k].iter().all(|&n| n == 0)
            }
        }
    }

    /// Move parked tasks whose gate has opened into the ready queue.
    fn release_gate(&self, inner: &mut SchedInner) {
        let mut parked = std::mem::take(&mut inner.waiting_gate);
        let mut still_parked = Vec::new();
        for idx in parked.drain(..) {
            if inner.statuses[idx] != TaskStatus::Pending {
                continue;
            }
            if self.gate_open(inner, idx) {
                inner.statuses[idx] = TaskStatus::Ready;
                inner.ready.push(ReadyEntry {
                    task: idx,
                    seq: idx,
                    estimate: self.estimates.get(idx).copied().flatten(),
                });
                self.emit(TaskEvent {
                    task_id: self.dag.task(idx).id.clone(),
                    status: TaskStatus::Ready,
                    started_at: None,
                    finished_at: None,
                    attempts: 0,
                });
            } else {
                still_parked.push(idx);
            }
        }
        inner.waiting_gate = still_parked;
    }

    fn emit(&self, event: TaskEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{BackoffPolicy, ClientPool, abort_channel};
    use crate::model::Task;
    use crate::remote::mock::{MockBehavior, MockCluster, MockFactory};
    use std::time::Duration;

    struct Harness {
        cluster: Arc<MockCluster>,
        scheduler: Arc<Scheduler>,
    }

    fn build(
        tasks: Vec<Task>,
        max_workers: usize,
        policy: OrderingPolicy,
        stage_workers: BTreeMap<String, usize>,
        estimates: Option<Vec<Option<f64>>>,
        initial: Option<Vec<TaskStatus>>,
    ) -> Harness {
        let cluster = MockCluster::new();
        let dag = Arc::new(Dag::build(tasks).unwrap());
        let pool = ClientPool::new(MockFactory::new(cluster.clone()), "RUSHTI_test", max_workers);
        let (abort_tx, abort_rx) = abort_channel();
        let executor = Arc::new(Executor::new(pool, 0, abort_rx).with_backoff(BackoffPolicy {
            initial: Duration::from_millis(2),
            cap: Duration::from_millis(8),
        }));
        let estimates = estimates.unwrap_or_else(|| vec![None; dag.len()]);
        let scheduler = Arc::new(Scheduler::new(
            dag,
            SchedulerConfig::new(max_workers, policy, stage_workers),
            executor,
            estimates,
            initial,
            abort_tx,
        ));
        Harness { cluster, scheduler }
    }

    fn task(id: &str, process: &str, preds: &[&str]) -> Task {
        Task::new(id, "prod", process).with_predecessors(preds.iter().copied())
    }

    #[tokio::test]
    async fn test_dependency_ordering_and_success() {
        let h = build(
            vec![task("a", "p_a", &[]), task("b", "p_b", &["a"]), task("c", "p_c", &["b"])],
            4,
            OrderingPolicy::Fifo,
            BTreeMap::new(),
            None,
            None,
        );
        for p in ["p_a", "p_b", "p_c"] {
            h.cluster.behave("prod", p, MockBehavior::Succeed { delay: Duration::from_millis(20) });
        }

        let stats = h.scheduler.run().await;
        assert!(stats.overall_success());

        let a_finish = h.cluster.calls_for("p_a")[0].finished_at.unwrap();
        let b_start = h.cluster.calls_for("p_b")[0].started_at;
        let b_finish = h.cluster.calls_for("p_b")[0].finished_at.unwrap();
        let c_start = h.cluster.calls_for("p_c")[0].started_at;
        assert!(b_start >= a_finish, "successor must start after predecessor finishes");
        assert!(c_start >= b_finish);
    }

    #[tokio::test]
    async fn test_worker_cap_respected() {
        let tasks: Vec<Task> = (0..6).map(|i| task(&format!("t{i}"), "load", &[])).collect();
        let h = build(tasks, 2, OrderingPolicy::Fifo, BTreeMap::new(), None, None);
        h.cluster.behave("prod", "load", MockBehavior::Succeed { delay: Duration::from_millis(25) });

        let stats = h.scheduler.run().await;
        assert!(stats.overall_success());
        assert!(h.cluster.peak_concurrency() <= 2, "peak {} > cap", h.cluster.peak_concurrency());
    }

    #[tokio::test]
    async fn test_independent_tasks_run_in_parallel() {
        let tasks: Vec<Task> = (0..3).map(|i| task(&format!("t{i}"), "load", &[])).collect();
        let h = build(tasks, 4, OrderingPolicy::Fifo, BTreeMap::new(), None, None);
        h.cluster.behave("prod", "load", MockBehavior::Succeed { delay: Duration::from_millis(60) });

        let stats = h.scheduler.run().await;
        assert!(stats.overall_success());
        assert_eq!(h.cluster.peak_concurrency(), 3);
    }

    #[tokio::test]
    async fn test_fifo_start_order_is_declaration_order() {
        let tasks: Vec<Task> = (0..4).map(|i| task(&format!("t{i}"), &format!("p{i}"), &[])).collect();
        let h = build(tasks, 1, OrderingPolicy::Fifo, BTreeMap::new(), None, None);
        for i in 0..4 {
            h.cluster.behave("prod", &format!("p{i}"), MockBehavior::Succeed { delay: Duration::from_millis(5) });
        }

        h.scheduler.run().await;
        let order: Vec<String> = h.cluster.calls().iter().map(|c| c.process.clone()).collect();
        assert_eq!(order, vec!["p0", "p1", "p2", "p3"]);
    }

    #[tokio::test]
    async fn test_longest_first_start_order() {
        let tasks: Vec<Task> = (0..4).map(|i| task(&format!("t{i}"), &format!("p{i}"), &[])).collect();
        // p1 longest, p3 unknown -> last
        let estimates = vec![Some(5.0), Some(50.0), Some(20.0), None];
        let h = build(tasks, 1, OrderingPolicy::LongestFirst, BTreeMap::new(), Some(estimates), None);
        for i in 0..4 {
            h.cluster.behave("prod", &format!("p{i}"), MockBehavior::Succeed { delay: Duration::from_millis(5) });
        }

        h.scheduler.run().await;
        let order: Vec<String> = h.cluster.calls().iter().map(|c| c.process.clone()).collect();
        assert_eq!(order, vec!["p1", "p2", "p0", "p3"]);
    }

    #[tokio::test]
    async fn test_skip_propagation_respects_flag() {
        let mut b = task("b", "p_b", &["a"]);
        b.require_predecessor_success = true;
        let c = task("c", "p_c", &["a"]);
        let mut d = task("d", "p_d", &["b"]);
        d.require_predecessor_success = true;
        let e = task("e", "p_e", &["b"]);

        let h = build(
            vec![task("a", "p_a", &[]), b, c, d, e],
            4,
            OrderingPolicy::Fifo,
            BTreeMap::new(),
            None,
            None,
        );
        h.cluster.behave("prod", "p_a", MockBehavior::FailProcess { message: "boom".to_string() });
        for p in ["p_b", "p_c", "p_d", "p_e"] {
            h.cluster.behave("prod", p, MockBehavior::Succeed { delay: Duration::ZERO });
        }

        let stats = h.scheduler.run().await;
        assert_eq!(stats.results[0].status, TaskStatus::Failed);
        assert_eq!(stats.results[1].status, TaskStatus::Skipped, "flagged successor skipped");
        assert_eq!(stats.results[2].status, TaskStatus::Succeeded, "unflagged successor runs");
        assert_eq!(stats.results[3].status, TaskStatus::Skipped, "skip cascades to flagged grandchild");
        assert_eq!(stats.results[4].status, TaskStatus::Succeeded, "unflagged grandchild still runs");
        assert!(!stats.overall_success());
        // skipped tasks never reached the remote
        assert!(h.cluster.calls_for("p_b").is_empty());
        assert!(h.cluster.calls_for("p_d").is_empty());
    }

    #[tokio::test]
    async fn test_stage_gate_is_strict() {
        let mut report = task("report", "p_report", &[]);
        report.stage = Some("report".to_string());
        let mut load1 = task("load1", "p_load", &[]);
        load1.stage = Some("load".to_string());
        let mut load2 = task("load2", "p_load", &[]);
        load2.stage = Some("load".to_string());

        // Declared report-last so stage order is load, report; no edges.
        let h = build(
            vec![load1, load2, report],
            4,
            OrderingPolicy::Fifo,
            BTreeMap::new(),
            None,
            None,
        );
        h.cluster.behave("prod", "p_load", MockBehavior::Succeed { delay: Duration::from_millis(40) });
        h.cluster.behave("prod", "p_report", MockBehavior::Succeed { delay: Duration::ZERO });

        let stats = h.scheduler.run().await;
        assert!(stats.overall_success());

        let report_start = h.cluster.calls_for("p_report")[0].started_at;
        for load in h.cluster.calls_for("p_load") {
            assert!(report_start >= load.finished_at.unwrap(), "stage 2 must wait for stage 1");
        }
    }

    #[tokio::test]
    async fn test_stage_cap_limits_concurrency() {
        let tasks: Vec<Task> = (0..4)
            .map(|i| {
                let mut t = task(&format!("t{i}"), "load", &[]);
                t.stage = Some("load".to_string());
                t
            })
            .collect();
        let mut caps = BTreeMap::new();
        caps.insert("load".to_string(), 1);
        let h = build(tasks, 4, OrderingPolicy::Fifo, caps, None, None);
        h.cluster.behave("prod", "load", MockBehavior::Succeed { delay: Duration::from_millis(20) });

        let stats = h.scheduler.run().await;
        assert!(stats.overall_success());
        assert_eq!(h.cluster.peak_concurrency(), 1);
    }

    #[tokio::test]
    async fn test_stop_drains_without_new_starts() {
        let tasks: Vec<Task> = (0..4).map(|i| task(&format!("t{i}"), "load", &[])).collect();
        let h = build(tasks, 1, OrderingPolicy::Fifo, BTreeMap::new(), None, None);
        h.cluster.behave("prod", "load", MockBehavior::Succeed { delay: Duration::from_millis(50) });

        let scheduler = h.scheduler.clone();
        let runner = tokio::spawn(async move { scheduler.run().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.scheduler.stop().await;

        let stats = runner.await.unwrap();
        // First task drains; the rest never start
        assert_eq!(stats.count(TaskStatus::Succeeded), 1);
        assert_eq!(stats.unstarted(), 3);
        assert_eq!(h.cluster.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_resume_skips_already_finalized_tasks() {
        let tasks = vec![
            task("a", "p_a", &[]),
            task("b", "p_b", &["a"]),
            task("c", "p_c", &["b"]),
        ];
        let initial = vec![TaskStatus::Succeeded, TaskStatus::Pending, TaskStatus::Pending];
        let h = build(tasks, 2, OrderingPolicy::Fifo, BTreeMap::new(), None, Some(initial));
        h.cluster.behave("prod", "p_b", MockBehavior::Succeed { delay: Duration::ZERO });
        h.cluster.behave("prod", "p_c", MockBehavior::Succeed { delay: Duration::ZERO });

        let stats = h.scheduler.run().await;
        assert!(stats.overall_success());
        assert!(h.cluster.calls_for("p_a").is_empty(), "finalized task must not re-run");
        assert_eq!(h.cluster.calls_for("p_b").len(), 1);
    }

    #[tokio::test]
    async fn test_resume_propagates_preexisting_skips() {
        let mut b = task("b", "p_b", &["a"]);
        b.require_predecessor_success = true;
        let tasks = vec![task("a", "p_a", &[]), b];
        let initial = vec![TaskStatus::Skipped, TaskStatus::Pending];
        let h = build(tasks, 2, OrderingPolicy::Fifo, BTreeMap::new(), None, Some(initial));

        let stats = h.scheduler.run().await;
        assert_eq!(stats.results[1].status, TaskStatus::Skipped);
        assert!(h.cluster.calls().is_empty());
    }

    #[tokio::test]
    async fn test_events_cover_lifecycle() {
        let h = build(vec![task("a", "p_a", &[])], 1, OrderingPolicy::Fifo, BTreeMap::new(), None, None);
        h.cluster.behave("prod", "p_a", MockBehavior::Succeed { delay: Duration::ZERO });

        let mut rx = h.scheduler.subscribe();
        h.scheduler.run().await;

        let mut statuses = Vec::new();
        while let Ok(event) = rx.try_recv() {
            statuses.push(event.status);
        }
        assert_eq!(
            statuses,
            vec![TaskStatus::Ready, TaskStatus::Running, TaskStatus::Succeeded]
        );
    }
}
