//! Scriptable in-memory remote used by unit and integration tests.
//!
//! A [`MockCluster`] models any number of instances. Tests script a
//! behavior per (instance, process), seed member sets for expansion
//! queries, and plant foreign sessions for exclusive-mode scenarios. The
//! cluster records every invocation with start/finish timestamps and
//! tracks peak concurrency so tests can assert scheduling properties.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{
    ClientFactory, ProcessCall, ProcessCompletion, ProcessProbe, RemoteClient, RemoteError, SessionInfo,
};

/// Scripted behavior of one remote process.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Complete successfully after `delay`
    Succeed { delay: Duration },
    /// Complete with the minor-error signal after `delay`
    MinorErrors { delay: Duration },
    /// Report a logical process failure
    FailProcess { message: String },
    /// Return a transient error `failures` times, then succeed
    TransientThenSucceed { failures: u32, delay: Duration },
    /// Fail every call with a transient error
    AlwaysTransient,
    /// Fail with a fatal (non-retryable) remote error
    FatalError { message: String },
    /// Never complete; only a cancel releases the invocation
    Hang,
}

/// One observed invocation.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub instance: String,
    pub process: String,
    pub invocation_id: String,
    pub parameters: Vec<(String, String)>,
    pub started_at: Instant,
    pub finished_at: Option<Instant>,
}

#[derive(Default)]
struct ClusterState {
    behaviors: HashMap<(String, String), MockBehavior>,
    remaining_failures: HashMap<(String, String), u32>,
    members: HashMap<(String, String), Vec<String>>,
    sessions: HashMap<String, Vec<SessionInfo>>,
    cancelled: HashSet<String>,
    connects: HashMap<String, usize>,
    calls: Vec<CallRecord>,
    next_session: u64,
}

/// Shared state of the scripted cluster.
pub struct MockCluster {
    state: Mutex<ClusterState>,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl MockCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ClusterState::default()),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Script a behavior for (instance, process).
    pub fn behave(&self, instance: &str, process: &str, behavior: MockBehavior) {
        let mut state = self.lock();
        if let MockBehavior::TransientThenSucceed { failures, .. } = &behavior {
            state
                .remaining_failures
                .insert((instance.to_string(), process.to_string()), *failures);
        }
        state
            .behaviors
            .insert((instance.to_string(), process.to_string()), behavior);
    }

    /// Seed the result of a member query on an instance.
    pub fn set_members(&self, instance: &str, expression: &str, members: &[&str]) {
        self.lock().members.insert(
            (instance.to_string(), expression.to_string()),
            members.iter().map(|s| s.to_string()).collect(),
        );
    }

    /// Plant a session that does not belong to any client of this
    /// cluster (another run, from the registry's point of view).
    pub fn add_foreign_session(&self, instance: &str, context: &str) -> String {
        let mut state = self.lock();
        state.next_session += 1;
        let id = format!("foreign-{}", state.next_session);
        state
            .sessions
            .entry(instance.to_string())
            .or_default()
            .push(SessionInfo { id: id.clone(), context: context.to_string() });
        id
    }

    pub fn remove_session(&self, instance: &str, id: &str) {
        if let Some(list) = self.lock().sessions.get_mut(instance) {
            list.retain(|s| s.id != id);
        }
    }

    pub fn sessions(&self, instance: &str) -> Vec<SessionInfo> {
        self.lock().sessions.get(instance).cloned().unwrap_or_default()
    }

    /// Highest number of simultaneously outstanding invocations seen.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.lock().calls.clone()
    }

    /// Invocations of one process, in start order.
    pub fn calls_for(&self, process: &str) -> Vec<CallRecord> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.process == process)
            .cloned()
            .collect()
    }

    pub fn connects(&self, instance: &str) -> usize {
        self.lock().connects.get(instance).copied().unwrap_or(0)
    }

    pub fn was_cancelled(&self, invocation_id: &str) -> bool {
        self.lock().cancelled.contains(invocation_id)
    }

    fn begin_call(&self, instance: &str, call: &ProcessCall) -> usize {
        let n = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(n, Ordering::SeqCst);
        let mut state = self.lock();
        state.calls.push(CallRecord {
            instance: instance.to_string(),
            process: call.process.clone(),
            invocation_id: call.invocation_id.clone(),
            parameters: call.parameters.clone(),
            started_at: Instant::now(),
            finished_at: None,
        });
        state.calls.len() - 1
    }

    fn end_call(&self, idx: usize) {
        self.current.fetch_sub(1, Ordering::SeqCst);
        if let Some(record) = self.lock().calls.get_mut(idx) {
            record.finished_at = Some(Instant::now());
        }
    }
}

/// Guard decrementing the concurrency gauge even when the invocation
/// future is dropped by a timeout.
struct CallGuard {
    cluster: Arc<MockCluster>,
    idx: usize,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.cluster.end_call(self.idx);
    }
}

/// Factory handing out clients bound to one cluster.
pub struct MockFactory {
    cluster: Arc<MockCluster>,
}

impl MockFactory {
    pub fn new(cluster: Arc<MockCluster>) -> Arc<Self> {
        Arc::new(Self { cluster })
    }
}

#[async_trait]
impl ClientFactory for MockFactory {
    async fn connect(&self, instance: &str, session_tag: &str) -> Result<Arc<dyn RemoteClient>, RemoteError> {
        let session_id = {
            let mut state = self.cluster.lock();
            *state.connects.entry(instance.to_string()).or_insert(0) += 1;
            state.next_session += 1;
            let id = format!("session-{}", state.next_session);
            state
                .sessions
                .entry(instance.to_string())
                .or_default()
                .push(SessionInfo { id: id.clone(), context: session_tag.to_string() });
            id
        };
        Ok(Arc::new(MockClient {
            cluster: self.cluster.clone(),
            instance: instance.to_string(),
            session_id,
        }))
    }
}

struct MockClient {
    cluster: Arc<MockCluster>,
    instance: String,
    session_id: String,
}

#[async_trait]
impl RemoteClient for MockClient {
    fn session_id(&self) -> Option<&str> {
        Some(&self.session_id)
    }

    async fn execute_process(&self, call: &ProcessCall) -> Result<ProcessCompletion, RemoteError> {
        let behavior = {
            let state = self.cluster.lock();
            state
                .behaviors
                .get(&(self.instance.clone(), call.process.clone()))
                .cloned()
        }
        .unwrap_or(MockBehavior::Succeed { delay: Duration::ZERO });

        let idx = self.cluster.begin_call(&self.instance, call);
        let _guard = CallGuard { cluster: self.cluster.clone(), idx };

        match behavior {
            MockBehavior::Succeed { delay } => {
                tokio::time::sleep(delay).await;
                Ok(ProcessCompletion::Success)
            }
            MockBehavior::MinorErrors { delay } => {
                tokio::time::sleep(delay).await;
                Ok(ProcessCompletion::MinorErrors)
            }
            MockBehavior::FailProcess { message } => Ok(ProcessCompletion::Failed { message }),
            MockBehavior::TransientThenSucceed { failures: _, delay } => {
                let key = (self.instance.clone(), call.process.clone());
                let failing = {
                    let mut state = self.cluster.lock();
                    match state.remaining_failures.get_mut(&key) {
                        Some(n) if *n > 0 => {
                            *n -= 1;
                            true
                        }
                        _ => false,
                    }
                };
                if failing {
                    Err(RemoteError::Transient("connection reset".to_string()))
                } else {
                    tokio::time::sleep(delay).await;
                    Ok(ProcessCompletion::Success)
                }
            }
            MockBehavior::AlwaysTransient => Err(RemoteError::Transient("503 service unavailable".to_string())),
            MockBehavior::FatalError { message } => Err(RemoteError::Fatal(message)),
            MockBehavior::Hang => {
                let deadline = Instant::now() + Duration::from_secs(30);
                loop {
                    if self.cluster.lock().cancelled.contains(&call.invocation_id) {
                        return Err(RemoteError::Fatal("invocation cancelled".to_string()));
                    }
                    if Instant::now() > deadline {
                        return Err(RemoteError::Fatal("mock hang expired".to_string()));
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
        }
    }

    async fn cancel_invocation(&self, invocation_id: &str) -> Result<(), RemoteError> {
        self.cluster.lock().cancelled.insert(invocation_id.to_string());
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionInfo>, RemoteError> {
        Ok(self.cluster.sessions(&self.instance))
    }

    async fn end_session(&self, session_id: &str) -> Result<(), RemoteError> {
        self.cluster.remove_session(&self.instance, session_id);
        Ok(())
    }

    async fn expand_members(&self, expression: &str) -> Result<Vec<String>, RemoteError> {
        let state = self.cluster.lock();
        state
            .members
            .get(&(self.instance.clone(), expression.to_string()))
            .cloned()
            .ok_or_else(|| RemoteError::Fatal(format!("unknown member expression '{expression}'")))
    }

    async fn probe_process(&self, process: &str) -> Result<ProcessProbe, RemoteError> {
        let state = self.cluster.lock();
        if state.behaviors.contains_key(&(self.instance.clone(), process.to_string())) {
            Ok(ProcessProbe::Exists)
        } else {
            Ok(ProcessProbe::NotFound)
        }
    }
}
