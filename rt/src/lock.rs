//! Cluster-wide mutual exclusion over the remote session registry.
//!
//! A run announces itself through the context tag its execution sessions
//! carry: `RUSHTI_<workflow>` for a normal run, `RUSHTIX_<workflow>` for
//! an exclusive one. Acquiring the lock means polling every instance's
//! session registry until no conflicting tag remains. Probe connections
//! use a non-qualifying tag so two waiting runs cannot block each other.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::remote::{ClientFactory, RemoteError};

pub const NORMAL_TAG_PREFIX: &str = "RUSHTI_";
pub const EXCLUSIVE_TAG_PREFIX: &str = "RUSHTIX_";

/// The context tag a run's execution sessions are opened with.
pub fn session_tag(workflow: &str, exclusive: bool) -> String {
    if exclusive {
        format!("{EXCLUSIVE_TAG_PREFIX}{workflow}")
    } else {
        format!("{NORMAL_TAG_PREFIX}{workflow}")
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    /// Maps to the reserved exit code 5
    #[error("exclusive-mode wait timed out after {0:?}")]
    Timeout(Duration),

    #[error("session registry probe failed: {0}")]
    Remote(#[from] RemoteError),
}

pub struct ExclusiveLock {
    factory: Arc<dyn ClientFactory>,
    workflow: String,
    exclusive: bool,
    polling_interval: Duration,
    timeout: Duration,
}

impl ExclusiveLock {
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        workflow: impl Into<String>,
        exclusive: bool,
        polling_interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            factory,
            workflow: workflow.into(),
            exclusive,
            polling_interval,
            timeout,
        }
    }

    /// A session conflicts when it carries a qualifying tag: an
    /// exclusive run yields to any tagged session, a normal run only to
    /// exclusive ones.
    fn conflicts(&self, context: &str) -> bool {
        if context.starts_with(EXCLUSIVE_TAG_PREFIX) {
            return true;
        }
        self.exclusive && context.starts_with(NORMAL_TAG_PREFIX)
    }

    /// Wait until no conflicting session exists on any of `instances`.
    /// Re-probes every `polling_interval`; fails with
    /// [`LockError::Timeout`] at the hard deadline.
    pub async fn acquire(&self, instances: &[String]) -> Result<(), LockError> {
        let probe_tag = format!("rushti-probe-{}", self.workflow);
        let deadline = Instant::now() + self.timeout;

        loop {
            let mut blocker: Option<(String, String)> = None;

            'probe: for instance in instances {
                let client = self.factory.connect(instance, &probe_tag).await?;
                let sessions = client.list_sessions().await;
                if let Some(id) = client.session_id() {
                    let _ = client.end_session(id).await;
                }
                let own_id = client.session_id();
                for session in sessions? {
                    if own_id == Some(session.id.as_str()) {
                        continue;
                    }
                    if self.conflicts(&session.context) {
                        blocker = Some((instance.clone(), session.context));
                        break 'probe;
                    }
                }
            }

            match blocker {
                None => {
                    info!(workflow = %self.workflow, exclusive = self.exclusive, "Lock acquired");
                    return Ok(());
                }
                Some((instance, context)) => {
                    if Instant::now() >= deadline {
                        return Err(LockError::Timeout(self.timeout));
                    }
                    debug!(%instance, %context, "Waiting on conflicting session");
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    tokio::time::sleep(self.polling_interval.min(remaining)).await;
                }
            }
        }
    }
}
