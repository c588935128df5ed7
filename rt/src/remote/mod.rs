//! The narrow capability the core consumes from the remote server.
//!
//! Everything the orchestrator knows about the outside world goes through
//! [`RemoteClient`]: run a process, cancel an invocation, enumerate
//! sessions, expand a member query, probe a process. HTTP specifics live
//! in the [`http`] adapter; tests script the [`mock`] implementation.

pub mod http;
pub mod mock;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Remote call failure. `Transient` is retryable per the executor's
/// backoff policy; `Fatal` is not.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("transient remote failure: {0}")]
    Transient(String),

    #[error("remote failure: {0}")]
    Fatal(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// One process invocation request. The caller mints `invocation_id` so a
/// cancel can be issued while the invocation is still outstanding.
#[derive(Debug, Clone)]
pub struct ProcessCall {
    pub process: String,
    pub parameters: Vec<(String, String)>,
    /// Session context tag the server records for this connection
    pub session_tag: String,
    pub invocation_id: String,
    /// Advisory deadline forwarded to the server, when set
    pub timeout: Option<Duration>,
}

/// What the remote reported for a completed invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessCompletion {
    Success,
    /// Completed, but the process log contains minor errors
    MinorErrors,
    /// Logical failure reported by the process itself
    Failed { message: String },
}

/// One entry of the server's session registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    /// Context tag the session was opened with
    pub context: String,
}

/// Result of probing a process name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessProbe {
    Exists,
    NotFound,
}

/// Connection to one remote instance. A client is never shared between
/// concurrent invocations; the executor's pool enforces that.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Server-assigned id of this connection's session, when known.
    /// Used to keep a run from blocking on its own sessions.
    fn session_id(&self) -> Option<&str> {
        None
    }

    async fn execute_process(&self, call: &ProcessCall) -> Result<ProcessCompletion, RemoteError>;

    async fn cancel_invocation(&self, invocation_id: &str) -> Result<(), RemoteError>;

    async fn list_sessions(&self) -> Result<Vec<SessionInfo>, RemoteError>;

    async fn end_session(&self, session_id: &str) -> Result<(), RemoteError>;

    /// Evaluate a member query expression, returning member names.
    async fn expand_members(&self, expression: &str) -> Result<Vec<String>, RemoteError>;

    async fn probe_process(&self, process: &str) -> Result<ProcessProbe, RemoteError>;
}

/// Opens clients against configured instances. The executor pool, the
/// parser's expansion step, the validator and the exclusive lock all
/// obtain connections through this seam.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(&self, instance: &str, session_tag: &str) -> Result<Arc<dyn RemoteClient>, RemoteError>;
}
