//! Per-instance connection pool.
//!
//! A client is checked out for exactly one invocation at a time and
//! returned to an idle slot afterwards. Demand beyond `max_per_instance`
//! blocks on the instance's semaphore. Clients whose invocation was
//! abandoned (timeout, transport error) are discarded instead of
//! returned, since their connection state is unknown.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::remote::{ClientFactory, RemoteClient, RemoteError};

/// A checked-out client. Dropping it without [`ClientPool::give_back`]
/// discards the client and frees the slot.
pub struct PooledClient {
    pub client: Arc<dyn RemoteClient>,
    instance: String,
    _permit: OwnedSemaphorePermit,
}

impl PooledClient {
    pub fn instance(&self) -> &str {
        &self.instance
    }
}

struct PoolInner {
    idle: HashMap<String, Vec<Arc<dyn RemoteClient>>>,
    semaphores: HashMap<String, Arc<Semaphore>>,
}

pub struct ClientPool {
    factory: Arc<dyn ClientFactory>,
    session_tag: String,
    max_per_instance: usize,
    inner: Mutex<PoolInner>,
}

impl ClientPool {
    pub fn new(factory: Arc<dyn ClientFactory>, session_tag: impl Into<String>, max_per_instance: usize) -> Arc<Self> {
        Arc::new(Self {
            factory,
            session_tag: session_tag.into(),
            max_per_instance: max_per_instance.max(1),
            inner: Mutex::new(PoolInner {
                idle: HashMap::new(),
                semaphores: HashMap::new(),
            }),
        })
    }

    pub fn session_tag(&self) -> &str {
        &self.session_tag
    }

    /// Check a client out for one invocation, connecting when no idle
    /// client exists. Blocks while the instance is at capacity.
    pub async fn checkout(&self, instance: &str) -> Result<PooledClient, RemoteError> {
        let semaphore = {
            let mut inner = self.inner.lock().await;
            inner
                .semaphores
                .entry(instance.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_instance)))
                .clone()
        };

        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| RemoteError::Fatal("connection pool closed".to_string()))?;

        let idle = {
            let mut inner = self.inner.lock().await;
            inner.idle.get_mut(instance).and_then(Vec::pop)
        };

        let client = match idle {
            Some(client) => client,
            None => {
                debug!(instance, "Opening new connection");
                self.factory.connect(instance, &self.session_tag).await?
            }
        };

        Ok(PooledClient {
            client,
            instance: instance.to_string(),
            _permit: permit,
        })
    }

    /// Return a healthy client to the idle list.
    pub async fn give_back(&self, pooled: PooledClient) {
        let mut inner = self.inner.lock().await;
        inner
            .idle
            .entry(pooled.instance.clone())
            .or_default()
            .push(pooled.client.clone());
        // permit drops here, freeing the slot
    }

    /// End every idle session. Called once when the run finishes.
    pub async fn shutdown(&self) {
        let idle: Vec<Arc<dyn RemoteClient>> = {
            let mut inner = self.inner.lock().await;
            inner.idle.drain().flat_map(|(_, clients)| clients).collect()
        };
        for client in idle {
            if let Some(id) = client.session_id() {
                let _ = client.end_session(id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::mock::{MockCluster, MockFactory};
    use std::time::Duration;

    #[tokio::test]
    async fn test_sequential_checkouts_reuse_client() {
        let cluster = MockCluster::new();
        let pool = ClientPool::new(MockFactory::new(cluster.clone()), "RUSHTI_wf", 4);

        let first = pool.checkout("prod").await.unwrap();
        pool.give_back(first).await;
        let second = pool.checkout("prod").await.unwrap();
        pool.give_back(second).await;

        assert_eq!(cluster.connects("prod"), 1);
    }

    #[tokio::test]
    async fn test_concurrent_checkouts_open_distinct_clients() {
        let cluster = MockCluster::new();
        let pool = ClientPool::new(MockFactory::new(cluster.clone()), "RUSHTI_wf", 4);

        let a = pool.checkout("prod").await.unwrap();
        let b = pool.checkout("prod").await.unwrap();
        assert_eq!(cluster.connects("prod"), 2);
        pool.give_back(a).await;
        pool.give_back(b).await;
    }

    #[tokio::test]
    async fn test_capacity_blocks_excess_demand() {
        let cluster = MockCluster::new();
        let pool = ClientPool::new(MockFactory::new(cluster.clone()), "RUSHTI_wf", 1);

        let held = pool.checkout("prod").await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.checkout("prod")).await;
        assert!(blocked.is_err(), "second checkout should block at capacity 1");

        pool.give_back(held).await;
        let unblocked = tokio::time::timeout(Duration::from_millis(50), pool.checkout("prod")).await;
        assert!(unblocked.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_client_is_not_reused() {
        let cluster = MockCluster::new();
        let pool = ClientPool::new(MockFactory::new(cluster.clone()), "RUSHTI_wf", 4);

        let first = pool.checkout("prod").await.unwrap();
        drop(first);
        let _second = pool.checkout("prod").await.unwrap();
        assert_eq!(cluster.connects("prod"), 2);
    }

    #[tokio::test]
    async fn test_shutdown_ends_idle_sessions() {
        let cluster = MockCluster::new();
        let pool = ClientPool::new(MockFactory::new(cluster.clone()), "RUSHTI_wf", 4);

        let client = pool.checkout("prod").await.unwrap();
        pool.give_back(client).await;
        assert_eq!(cluster.sessions("prod").len(), 1);

        pool.shutdown().await;
        assert!(cluster.sessions("prod").is_empty());
    }
}
