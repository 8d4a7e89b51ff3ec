// Copyright 2024 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Reconcile loop plumbing shared by the policy and template controllers.

mod queue;

pub use queue::{ExponentialBackoff, WorkQueue};

use crate::cache::ResourceCache;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// ReconcileError tells the worker whether to retry a key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    /// Retry with backoff, e.g. a schema that is not available yet.
    #[error("transient: {0}")]
    Transient(String),

    /// Retrying will not help until the object changes.
    #[error("{0}")]
    Permanent(String),
}

impl ReconcileError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ReconcileError::Transient(_))
    }
}

/// Reconciler recomputes the derived state of one key.
pub trait Reconciler<K>: Send + Sync + 'static {
    fn reconcile(&self, key: &K) -> Result<(), ReconcileError>;
}

/// Process one key and settle it on the queue.
pub fn process_key<K, R>(queue: &WorkQueue<K>, reconciler: &R, key: K)
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    R: Reconciler<K> + ?Sized,
{
    match reconciler.reconcile(&key) {
        Ok(()) => queue.forget(&key),
        Err(err) if err.is_transient() => {
            debug!(key = ?key, error = %err, requeues = queue.num_requeues(&key), "requeueing");
            queue.add_rate_limited(key.clone());
        }
        Err(err) => {
            warn!(key = ?key, error = %err, "reconcile failed");
            queue.forget(&key);
        }
    }
    queue.done(&key);
}

const CACHE_SYNC_POLL: Duration = Duration::from_millis(10);

/// Wait until the cache has completed its initial list.
pub async fn wait_for_cache_sync(cache: &dyn ResourceCache) {
    while !cache.has_synced() {
        tokio::time::sleep(CACHE_SYNC_POLL).await;
    }
}

/// Spawn `workers` tasks that drain `queue` until it shuts down.
pub fn spawn_workers<K, R>(queue: WorkQueue<K>, reconciler: Arc<R>, workers: usize) -> Vec<JoinHandle<()>>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    R: Reconciler<K> + ?Sized,
{
    (0..workers.max(1))
        .map(|_| {
            let queue = queue.clone();
            let reconciler = Arc::clone(&reconciler);
            tokio::spawn(async move {
                while let Some(key) = queue.get().await {
                    process_key(&queue, reconciler.as_ref(), key);
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Flaky {
        attempts: Mutex<Vec<&'static str>>,
    }

    impl Reconciler<&'static str> for Flaky {
        fn reconcile(&self, key: &&'static str) -> Result<(), ReconcileError> {
            let mut attempts = self.attempts.lock();
            attempts.push(*key);
            if *key == "flaky" && attempts.iter().filter(|k| **k == "flaky").count() < 3 {
                return Err(ReconcileError::Transient("not yet".to_string()));
            }
            if *key == "broken" {
                return Err(ReconcileError::Permanent("bad object".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_workers_retry_transient_failures() {
        let queue = WorkQueue::new(ExponentialBackoff::new(
            Duration::from_millis(10),
            Duration::from_secs(1),
        ));
        let reconciler = Arc::new(Flaky {
            attempts: Mutex::new(Vec::new()),
        });
        let handles = spawn_workers(queue.clone(), reconciler.clone(), 2);

        queue.add("flaky");
        queue.add("broken");
        tokio::time::sleep(Duration::from_millis(200)).await;
        queue.shut_down();
        for handle in handles {
            handle.await.unwrap();
        }

        let attempts = reconciler.attempts.lock();
        assert_eq!(attempts.iter().filter(|k| **k == "flaky").count(), 3);
        assert_eq!(attempts.iter().filter(|k| **k == "broken").count(), 1);
        assert_eq!(queue.num_requeues(&"flaky"), 0);
    }
}
