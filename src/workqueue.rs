//! Per-reconciler work queues.
//!
//! Each reconciler owns one queue and a pool of workers draining it. Keys
//! are deduplicated: a key that is queued twice is processed once, and a key
//! that is re-added while a worker holds it is marked dirty and re-queued
//! when that worker finishes. Failed keys come back with exponential
//! backoff. On shutdown the queue stops accepting work and `next` returns
//! `None` once the backlog is drained.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::error::Error;

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

pub fn backoff_for(attempts: u32) -> Duration {
    BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(attempts.saturating_sub(1)))
        .min(BACKOFF_CAP)
}

struct QueueState<K> {
    queue: VecDeque<K>,
    queued: HashSet<K>,
    active: HashSet<K>,
    dirty: HashSet<K>,
    failures: HashMap<K, u32>,
    shutdown: bool,
}

impl<K> Default for QueueState<K> {
    fn default() -> Self {
        QueueState {
            queue: VecDeque::new(),
            queued: HashSet::new(),
            active: HashSet::new(),
            dirty: HashSet::new(),
            failures: HashMap::new(),
            shutdown: false,
        }
    }
}

pub struct WorkQueue<K> {
    name: &'static str,
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

impl<K> WorkQueue<K>
where
    K: Clone + Debug + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(WorkQueue {
            name,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        })
    }

    /// Enqueues a key unless it is already waiting. Keys currently being
    /// processed are marked dirty and come back once their worker is done.
    pub fn add(&self, key: K) {
        {
            let mut state = self.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            if state.active.contains(&key) {
                state.dirty.insert(key);
                return;
            }
            if !state.queued.insert(key.clone()) {
                return;
            }
            state.queue.push_back(key);
        }
        self.notify.notify_one();
    }

    /// Next key to process, or `None` when the queue has shut down and
    /// drained.
    pub async fn next(self: &Arc<Self>) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().unwrap();
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    return Some(key);
                }
                if state.shutdown {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks a key's processing finished. A key that went dirty in the
    /// meantime is immediately re-queued.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.state.lock().unwrap();
            state.active.remove(key);
            if state.dirty.remove(key) && !state.shutdown && state.queued.insert(key.clone()) {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Clears the failure history of a key after a successful run.
    pub fn forget(&self, key: &K) {
        self.state.lock().unwrap().failures.remove(key);
    }

    /// Schedules a failed key to come back after an exponentially growing
    /// delay.
    pub fn requeue_after_failure(self: &Arc<Self>, key: K) {
        let delay = {
            let mut state = self.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            let attempts = state.failures.entry(key.clone()).or_insert(0);
            *attempts += 1;
            backoff_for(*attempts)
        };
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Stops accepting new work; workers drain what is queued and exit.
    pub fn shutdown(&self) {
        self.state.lock().unwrap().shutdown = true;
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    fn is_idle(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.queue.is_empty() && state.active.is_empty() && state.dirty.is_empty()
    }
}

/// Spawns `count` workers draining `queue` through `handler`. Store errors
/// are retried with backoff; anything else has already been recorded as a
/// condition and is dropped after logging.
pub fn spawn_workers<K, F, Fut>(
    queue: Arc<WorkQueue<K>>,
    count: usize,
    handler: F,
) -> Vec<JoinHandle<()>>
where
    K: Clone + Debug + Eq + Hash + Send + Sync + 'static,
    F: Fn(K) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send,
{
    (0..count)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let handler = handler.clone();
            tokio::spawn(async move {
                while let Some(key) = queue.next().await {
                    match handler(key.clone()).await {
                        Ok(()) => {
                            queue.forget(&key);
                            queue.done(&key);
                        }
                        Err(err) if err.is_retryable() => {
                            warn!(queue = queue.name, ?key, %err, "reconcile failed, will retry");
                            queue.done(&key);
                            queue.requeue_after_failure(key);
                        }
                        Err(err) => {
                            error!(queue = queue.name, ?key, %err, "reconcile failed");
                            queue.forget(&key);
                            queue.done(&key);
                        }
                    }
                }
            })
        })
        .collect()
}
