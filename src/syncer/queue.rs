//! Keyed work queue with coalescing, per-key serialization, and
//! backoff-driven requeue.
//!
//! The contract mirrors what the sync loops need: enqueueing a key already
//! waiting is a no-op, a key enqueued while its handler runs is re-run once
//! the handler finishes, and no two workers ever process the same key at the
//! same time. Keys whose handler fails retryably come back after an
//! exponential delay.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::retry::RetryConfig;
use crate::Result;

struct State<K> {
    ready: VecDeque<K>,
    queued: HashSet<K>,
    active: HashSet<K>,
    dirty: HashSet<K>,
    failures: HashMap<K, u32>,
}

impl<K> Default for State<K> {
    fn default() -> Self {
        Self {
            ready: VecDeque::new(),
            queued: HashSet::new(),
            active: HashSet::new(),
            dirty: HashSet::new(),
            failures: HashMap::new(),
        }
    }
}

/// Coalescing keyed work queue
pub struct WorkQueue<K> {
    state: Arc<Mutex<State<K>>>,
    notify: Arc<Notify>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            notify: Arc::clone(&self.notify),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone + Send + std::fmt::Debug + 'static,
{
    /// Empty queue
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Add a key. Coalesces: a key already waiting stays queued exactly
    /// once, and a key currently being processed is marked for one re-run.
    pub fn enqueue(&self, key: K) {
        let mut state = self.lock();
        if state.active.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.ready.push_back(key);
            self.notify.notify_one();
        }
    }

    /// Number of keys waiting (not counting in-flight ones)
    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    /// Whether no keys are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `workers` concurrent workers until `cancel` fires.
    ///
    /// Each worker pulls keys and invokes `handler`. Retryable failures are
    /// requeued after `retry.delay_for_attempt(failures)`; non-retryable
    /// failures are logged and dropped, and the next enqueue starts fresh.
    pub async fn run<F, Fut>(
        &self,
        workers: usize,
        retry: RetryConfig,
        cancel: CancellationToken,
        handler: F,
    ) where
        F: Fn(K) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        let futures: Vec<_> = (0..workers.max(1))
            .map(|_| self.worker(retry.clone(), cancel.clone(), handler.clone()))
            .collect();
        futures::future::join_all(futures).await;
    }

    async fn worker<F, Fut>(&self, retry: RetryConfig, cancel: CancellationToken, handler: F)
    where
        F: Fn(K) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        loop {
            let key = loop {
                if cancel.is_cancelled() {
                    return;
                }
                if let Some(key) = self.take() {
                    break key;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = self.notify.notified() => {}
                }
            };

            let result = handler(key.clone()).await;
            self.finish(key, result, &retry, &cancel);
        }
    }

    fn take(&self) -> Option<K> {
        let mut state = self.lock();
        let key = state.ready.pop_front()?;
        state.queued.remove(&key);
        state.active.insert(key.clone());
        Some(key)
    }

    fn finish(&self, key: K, result: Result<()>, retry: &RetryConfig, cancel: &CancellationToken) {
        let mut state = self.lock();
        state.active.remove(&key);

        match result {
            Ok(()) => {
                state.failures.remove(&key);
                if state.dirty.remove(&key) && state.queued.insert(key.clone()) {
                    state.ready.push_back(key);
                    self.notify.notify_one();
                }
            }
            Err(e) if e.is_retryable() => {
                let failures = state.failures.entry(key.clone()).or_insert(0);
                *failures += 1;
                let delay = retry.delay_for_attempt(*failures);
                warn!(?key, error = %e, failures = *failures, ?delay, "requeueing after failure");
                state.dirty.remove(&key);
                drop(state);

                let queue = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => queue.enqueue(key),
                    }
                });
            }
            Err(e) => {
                error!(?key, error = %e, "dropping key after non-retryable failure");
                state.failures.remove(&key);
                state.dirty.remove(&key);
            }
        }
    }

    /// Pop every waiting key, in order, without running workers
    #[cfg(test)]
    pub(crate) fn drain_for_test(&self) -> Vec<K> {
        let mut state = self.lock();
        let keys: Vec<K> = state.ready.drain(..).collect();
        state.queued.clear();
        keys
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<K>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                debug!("work queue lock poisoned, continuing");
                poisoned.into_inner()
            }
        }
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Eq + Hash + Clone + Send + std::fmt::Debug + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
