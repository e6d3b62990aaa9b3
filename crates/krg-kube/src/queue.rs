//! Deduplicating work queue with per-key backoff
//!
//! Semantics follow the usual controller work queue:
//! - a key waiting in the queue is never queued twice
//! - a key is handed to at most one worker at a time; adding it while it is
//!   being processed marks it dirty and it is queued again on [`WorkQueue::done`]
//! - failed keys are requeued after an exponential delay with jitter

use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// Work queue shared by a watch task and its workers
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

struct State<T> {
    queue: VecDeque<T>,
    /// Keys waiting to be processed (queued, or to be requeued after processing)
    dirty: HashSet<T>,
    processing: HashSet<T>,
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    /// Create a queue whose retry delay starts at `base_delay` and never exceeds `max_delay`
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                base_delay,
                max_delay,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a key for processing
    pub fn add(&self, item: T) {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Queue a key once `delay` has elapsed
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Queue a key after its next backoff delay
    pub fn add_rate_limited(&self, item: T) -> Duration {
        let delay = self.backoff(&item);
        self.add_after(item, delay);
        delay
    }

    /// Record a failure for `item` and return how long to wait before retrying
    pub fn backoff(&self, item: &T) -> Duration {
        let failures = {
            let mut state = self.state();
            let count = state.failures.entry(item.clone()).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };
        backoff_delay(self.inner.base_delay, self.inner.max_delay, failures)
    }

    /// Clear the failure history of a key
    pub fn forget(&self, item: &T) {
        self.state().failures.remove(item);
    }

    /// Number of failures recorded since the last [`forget`](Self::forget)
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.state().failures.get(item).copied().unwrap_or(0)
    }

    /// Wait for the next key; `None` once the queue is shut down
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// Mark a key handed out by [`get`](Self::get) as finished
    pub fn done(&self, item: &T) {
        let mut state = self.state();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stop handing out keys; waiting workers return `None`
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Number of keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Delay before retry number `failures` (starting at 1)
///
/// `base * 2^(failures - 1)` plus up to 10% jitter, capped at `max`.
pub(crate) fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(31);
    let delay = base.saturating_mul(1u32 << exponent).min(max);
    let jitter = delay.mul_f64(rand::rng().random_range(0.0..0.1));
    (delay + jitter).min(max)
}
