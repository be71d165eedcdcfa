//! # Queue module
//!
//! This module provide the rate limited work queue driving every
//! reconciler, a key is owned by at most one worker between get and done

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::sync::{watch, Notify};
use tracing::trace;

// -----------------------------------------------------------------------------
// Constants

pub const BASE_DELAY: Duration = Duration::from_millis(5);
pub const MAX_DELAY: Duration = Duration::from_secs(1000);

// -----------------------------------------------------------------------------
// State structure

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

// -----------------------------------------------------------------------------
// RateLimitingQueue structure

pub struct RateLimitingQueue {
    state: Mutex<State>,
    notify: Notify,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    base_delay: Duration,
    max_delay: Duration,
}

impl RateLimitingQueue {
    pub fn new() -> Arc<Self> {
        Self::with_delays(BASE_DELAY, MAX_DELAY)
    }

    pub fn with_delays(base_delay: Duration, max_delay: Duration) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Arc::new(Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            shutdown_tx,
            shutdown_rx,
            base_delay,
            max_delay,
        })
    }

    /// enqueues the key, a key already queued or currently processed is
    /// deduplicated and deferred until its release
    pub fn add(&self, key: &str) {
        let mut state = self.state.lock().expect("queue mutex to not be poisoned");

        if state.shutting_down || state.dirty.contains(key) {
            return;
        }

        state.dirty.insert(key.to_string());
        if state.processing.contains(key) {
            return;
        }

        state.queue.push_back(key.to_string());
        drop(state);
        self.notify.notify_one();
    }

    /// enqueues the key once the delay elapsed
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        let queue = Arc::clone(self);
        let key = key.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// enqueues the key with the exponential backoff earned by its previous
    /// failures
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let failures = {
            let mut state = self.state.lock().expect("queue mutex to not be poisoned");
            let entry = state.failures.entry(key.to_string()).or_insert(0);
            let current = *entry;
            *entry += 1;
            current
        };

        let exp = self
            .base_delay
            .mul_f64(2_f64.powi(failures.min(31) as i32));
        let delay = exp.min(self.max_delay);

        trace!(key = key, failures = failures, delay = ?delay, "Requeue key with backoff");
        self.add_after(key, delay);
    }

    /// clears the failure history of the key
    pub fn forget(&self, key: &str) {
        let mut state = self.state.lock().expect("queue mutex to not be poisoned");
        state.failures.remove(key);
    }

    /// returns how many times the key failed since it was last forgotten
    pub fn retries(&self, key: &str) -> u32 {
        let state = self.state.lock().expect("queue mutex to not be poisoned");
        state.failures.get(key).copied().unwrap_or(0)
    }

    /// hands out the next key, blocking while the queue is empty and
    /// returning none once the queue shuts down
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            let mut shutdown = self.shutdown_rx.to_owned();

            {
                let mut state = self.state.lock().expect("queue mutex to not be poisoned");

                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.to_owned());
                    if !state.queue.is_empty() {
                        // keep waking siblings while items remain
                        self.notify.notify_one();
                    }

                    return Some(key);
                }

                if state.shutting_down {
                    return None;
                }
            }

            tokio::select! {
                _ = notified => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// releases the key, re-queueing it when it was re-added while
    /// processed
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock().expect("queue mutex to not be poisoned");

        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// wakes every blocked worker, undelivered keys are discarded and
    /// in-flight syncs complete on their own
    pub fn shut_down(&self) {
        {
            let mut state = self.state.lock().expect("queue mutex to not be poisoned");
            state.shutting_down = true;
            state.queue.clear();
        }

        let _ = self.shutdown_tx.send(true);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock().expect("queue mutex to not be poisoned");
        state.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// -----------------------------------------------------------------------------
// Unit tests

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::{timeout, Instant};

    use super::*;

    #[tokio::test]
    async fn duplicate_adds_deliver_once() {
        let queue = RateLimitingQueue::new();
        queue.add("v1:Pod:ns1:w1");
        queue.add("v1:Pod:ns1:w1");

        assert_eq!(queue.get().await.as_deref(), Some("v1:Pod:ns1:w1"));
        assert!(timeout(Duration::from_millis(50), queue.get()).await.is_err());
    }

    #[tokio::test]
    async fn key_is_single_flight_until_done() {
        let queue = RateLimitingQueue::new();
        queue.add("k");

        let key = queue.get().await.unwrap();

        // a re-add while the key is processed defers delivery
        queue.add("k");
        assert!(timeout(Duration::from_millis(50), queue.get()).await.is_err());

        queue.done(&key);
        assert_eq!(queue.get().await.as_deref(), Some("k"));
    }

    #[tokio::test]
    async fn done_without_pending_add_releases_silently() {
        let queue = RateLimitingQueue::new();
        queue.add("k");

        let key = queue.get().await.unwrap();
        queue.done(&key);

        assert!(timeout(Duration::from_millis(50), queue.get()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_back_off_exponentially() {
        let queue = RateLimitingQueue::with_delays(
            Duration::from_secs(1),
            Duration::from_secs(1000),
        );

        let begin = Instant::now();
        queue.add_rate_limited("k");
        queue.get().await.unwrap();
        assert!(begin.elapsed() >= Duration::from_secs(1));
        queue.done("k");

        let begin = Instant::now();
        queue.add_rate_limited("k");
        queue.get().await.unwrap();
        assert!(begin.elapsed() >= Duration::from_secs(2));
        queue.done("k");

        assert_eq!(queue.retries("k"), 2);
        queue.forget("k");
        assert_eq!(queue.retries("k"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_add_fires_at_deadline_without_earlier_duplicate() {
        let queue = RateLimitingQueue::new();

        let begin = Instant::now();
        queue.add_after("k", Duration::from_secs(2));

        // nothing is delivered ahead of the deadline
        assert!(timeout(Duration::from_secs(1), queue.get()).await.is_err());

        assert_eq!(queue.get().await.as_deref(), Some("k"));
        assert!(begin.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn shutdown_unblocks_workers() {
        let queue = RateLimitingQueue::new();

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };

        // give the worker a chance to block
        tokio::task::yield_now().await;
        queue.shut_down();

        assert_eq!(waiter.await.unwrap(), None);
        queue.add("late");
        assert_eq!(queue.get().await, None);
    }
}
