//! Delayed release of cache entries
//!
//! Releases sit in a queue ordered by expiry time. A background ticker pops
//! every expired entry and runs its action once. The action itself decides
//! whether the entry is still unreferenced; re-registering never touches
//! the queue.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

const TICK: Duration = Duration::from_millis(50);

type ReleaseAction = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Queue {
    entries: Vec<(Instant, ReleaseAction)>,
}

impl Queue {
    fn insert(&mut self, expiry: Instant, action: ReleaseAction) {
        let pos = self.entries.partition_point(|(t, _)| *t <= expiry);
        self.entries.insert(pos, (expiry, action));
    }

    fn pop_expired(&mut self, now: Instant) -> Vec<ReleaseAction> {
        let expired = self.entries.partition_point(|(t, _)| *t <= now);
        self.entries
            .drain(..expired)
            .map(|(_, action)| action)
            .collect()
    }

    fn drain_all(&mut self) -> Vec<ReleaseAction> {
        self.entries.drain(..).map(|(_, action)| action).collect()
    }
}

pub struct KeepAliveManager {
    queue: Arc<Mutex<Queue>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl KeepAliveManager {
    /// Start the manager; must be called inside a tokio runtime
    pub fn start() -> Self {
        let queue = Arc::new(Mutex::new(Queue::default()));
        let ticking = Arc::clone(&queue);
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let expired = ticking
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pop_expired(Instant::now());
                if !expired.is_empty() {
                    debug!("Keep-alive: releasing {} entries", expired.len());
                }
                for action in expired {
                    action();
                }
            }
        });
        Self {
            queue,
            ticker: Mutex::new(Some(ticker)),
        }
    }

    /// Run `action` once `lifetime` has passed
    pub fn schedule_release(&self, lifetime: Duration, action: impl FnOnce() + Send + 'static) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(Instant::now() + lifetime, Box::new(action));
    }

    pub fn pending(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    /// Release everything now, regardless of expiry
    pub fn purge_all(&self) {
        let actions = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain_all();
        debug!("Keep-alive: purging {} entries", actions.len());
        for action in actions {
            action();
        }
    }

    pub fn shutdown(&self) {
        if let Some(ticker) = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            ticker.abort();
        }
    }
}

impl Drop for KeepAliveManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
