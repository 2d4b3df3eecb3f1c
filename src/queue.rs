//! A blocking handoff queue used to fan background results into one consumer.
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// A FIFO queue with blocking dequeue, safe for many producers and many
/// consumers.
pub struct HandoffQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T> Default for HandoffQueue<T> {
    fn default() -> Self {
        HandoffQueue::new()
    }
}

impl<T> HandoffQueue<T> {
    pub fn new() -> HandoffQueue<T> {
        HandoffQueue {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    // Items are plain values; a panicking producer cannot leave them torn.
    fn lock(&self) -> MutexGuard<VecDeque<T>> {
        match self.items.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Appends an item and wakes one waiting consumer.
    pub fn enqueue(&self, item: T) {
        self.lock().push_back(item);
        self.available.notify_one();
    }

    /// Blocks until an item is available.
    pub fn dequeue(&self) -> T {
        let mut items = self.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }
            items = match self.available.wait(items) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Blocks until an item is available or the timeout elapses, in which
    /// case `None` is returned.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            items = match self.available.wait_timeout(items, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Takes an item without blocking.
    pub fn try_dequeue(&self) -> Option<T> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Runs `work` on a background thread and enqueues its result on `queue`
/// when it finishes.
pub fn submit_work<T, F>(queue: &Arc<HandoffQueue<T>>, work: F)
    where T: Send + 'static,
          F: FnOnce() -> T + Send + 'static
{
    let queue = queue.clone();
    let spawned = thread::Builder::new()
        .name("mongodb-topology-work".to_owned())
        .spawn(move || queue.enqueue(work()));

    if let Err(err) = spawned {
        error!("unable to spawn a background worker: {}", err);
    }
}
