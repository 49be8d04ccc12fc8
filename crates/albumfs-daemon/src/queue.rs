//! Work queues
//!
//! Three dedup FIFO queues of locators drive the reconciliation workers:
//! the pull queue (best-effort freshness), the priority pull queue (reads
//! that must not wait for the periodic cycle) and the local-change queue
//! (push-pending). Workers park on a [`Wakeup`] with a timeout and are
//! nudged whenever an item lands while the engine is online.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use albumfs_core::Locator;

/// Dedup FIFO of locators; enqueuing a locator already present is a no-op.
#[derive(Default)]
pub struct WorkQueue {
    items: Mutex<VecDeque<Locator>>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append unless already queued; returns whether the item was inserted
    pub fn push(&self, locator: Locator) -> bool {
        let mut items = self.items.lock();
        if items.contains(&locator) {
            return false;
        }
        items.push_back(locator);
        true
    }

    /// Put an item back at the head (used when a worker must leave a
    /// failed item queued)
    pub fn push_front(&self, locator: Locator) {
        let mut items = self.items.lock();
        if !items.contains(&locator) {
            items.push_front(locator);
        }
    }

    pub fn pop(&self) -> Option<Locator> {
        self.items.lock().pop_front()
    }

    /// Front item without removing it
    pub fn peek(&self) -> Option<Locator> {
        self.items.lock().front().cloned()
    }

    pub fn remove(&self, locator: &Locator) {
        self.items.lock().retain(|l| l != locator);
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }

    /// Take everything, preserving order
    pub fn drain(&self) -> Vec<Locator> {
        self.items.lock().drain(..).collect()
    }

    /// Newline-separated full paths, for the control-file rendering
    pub fn render(&self) -> String {
        let items = self.items.lock();
        let mut out = String::new();
        for l in items.iter() {
            out.push_str(&l.full_name());
            out.push('\n');
        }
        out
    }
}

/// Interruptible parking spot for a worker loop
#[derive(Default)]
pub struct Wakeup {
    nudged: Mutex<bool>,
    signal: Condvar,
}

impl Wakeup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut nudged = self.nudged.lock();
        *nudged = true;
        self.signal.notify_all();
    }

    /// Park for at most `timeout`, returning early when notified. A
    /// notification delivered while the worker was busy is consumed by the
    /// next wait instead of being lost.
    pub fn wait(&self, timeout: Duration) {
        let mut nudged = self.nudged.lock();
        if !*nudged {
            self.signal.wait_for(&mut nudged, timeout);
        }
        *nudged = false;
    }
}

/// The three engine queues plus the parking spots of both workers
#[derive(Default)]
pub struct Queues {
    pub pull: WorkQueue,
    pub priority: WorkQueue,
    pub local: WorkQueue,
    pub pull_wake: Wakeup,
    pub priority_wake: Wakeup,
}

impl Queues {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn loc(path: &str) -> Locator {
        Locator::parse(path).unwrap()
    }

    #[test]
    fn enqueue_is_idempotent() {
        let q = WorkQueue::new();
        assert!(q.push(loc("/alice/Trip")));
        assert!(!q.push(loc("/alice/Trip")));
        assert_eq!(q.len(), 1);
        assert!(q.push(loc("/alice/Family")));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn fifo_order() {
        let q = WorkQueue::new();
        q.push(loc("/a"));
        q.push(loc("/b"));
        assert_eq!(q.pop(), Some(loc("/a")));
        assert_eq!(q.pop(), Some(loc("/b")));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn push_front_requeues_at_head() {
        let q = WorkQueue::new();
        q.push(loc("/a"));
        q.push(loc("/b"));
        let head = q.pop().unwrap();
        q.push_front(head.clone());
        assert_eq!(q.peek(), Some(head));
    }

    #[test]
    fn render_lists_full_paths() {
        let q = WorkQueue::new();
        q.push(loc("/alice/Trip"));
        q.push(loc("/alice/Trip/a.jpg"));
        assert_eq!(q.render(), "/alice/Trip\n/alice/Trip/a.jpg\n");
    }

    #[test]
    fn wakeup_interrupts_wait() {
        let wake = Arc::new(Wakeup::new());
        let w2 = wake.clone();
        let start = std::time::Instant::now();
        let handle = std::thread::spawn(move || {
            w2.wait(Duration::from_secs(10));
        });
        std::thread::sleep(Duration::from_millis(50));
        wake.notify();
        handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn pending_notify_is_consumed_by_next_wait() {
        let wake = Wakeup::new();
        wake.notify();
        let start = std::time::Instant::now();
        wake.wait(Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
