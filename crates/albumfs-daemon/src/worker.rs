//! Background workers
//!
//! Two long-running loops drive the reconciliation engine: the pull worker
//! services the pull queue and drains one local-change entry per cycle,
//! and the priority worker (started lazily on the first priority request)
//! handles reads that must not wait for the periodic cycle. Both park on
//! their queue's wakeup when idle and are joined on shutdown after a final
//! cache snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use albumfs_core::{CacheError, Locator};

use crate::observe::Observer;
use crate::queue::Queues;
use crate::reconcile::Reconciler;
use crate::store::CacheStore;

/// How long an idle worker parks before re-checking its queues
const IDLE_TICK: Duration = Duration::from_secs(10);

pub struct Scheduler {
    store: Arc<CacheStore>,
    queues: Arc<Queues>,
    reconciler: Arc<Reconciler>,
    observer: Arc<Observer>,
    snapshot_interval: Duration,
    stop: AtomicBool,
    pull_handle: Mutex<Option<JoinHandle<()>>>,
    priority_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<CacheStore>,
        queues: Arc<Queues>,
        reconciler: Arc<Reconciler>,
        observer: Arc<Observer>,
        snapshot_interval_secs: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            queues,
            reconciler,
            observer,
            snapshot_interval: Duration::from_secs(snapshot_interval_secs.max(1)),
            stop: AtomicBool::new(false),
            pull_handle: Mutex::new(None),
            priority_handle: Mutex::new(None),
        })
    }

    /// Start the pull worker. The priority worker starts on its own when
    /// the first priority request arrives.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.pull_handle.lock();
        if handle.is_some() {
            return;
        }
        let this = self.clone();
        *handle = Some(
            std::thread::Builder::new()
                .name("albumfs-pull".to_string())
                .spawn(move || this.pull_loop())
                .expect("spawning the pull worker"),
        );
    }

    /// Queue a locator for an out-of-band refresh (e.g. a read that found
    /// no cached content) and make sure the priority worker is running.
    pub fn request_priority(self: &Arc<Self>, locator: &Locator) {
        self.queues.priority.push(locator.clone());
        let mut handle = self.priority_handle.lock();
        if handle.is_none() {
            let this = self.clone();
            *handle = Some(
                std::thread::Builder::new()
                    .name("albumfs-priority".to_string())
                    .spawn(move || this.priority_loop())
                    .expect("spawning the priority worker"),
            );
        }
        self.queues.priority_wake.notify();
    }

    /// Push the whole local-change queue right now (the `.control/sync`
    /// action); only entries that still fail stay queued.
    pub fn sync(&self) {
        self.reconciler.sync();
    }

    /// Final snapshot, then stop and join both workers.
    pub fn shutdown(&self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.store.snapshot() {
            warn!("final cache snapshot failed: {e}");
        }
        self.queues.pull_wake.notify();
        self.queues.priority_wake.notify();
        if let Some(handle) = self.pull_handle.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.priority_handle.lock().take() {
            let _ = handle.join();
        }
        info!("workers stopped");
    }

    fn pull_loop(&self) {
        debug!("pull worker running");
        let mut last_snapshot = Instant::now();
        while !self.stop.load(Ordering::SeqCst) {
            if self.reconciler.is_online() {
                if let Some(locator) = self.queues.pull.pop() {
                    match self.reconciler.reconcile(&locator, false) {
                        Ok(()) => {}
                        Err(CacheError::NoNetworkConnection) => {
                            // the engine just went offline; keep the item
                            // for when connectivity returns
                            self.queues.pull.push_front(locator);
                        }
                        Err(e) => {
                            self.observer
                                .record(format!("error while updating {locator}: {e}"));
                        }
                    }
                }
            }
            if self.reconciler.is_online() {
                if let Some(locator) = self.queues.local.pop() {
                    match self.reconciler.push_change(&locator) {
                        Ok(()) => {}
                        Err(CacheError::NoNetworkConnection) => {
                            self.queues.local.push_front(locator);
                        }
                        Err(e) => {
                            self.observer
                                .record(format!("error while pushing {locator}: {e}"));
                            // interval gating keeps the retry rate sane
                            self.queues.local.push(locator);
                        }
                    }
                }
            }

            if last_snapshot.elapsed() >= self.snapshot_interval {
                if let Err(e) = self.store.snapshot() {
                    warn!("periodic cache snapshot failed: {e}");
                }
                last_snapshot = Instant::now();
            }

            let idle = !self.reconciler.is_online()
                || (self.queues.pull.is_empty() && self.queues.local.is_empty());
            if idle && !self.stop.load(Ordering::SeqCst) {
                self.queues.pull_wake.wait(IDLE_TICK);
            }
        }
        debug!("pull worker exiting");
    }

    fn priority_loop(&self) {
        debug!("priority worker running");
        while !self.stop.load(Ordering::SeqCst) {
            match self.queues.priority.pop() {
                Some(locator) if self.reconciler.is_online() => {
                    if let Err(e) = self.reconciler.reconcile(&locator, true) {
                        self.observer
                            .record(format!("priority update of {locator} failed: {e}"));
                    }
                }
                Some(locator) => {
                    // offline: leave it for the reconnect
                    self.queues.priority.push_front(locator);
                    self.queues.priority_wake.wait(IDLE_TICK);
                }
                None => self.queues.priority_wake.wait(IDLE_TICK),
            }
        }
        debug!("priority worker exiting");
    }
}
