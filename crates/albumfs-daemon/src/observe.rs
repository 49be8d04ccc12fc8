//! Observability sink
//!
//! An explicit, passed-in sink instead of a global stream: a rolling log
//! ring feeding the `.control/log` file, plus atomic counters rendered by
//! `.control/stats`. Everything also goes through `tracing` for normal
//! process logging.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

/// Engine activity counters
#[derive(Default)]
pub struct Counters {
    pub pulls: AtomicU64,
    pub pushes: AtomicU64,
    pub downloads: AtomicU64,
    pub uploads: AtomicU64,
    pub open_files: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub pulls: u64,
    pub pushes: u64,
    pub downloads: u64,
    pub uploads: u64,
    pub open_files: u64,
}

impl Counters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            pulls: self.pulls.load(Ordering::Relaxed),
            pushes: self.pushes.load(Ordering::Relaxed),
            downloads: self.downloads.load(Ordering::Relaxed),
            uploads: self.uploads.load(Ordering::Relaxed),
            open_files: self.open_files.load(Ordering::Relaxed),
        }
    }
}

pub struct Observer {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
    pub counters: Counters,
}

impl Observer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            counters: Counters::default(),
        }
    }

    /// Append a timestamped line to the rolling log
    pub fn record(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        debug!("{msg}");
        let line = format!(
            "{} :: {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            msg
        );
        let mut lines = self.lines.lock();
        if lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Current log content, newest line last
    pub fn render(&self) -> String {
        let lines = self.lines.lock();
        let mut out = String::new();
        for line in lines.iter() {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}
