use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

#[derive(Debug)]
pub(crate) struct StatsCounters {
    pub(crate) enqueued: AtomicU64,
    pub(crate) requeued: AtomicU64,
    pub(crate) dequeued: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) forgotten_workers: AtomicU64,
    pub(crate) queue_len: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn new() -> Self {
        Self {
            enqueued: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            forgotten_workers: AtomicU64::new(0),
            queue_len: AtomicU64::new(0),
        }
    }
}

/// Sequence-stamped wakeup. Waiters snapshot the sequence before inspecting
/// the queues; a notification between the snapshot and the wait is not lost.
#[derive(Debug)]
pub(crate) struct WorkSignal {
    mutex: Mutex<()>,
    condvar: Condvar,
    seq: AtomicU64,
}

impl WorkSignal {
    pub(crate) fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
            seq: AtomicU64::new(0),
        }
    }

    pub(crate) fn current(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    pub(crate) fn notify_all(&self) {
        self.seq.fetch_add(1, Ordering::Release);
        self.condvar.notify_all();
    }

    pub(crate) fn wait_for_change(&self, last_seen: u64) {
        let mut guard = self.mutex.lock().expect("work signal mutex poisoned");
        while self.seq.load(Ordering::Acquire) == last_seen {
            guard = self
                .condvar
                .wait(guard)
                .expect("work signal condvar poisoned");
        }
    }
}
