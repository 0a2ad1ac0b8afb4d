use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::api::WorkerId;

/// Connection bookkeeping for a single worker.
#[derive(Debug)]
pub(crate) struct WorkerConn {
    /// Number of active connections from this worker.
    pub(crate) connections: usize,
    /// True once the worker announced a graceful shutdown.
    pub(crate) shutting_down: bool,
    /// When the last connection was unregistered. `None` while connected.
    pub(crate) disconnected_at: Option<Instant>,
}

/// Tracks connected workers and keeps a sorted id list as the canonical input
/// to shard computation. Workers that disconnect without a shutdown notice
/// are kept for `forget_delay` so a brief network flap does not reshuffle
/// every tenant's assignment.
pub(crate) struct WorkerRegistry {
    workers: HashMap<WorkerId, WorkerConn>,
    sorted_ids: Vec<WorkerId>,
    forget_delay: Duration,
}

impl WorkerRegistry {
    pub(crate) fn new(forget_delay: Duration) -> Self {
        Self {
            workers: HashMap::new(),
            sorted_ids: Vec::new(),
            forget_delay,
        }
    }

    /// Strictly ascending; mirrors the registry's key set exactly.
    pub(crate) fn sorted_ids(&self) -> &[WorkerId] {
        &self.sorted_ids
    }

    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether the worker may be handed requests: registered and not
    /// announced as shutting down.
    pub(crate) fn is_active(&self, worker_id: &WorkerId) -> bool {
        self.workers
            .get(worker_id)
            .is_some_and(|worker| !worker.shutting_down)
    }

    /// Registers one connection. Returns true when the worker is new to the
    /// roster, in which case tenant assignments must be recomputed.
    pub(crate) fn add_connection(&mut self, worker_id: &WorkerId) -> bool {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.connections += 1;
            // The worker may have re-connected inside the forget window.
            worker.shutting_down = false;
            worker.disconnected_at = None;
            return false;
        }

        self.workers.insert(
            worker_id.clone(),
            WorkerConn {
                connections: 1,
                shutting_down: false,
                disconnected_at: None,
            },
        );
        match self.sorted_ids.binary_search(worker_id) {
            Ok(_) => panic!("sorted worker ids out of sync with registry"),
            Err(ix) => self.sorted_ids.insert(ix, worker_id.clone()),
        }
        true
    }

    /// Unregisters one connection. Returns true when the worker left the
    /// roster. Panics if the worker is unknown or has no connections; that
    /// can only happen through unbalanced add/remove calls and means the
    /// composite state is corrupt.
    pub(crate) fn remove_connection(&mut self, worker_id: &WorkerId, now: Instant) -> bool {
        let remove_now = {
            let worker = match self.workers.get_mut(worker_id) {
                Some(worker) if worker.connections > 0 => worker,
                _ => panic!("unexpected connection count for worker {worker_id}"),
            };
            worker.connections -= 1;
            if worker.connections > 0 {
                return false;
            }
            if worker.shutting_down || self.forget_delay == Duration::ZERO {
                true
            } else {
                // Keep the worker on the roster until the forget delay runs
                // out or a shutdown notice arrives.
                worker.disconnected_at = Some(now);
                false
            }
        };

        if remove_now {
            self.remove_worker(worker_id);
        }
        remove_now
    }

    /// Records a graceful-shutdown notice. Unknown workers are ignored: the
    /// notice may race with the removal of the last connection. Returns true
    /// when the worker left the roster.
    pub(crate) fn notify_shutdown(&mut self, worker_id: &WorkerId) -> bool {
        let Some(worker) = self.workers.get_mut(worker_id) else {
            return false;
        };
        if worker.connections == 0 {
            self.remove_worker(worker_id);
            return true;
        }
        // Removal happens when the final connection unregisters, bypassing
        // the forget delay.
        worker.shutting_down = true;
        false
    }

    /// Removes every worker that has had zero connections for longer than the
    /// forget delay, returning their ids. No-op when the delay is disabled.
    pub(crate) fn forget_disconnected(&mut self, now: Instant) -> Vec<WorkerId> {
        if self.forget_delay == Duration::ZERO {
            return Vec::new();
        }

        let expired: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, worker)| {
                worker.connections == 0
                    && worker
                        .disconnected_at
                        .is_some_and(|at| now.duration_since(at) > self.forget_delay)
            })
            .map(|(worker_id, _)| worker_id.clone())
            .collect();

        for worker_id in &expired {
            self.remove_worker(worker_id);
        }
        expired
    }

    fn remove_worker(&mut self, worker_id: &WorkerId) {
        self.workers.remove(worker_id);
        match self.sorted_ids.binary_search(worker_id) {
            Ok(ix) => {
                self.sorted_ids.remove(ix);
            }
            Err(_) => panic!("sorted worker ids out of sync with registry"),
        }
    }

    #[cfg(test)]
    pub(crate) fn get(&self, worker_id: &WorkerId) -> Option<&WorkerConn> {
        self.workers.get(worker_id)
    }
}
