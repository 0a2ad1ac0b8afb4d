use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::api::{
    BrokerConfig, BrokerStats, DequeueResult, DequeuedRequest, EnqueueError, TenantId, WorkerId,
    WorkerShuttingDown,
};
use crate::assignments::TenantWorkerAssignments;
use crate::state::{StatsCounters, WorkSignal};
use crate::tree::TreeQueue;

struct BrokerState<T> {
    tree: TreeQueue<T>,
    assignments: TenantWorkerAssignments,
}

/// Multi-tenant request-queue broker.
///
/// Producers enqueue requests per tenant; workers pull them out in a global
/// round-robin over tenants, restricted to each tenant's shuffle-sharded
/// worker subset. The per-tenant FIFOs, the tenant rotation order, and the
/// tenant-to-worker assignments are guarded by one mutex, so every public
/// operation observes and leaves them consistent.
pub struct Broker<T> {
    state: Mutex<BrokerState<T>>,
    stats: StatsCounters,
    work_signal: WorkSignal,
    closed: AtomicBool,
}

impl<T> Broker<T> {
    /// Rotation index a worker passes on its first dequeue to start at the
    /// head of the order.
    pub const START_INDEX: isize = -1;

    pub fn new(config: BrokerConfig) -> Self {
        Self {
            state: Mutex::new(BrokerState {
                tree: TreeQueue::new(config.max_tenant_queue_size),
                assignments: TenantWorkerAssignments::new(config.forget_delay),
            }),
            stats: StatsCounters::new(),
            work_signal: WorkSignal::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Appends a request to the tenant's FIFO, creating the tenant (and its
    /// shard, when `tenant_max_workers` calls for one) as needed.
    pub fn enqueue_back(
        &self,
        tenant_id: &TenantId,
        payload: T,
        tenant_max_workers: usize,
    ) -> Result<(), EnqueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EnqueueError::Closed);
        }

        let mut state = self.state.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(EnqueueError::Closed);
        }
        state
            .assignments
            .create_or_update_tenant(tenant_id, tenant_max_workers)?;

        let path = [tenant_id.as_str()];
        if let Err(cause) = state.tree.enqueue_back_by_path(&path, payload) {
            drop(state);
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(EnqueueError::TooManyRequests(cause));
        }
        drop(state);

        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        self.stats.queue_len.fetch_add(1, Ordering::Relaxed);
        self.work_signal.notify_all();
        Ok(())
    }

    /// Re-enqueues a previously dequeued request at the head of the tenant's
    /// FIFO, ahead of everything back-enqueued. Used after a dispatch
    /// failure; the length cap is deliberately not enforced here.
    pub fn enqueue_front(
        &self,
        tenant_id: &TenantId,
        payload: T,
        tenant_max_workers: usize,
    ) -> Result<(), EnqueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EnqueueError::Closed);
        }

        let mut state = self.state.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(EnqueueError::Closed);
        }
        state
            .assignments
            .create_or_update_tenant(tenant_id, tenant_max_workers)?;

        let path = [tenant_id.as_str()];
        state.tree.enqueue_front_by_path(&path, payload);
        drop(state);

        self.stats.requeued.fetch_add(1, Ordering::Relaxed);
        self.stats.queue_len.fetch_add(1, Ordering::Relaxed);
        self.work_signal.notify_all();
        Ok(())
    }

    /// Hands the worker the next request it is eligible for, advancing the
    /// tenant rotation from just past `last_tenant_index`. A tenant drained
    /// by the dequeue is dropped from the rotation.
    ///
    /// New workers pass [`Broker::START_INDEX`]; afterwards they pass the
    /// `tenant_index` (or `last_tenant_index`) of the previous result.
    pub fn dequeue_for_worker(
        &self,
        last_tenant_index: isize,
        worker_id: &WorkerId,
    ) -> Result<DequeueResult<T>, WorkerShuttingDown> {
        let mut state = self.state.lock();

        let next = state
            .assignments
            .next_tenant_for_worker(last_tenant_index, worker_id)?;
        let Some((tenant_id, tenant_index)) = next else {
            drop(state);
            if self.closed.load(Ordering::Acquire) {
                return Ok(DequeueResult::Closed);
            }
            return Ok(DequeueResult::Empty { last_tenant_index });
        };

        let path = [tenant_id.as_str()];
        let payload = state.tree.dequeue_by_path(&path);
        if state.tree.get_node(&path).is_none() {
            // The dequeue drained and removed the leaf; retire the tenant.
            state.assignments.remove_tenant(&tenant_id);
        }
        drop(state);

        match payload {
            Some(payload) => {
                self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
                self.stats.queue_len.fetch_sub(1, Ordering::Relaxed);
                Ok(DequeueResult::Request(DequeuedRequest {
                    payload,
                    tenant: tenant_id,
                    tenant_index,
                }))
            }
            // The rotation matched a tenant whose FIFO was already empty
            // (left behind by a rejected enqueue). It has been retired; the
            // caller resumes after the matched position.
            None => Ok(DequeueResult::Empty {
                last_tenant_index: tenant_index,
            }),
        }
    }

    /// Like [`Broker::dequeue_for_worker`], but parks the calling thread
    /// until a request, a shutdown notice for this worker, or a broker close
    /// arrives.
    pub fn dequeue_blocking(
        &self,
        last_tenant_index: isize,
        worker_id: &WorkerId,
    ) -> Result<DequeueResult<T>, WorkerShuttingDown> {
        let mut index = last_tenant_index;
        loop {
            let observed = self.work_signal.current();
            match self.dequeue_for_worker(index, worker_id)? {
                DequeueResult::Request(request) => return Ok(DequeueResult::Request(request)),
                DequeueResult::Closed => return Ok(DequeueResult::Closed),
                DequeueResult::Empty { last_tenant_index } => {
                    if self.closed.load(Ordering::Acquire) {
                        return Ok(DequeueResult::Closed);
                    }
                    index = last_tenant_index;
                    self.work_signal.wait_for_change(observed);
                }
            }
        }
    }

    /// Registers a worker connection. The first connection from a new worker
    /// reshuffles every tenant's assignment.
    pub fn add_worker_connection(&self, worker_id: &WorkerId) {
        let mut state = self.state.lock();
        state.assignments.add_worker_connection(worker_id);
        drop(state);
        self.work_signal.notify_all();
    }

    /// Unregisters one worker connection. When the last connection drops, the
    /// worker is removed immediately if it announced shutdown or the forget
    /// delay is disabled; otherwise it lingers until forgotten.
    pub fn remove_worker_connection(&self, worker_id: &WorkerId, now: Instant) {
        let mut state = self.state.lock();
        state.assignments.remove_worker_connection(worker_id, now);
        drop(state);
        self.work_signal.notify_all();
    }

    /// Records a graceful-shutdown notice; the worker stops receiving
    /// requests at once and is removed when its last connection drops.
    /// Unknown workers are ignored, so duplicate notices are harmless.
    pub fn notify_worker_shutdown(&self, worker_id: &WorkerId) {
        let mut state = self.state.lock();
        state.assignments.notify_worker_shutdown(worker_id);
        drop(state);
        self.work_signal.notify_all();
    }

    /// Removes workers disconnected for longer than the forget delay,
    /// returning how many were dropped. Meant to be driven by a periodic
    /// tick well below the forget delay.
    pub fn forget_disconnected_workers(&self, now: Instant) -> usize {
        let mut state = self.state.lock();
        let forgotten = state.assignments.forget_disconnected_workers(now);
        drop(state);

        if forgotten > 0 {
            self.stats
                .forgotten_workers
                .fetch_add(forgotten as u64, Ordering::Relaxed);
            self.work_signal.notify_all();
        }
        forgotten
    }

    /// True iff no tenant has a queued request.
    pub fn is_empty(&self) -> bool {
        self.state.lock().tree.is_empty()
    }

    /// Rejects further enqueues and wakes every blocked worker so they can
    /// observe the close. Already-queued requests stay dequeueable.
    pub fn close(&self) {
        let was_closed = self.closed.swap(true, Ordering::Release);
        if !was_closed {
            self.work_signal.notify_all();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> BrokerStats {
        let (tenants, workers) = {
            let state = self.state.lock();
            (
                state.assignments.tenants.len() as u64,
                state.assignments.workers.len() as u64,
            )
        };

        BrokerStats {
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            requeued: self.stats.requeued.load(Ordering::Relaxed),
            dequeued: self.stats.dequeued.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            forgotten_workers: self.stats.forgotten_workers.load(Ordering::Relaxed),
            queue_len: self.stats.queue_len.load(Ordering::Relaxed),
            tenants,
            workers,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_state<R>(
        &self,
        f: impl FnOnce(&TreeQueue<T>, &TenantWorkerAssignments) -> R,
    ) -> R {
        let state = self.state.lock();
        f(&state.tree, &state.assignments)
    }

    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let state = self.state.lock();
        state.assignments.assert_invariants();
    }
}
