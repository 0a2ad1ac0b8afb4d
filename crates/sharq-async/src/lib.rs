//! Tokio adapter for the sharq broker.
//!
//! The core broker is synchronous and never blocks except in
//! `dequeue_blocking`. This crate wires it into an async runtime:
//! - [`AsyncBroker`] shares a [`Broker`] across tasks,
//! - [`WorkerConnection`] ties a worker's connection lifecycle to a value
//!   (registered on creation, unregistered on drop) and exposes an async
//!   `recv` that parks off the runtime via `spawn_blocking`,
//! - [`spawn_forget_loop`] drives the periodic disconnected-worker sweep the
//!   broker expects from its surrounding service.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

pub use sharq_core::{
    Broker, BrokerConfig, BrokerStats, DequeueResult, DequeuedRequest, EnqueueError,
    InvalidTenantId, MaxQueueLengthExceeded, TenantId, WorkerId, WorkerShuttingDown,
};

pub struct AsyncBroker<T> {
    inner: Arc<Broker<T>>,
}

impl<T> Clone for AsyncBroker<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> AsyncBroker<T> {
    pub fn new(inner: Arc<Broker<T>>) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &Arc<Broker<T>> {
        &self.inner
    }

    pub fn enqueue_back(
        &self,
        tenant_id: &TenantId,
        payload: T,
        tenant_max_workers: usize,
    ) -> Result<(), EnqueueError> {
        self.inner.enqueue_back(tenant_id, payload, tenant_max_workers)
    }

    pub fn enqueue_front(
        &self,
        tenant_id: &TenantId,
        payload: T,
        tenant_max_workers: usize,
    ) -> Result<(), EnqueueError> {
        self.inner.enqueue_front(tenant_id, payload, tenant_max_workers)
    }

    pub fn stats(&self) -> BrokerStats {
        self.inner.stats()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn close(&self) {
        self.inner.close();
    }

    /// Registers a connection for `worker_id` and returns a handle that pulls
    /// requests for it. Dropping the handle unregisters the connection.
    pub fn connect_worker(&self, worker_id: WorkerId) -> WorkerConnection<T> {
        self.inner.add_worker_connection(&worker_id);
        WorkerConnection {
            broker: self.clone(),
            worker_id,
            last_tenant_index: Broker::<T>::START_INDEX,
        }
    }
}

/// One registered worker connection with its rotation cursor.
pub struct WorkerConnection<T> {
    broker: AsyncBroker<T>,
    worker_id: WorkerId,
    last_tenant_index: isize,
}

impl<T> WorkerConnection<T> {
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }
}

impl<T: Send + Sync + 'static> WorkerConnection<T> {
    /// Waits for the next request this worker is eligible for. Returns `None`
    /// once the broker is closed or the worker was told to shut down.
    pub async fn recv(&mut self) -> Option<DequeuedRequest<T>> {
        loop {
            let broker = Arc::clone(self.broker.inner());
            let worker_id = self.worker_id.clone();
            let last_index = self.last_tenant_index;
            let joined =
                tokio::task::spawn_blocking(move || broker.dequeue_blocking(last_index, &worker_id))
                    .await;

            match joined {
                Ok(Ok(DequeueResult::Request(request))) => {
                    self.last_tenant_index = request.tenant_index;
                    return Some(request);
                }
                Ok(Ok(DequeueResult::Closed)) => return None,
                Ok(Ok(DequeueResult::Empty { last_tenant_index })) => {
                    self.last_tenant_index = last_tenant_index;
                    tokio::task::yield_now().await;
                }
                Ok(Err(WorkerShuttingDown)) => {
                    debug!(worker = %self.worker_id, "worker told to shut down; stopping receive loop");
                    return None;
                }
                Err(join_error) => {
                    warn!(worker = %self.worker_id, error = %join_error, "dequeue task failed");
                    return None;
                }
            }
        }
    }

    /// Puts a request back at the head of its tenant's queue after a failed
    /// dispatch, so it is retried before anything queued behind it.
    pub fn requeue(
        &self,
        request: DequeuedRequest<T>,
        tenant_max_workers: usize,
    ) -> Result<(), EnqueueError> {
        warn!(
            worker = %self.worker_id,
            tenant = %request.tenant,
            "dispatch failed; re-enqueueing request at the front"
        );
        self.broker
            .enqueue_front(&request.tenant, request.payload, tenant_max_workers)
    }
}

impl<T> Drop for WorkerConnection<T> {
    fn drop(&mut self) {
        self.broker
            .inner
            .remove_worker_connection(&self.worker_id, Instant::now());
    }
}

/// Periodically sweeps workers whose forget delay has lapsed. Run this at a
/// cadence well below the configured delay; the task exits once the broker is
/// closed.
pub fn spawn_forget_loop<T: Send + Sync + 'static>(
    broker: AsyncBroker<T>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if broker.inner().is_closed() {
                return;
            }
            let forgotten = broker.inner().forget_disconnected_workers(Instant::now());
            if forgotten > 0 {
                debug!(forgotten, "removed workers past the forget delay");
            }
        }
    })
}
