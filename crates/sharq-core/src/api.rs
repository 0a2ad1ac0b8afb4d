use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Identifies a tenant: the unit of isolation and fairness.
///
/// Any non-empty string is a valid tenant id. The empty id is rejected by
/// every broker entry point that accepts one.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantId(Arc<str>);

impl TenantId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl From<String> for TenantId {
    fn from(value: String) -> Self {
        Self(Arc::from(value.as_str()))
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a worker connection endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(Arc<str>);

impl WorkerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl From<String> for WorkerId {
    fn from(value: String) -> Self {
        Self(Arc::from(value.as_str()))
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Cap on each tenant's FIFO. Back-enqueues beyond this are rejected.
    pub max_tenant_queue_size: usize,
    /// Grace window during which a worker that dropped all connections
    /// without announcing shutdown still counts for shard computation.
    /// Zero removes such workers immediately.
    pub forget_delay: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_tenant_queue_size: 100,
            forget_delay: Duration::ZERO,
        }
    }
}

/// A tenant's FIFO is at its configured cap.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
#[error("max queue length exceeded")]
pub struct MaxQueueLengthExceeded;

/// The reserved empty tenant id was supplied.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
#[error("invalid tenant id")]
pub struct InvalidTenantId;

#[derive(Debug, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("invalid tenant id")]
    InvalidTenantId,
    /// User-facing rejection; the queue-cap cause is attached as the source.
    #[error("too many outstanding requests")]
    TooManyRequests(#[source] MaxQueueLengthExceeded),
    #[error("broker is closed")]
    Closed,
}

impl From<InvalidTenantId> for EnqueueError {
    fn from(_: InvalidTenantId) -> Self {
        EnqueueError::InvalidTenantId
    }
}

/// The worker is unknown to the broker or has announced a graceful shutdown.
///
/// The caller's rotation index is not advanced; retrying with the same index
/// after reconnecting behaves correctly.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
#[error("worker is shutting down")]
pub struct WorkerShuttingDown;

/// A request handed to a worker, together with the rotation position it was
/// found at. The worker passes `tenant_index` as `last_tenant_index` on its
/// next dequeue call to resume the rotation where it left off.
#[derive(Clone, Debug)]
pub struct DequeuedRequest<T> {
    pub payload: T,
    pub tenant: TenantId,
    pub tenant_index: isize,
}

#[derive(Clone, Debug)]
pub enum DequeueResult<T> {
    Request(DequeuedRequest<T>),
    /// Nothing for this worker right now. `last_tenant_index` is the position
    /// to resume from on the next call.
    Empty { last_tenant_index: isize },
    Closed,
}

/// Point-in-time counters. Queue length and the tenant/worker gauges reflect
/// current state; the rest are monotonic totals.
#[derive(Clone, Debug, Default)]
pub struct BrokerStats {
    pub enqueued: u64,
    pub requeued: u64,
    pub dequeued: u64,
    pub rejected: u64,
    pub forgotten_workers: u64,
    pub queue_len: u64,
    pub tenants: u64,
    pub workers: u64,
}
