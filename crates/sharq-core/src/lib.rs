mod api;
mod assignments;
mod broker;
pub mod prometheus;
mod shard;
mod state;
mod tenants;
mod tree;
mod workers;

pub use api::{
    BrokerConfig, BrokerStats, DequeueResult, DequeuedRequest, EnqueueError, InvalidTenantId,
    MaxQueueLengthExceeded, TenantId, WorkerId, WorkerShuttingDown,
};
pub use broker::Broker;

#[cfg(test)]
mod tests;
