use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::api::{InvalidTenantId, TenantId, WorkerId, WorkerShuttingDown};
use crate::shard::sample_worker_subset;
use crate::tenants::TenantRegistry;
use crate::workers::WorkerRegistry;

/// The tenant↔worker relationship: which workers exist, which tenants exist
/// and in what rotation order, and which subset of workers each tenant may
/// use. The three move together; every mutation here leaves them consistent.
///
/// A tenant absent from `shards` may use every registered worker. That covers
/// both tenants with sharding disabled and tenants whose `max_workers` covers
/// the whole roster.
pub(crate) struct TenantWorkerAssignments {
    pub(crate) workers: WorkerRegistry,
    pub(crate) tenants: TenantRegistry,
    shards: HashMap<TenantId, HashSet<WorkerId>>,
}

impl TenantWorkerAssignments {
    pub(crate) fn new(forget_delay: Duration) -> Self {
        Self {
            workers: WorkerRegistry::new(forget_delay),
            tenants: TenantRegistry::new(),
            shards: HashMap::new(),
        }
    }

    /// Ensures the tenant exists with the given `max_workers`, recomputing
    /// its shard when the value changed. Rejects the reserved empty id
    /// without touching any state.
    pub(crate) fn create_or_update_tenant(
        &mut self,
        tenant_id: &TenantId,
        max_workers: usize,
    ) -> Result<(), InvalidTenantId> {
        if tenant_id.as_str().is_empty() {
            return Err(InvalidTenantId);
        }

        if self.tenants.create_or_update(tenant_id, max_workers) {
            self.shuffle_tenant_workers(tenant_id, &mut Vec::new());
        }
        Ok(())
    }

    pub(crate) fn remove_tenant(&mut self, tenant_id: &TenantId) {
        if self.tenants.remove(tenant_id).is_some() {
            self.shards.remove(tenant_id);
        }
    }

    /// Walks the rotation order starting just after `last_tenant_index` and
    /// returns the first live tenant this worker is eligible for, along with
    /// its position. `None` means nothing is queued for this worker.
    ///
    /// A stale out-of-range index wraps to 0 explicitly rather than by
    /// modulo: the order may have shrunk since the worker's last call, and a
    /// modulo wrap from a stale index would skip tenants at the head.
    pub(crate) fn next_tenant_for_worker(
        &self,
        last_tenant_index: isize,
        worker_id: &WorkerId,
    ) -> Result<Option<(TenantId, isize)>, WorkerShuttingDown> {
        if !self.workers.is_active(worker_id) {
            return Err(WorkerShuttingDown);
        }

        let rotation = self.tenants.rotation();
        let mut index = last_tenant_index;
        for _ in 0..rotation.len() {
            index += 1;
            if index as usize >= rotation.len() {
                index = 0;
            }

            let Some(tenant_id) = &rotation[index as usize] else {
                continue;
            };
            if self.tenants.get(tenant_id).is_none() {
                panic!("rotation order references unknown tenant {tenant_id}");
            }

            match self.shards.get(tenant_id) {
                // No shard restriction: any worker may serve this tenant.
                None => return Ok(Some((tenant_id.clone(), index))),
                Some(subset) if subset.contains(worker_id) => {
                    return Ok(Some((tenant_id.clone(), index)));
                }
                Some(_) => {}
            }
        }

        Ok(None)
    }

    pub(crate) fn add_worker_connection(&mut self, worker_id: &WorkerId) {
        if self.workers.add_connection(worker_id) {
            self.recompute_all_assignments();
        }
    }

    pub(crate) fn remove_worker_connection(&mut self, worker_id: &WorkerId, now: Instant) {
        if self.workers.remove_connection(worker_id, now) {
            self.recompute_all_assignments();
        }
    }

    pub(crate) fn notify_worker_shutdown(&mut self, worker_id: &WorkerId) {
        if self.workers.notify_shutdown(worker_id) {
            self.recompute_all_assignments();
        }
    }

    /// Sweeps workers whose forget delay has lapsed. One recomputation covers
    /// the whole batch.
    pub(crate) fn forget_disconnected_workers(&mut self, now: Instant) -> usize {
        let forgotten = self.workers.forget_disconnected(now);
        if !forgotten.is_empty() {
            self.recompute_all_assignments();
        }
        forgotten.len()
    }

    /// Recomputes every tenant's shard against the current roster. The
    /// scratch buffer is shared across tenants and only ever allocates when
    /// some tenant actually needs sampling.
    fn recompute_all_assignments(&mut self) {
        let mut scratch: Vec<WorkerId> = Vec::new();
        let tenant_ids: Vec<TenantId> = self.tenants.ids().cloned().collect();
        for tenant_id in &tenant_ids {
            self.shuffle_tenant_workers(tenant_id, &mut scratch);
        }
    }

    fn shuffle_tenant_workers(&mut self, tenant_id: &TenantId, scratch: &mut Vec<WorkerId>) {
        let Some(tenant) = self.tenants.get(tenant_id) else {
            return;
        };

        let sorted = self.workers.sorted_ids();
        if tenant.max_workers == 0 || sorted.len() <= tenant.max_workers {
            // Sharding disabled, or the cap already covers the roster.
            self.shards.remove(tenant_id);
            return;
        }

        let subset =
            sample_worker_subset(tenant.shuffle_shard_seed, tenant.max_workers, sorted, scratch);
        self.shards.insert(tenant_id.clone(), subset);
    }

    #[cfg(test)]
    pub(crate) fn shard(&self, tenant_id: &TenantId) -> Option<&HashSet<WorkerId>> {
        self.shards.get(tenant_id)
    }

    /// Checks the cross-structure invariants that must hold between public
    /// operations. Test-only; a violation is a bug in this module.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let rotation = self.tenants.rotation();

        // No trailing tombstones.
        assert!(
            !matches!(rotation.last(), Some(None)),
            "rotation order ends in a tombstone"
        );

        // Live rotation entries and the tenant map mirror each other, and
        // every tenant points back at its own slot.
        let mut live = 0;
        for (ix, slot) in rotation.iter().enumerate() {
            let Some(tenant_id) = slot else { continue };
            live += 1;
            let tenant = self
                .tenants
                .get(tenant_id)
                .unwrap_or_else(|| panic!("rotation entry {tenant_id} missing from registry"));
            assert_eq!(tenant.order_index, ix, "order index mismatch for {tenant_id}");
            assert_eq!(&tenant.tenant_id, tenant_id);
        }
        assert_eq!(live, self.tenants.len(), "tenant map and rotation diverge");

        // Sorted ids strictly ascending and matching the registry.
        let sorted = self.workers.sorted_ids();
        assert!(
            sorted.windows(2).all(|pair| pair[0] < pair[1]),
            "worker ids not strictly ascending"
        );
        assert_eq!(sorted.len(), self.workers.len());

        // Shard sets are non-empty, capped, and contained in the roster.
        for (tenant_id, subset) in &self.shards {
            let tenant = self
                .tenants
                .get(tenant_id)
                .unwrap_or_else(|| panic!("shard for unknown tenant {tenant_id}"));
            assert!(!subset.is_empty());
            assert_eq!(subset.len(), tenant.max_workers.min(sorted.len()));
            for worker_id in subset {
                assert!(
                    sorted.binary_search(worker_id).is_ok(),
                    "shard member {worker_id} not on the roster"
                );
            }
        }
    }
}
