use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crate::api::TenantId;
use crate::shard::shuffle_shard_seed;

#[derive(Debug)]
pub(crate) struct Tenant {
    pub(crate) tenant_id: TenantId,
    /// 0 disables sharding for this tenant: every worker is eligible.
    pub(crate) max_workers: usize,
    /// Derived from the tenant id only, so independent broker instances that
    /// agree on the worker roster compute the same shard.
    pub(crate) shuffle_shard_seed: u64,
    /// Position in the rotation order, for O(1) tombstoning on removal.
    pub(crate) order_index: usize,
}

/// Known tenants plus the global rotation order that dequeues walk.
///
/// Removal leaves a `None` tombstone in place of the tenant's slot instead of
/// compacting: workers hold their rotation index across calls, and shifting
/// live entries under them would skip tenants. Tombstones are reclaimed by
/// later inserts and trimmed from the tail on removal.
pub(crate) struct TenantRegistry {
    tenants: HashMap<TenantId, Tenant>,
    rotation: Vec<Option<TenantId>>,
}

impl TenantRegistry {
    pub(crate) fn new() -> Self {
        Self {
            tenants: HashMap::new(),
            rotation: Vec::new(),
        }
    }

    pub(crate) fn get(&self, tenant_id: &TenantId) -> Option<&Tenant> {
        self.tenants.get(tenant_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.tenants.len()
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = &TenantId> {
        self.tenants.keys()
    }

    pub(crate) fn rotation(&self) -> &[Option<TenantId>] {
        &self.rotation
    }

    /// Inserts the tenant if unknown and applies `max_workers`. Returns true
    /// when the stored value changed, i.e. the tenant's shard must be
    /// recomputed.
    pub(crate) fn create_or_update(&mut self, tenant_id: &TenantId, max_workers: usize) -> bool {
        let tenant = match self.tenants.entry(tenant_id.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let order_index = claim_rotation_slot(&mut self.rotation, tenant_id);
                entry.insert(Tenant {
                    tenant_id: tenant_id.clone(),
                    // Zero so the comparison below computes the initial shard
                    // for new tenants that arrive with sharding enabled.
                    max_workers: 0,
                    shuffle_shard_seed: shuffle_shard_seed(tenant_id.as_str(), ""),
                    order_index,
                })
            }
        };

        if tenant.max_workers == max_workers {
            return false;
        }
        tenant.max_workers = max_workers;
        true
    }

    /// Tombstones the tenant's rotation slot and drops the entry. Trailing
    /// tombstones are truncated; interior ones stay until reused.
    pub(crate) fn remove(&mut self, tenant_id: &TenantId) -> Option<Tenant> {
        let tenant = self.tenants.remove(tenant_id)?;
        self.rotation[tenant.order_index] = None;
        while matches!(self.rotation.last(), Some(None)) {
            self.rotation.pop();
        }
        Some(tenant)
    }
}

/// Takes the lowest-indexed tombstone, or appends when there is none.
fn claim_rotation_slot(rotation: &mut Vec<Option<TenantId>>, tenant_id: &TenantId) -> usize {
    for (ix, slot) in rotation.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(tenant_id.clone());
            return ix;
        }
    }
    rotation.push(Some(tenant_id.clone()));
    rotation.len() - 1
}
