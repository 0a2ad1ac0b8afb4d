use std::collections::HashSet;

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};

use crate::api::WorkerId;

/// Deterministic shard seed for a tenant.
///
/// A pure function of the tenant id (SHA-256, first 8 little-endian digest
/// bytes), so every broker instance derives the same seed without
/// coordination. The second argument qualifies a sub-shard; the request
/// queue always passes `""`.
pub(crate) fn shuffle_shard_seed(tenant_id: &str, extra: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(extra.as_bytes());
    let digest = hasher.finalize();

    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(seed)
}

/// Selects `count` distinct workers from `sorted` by an inside-out draw:
/// pick a random index, record it, swap it past `last`, shrink the range.
/// ChaCha8 guarantees the same byte stream for the same seed on every
/// platform, so two brokers holding the same sorted roster agree on the
/// subset.
///
/// Callers must ensure `0 < count < sorted.len()`; the unrestricted cases are
/// decided before sampling. `scratch` is cleared and refilled here so one
/// buffer can serve a whole recomputation pass.
pub(crate) fn sample_worker_subset(
    seed: u64,
    count: usize,
    sorted: &[WorkerId],
    scratch: &mut Vec<WorkerId>,
) -> HashSet<WorkerId> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    scratch.clear();
    scratch.extend_from_slice(sorted);

    let mut subset = HashSet::with_capacity(count);
    let mut last = scratch.len() - 1;
    for _ in 0..count {
        let r = rng.random_range(0..=last);
        subset.insert(scratch[r].clone());
        scratch.swap(r, last);
        last = last.saturating_sub(1);
    }
    subset
}
