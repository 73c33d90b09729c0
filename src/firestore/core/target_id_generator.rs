use crate::firestore::core::TargetId;

/// Hands out target ids from disjoint spaces: even ids for query targets
/// allocated by the local store, odd ids for limbo resolution targets.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    last_id: TargetId,
}

impl TargetIdGenerator {
    /// Continues after the highest id persisted in the target cache.
    pub fn for_target_cache(highest_target_id: TargetId) -> Self {
        Self {
            last_id: highest_target_id - highest_target_id.rem_euclid(2),
        }
    }

    pub fn for_sync_engine() -> Self {
        Self { last_id: -1 }
    }

    pub fn next(&mut self) -> TargetId {
        self.last_id += 2;
        self.last_id
    }
}
