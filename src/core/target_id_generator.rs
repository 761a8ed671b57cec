use crate::model::TargetId;

/// Hands out target ids from disjoint sequences: even ids for query targets
/// stored in the target cache, odd ids for limbo resolution targets owned by
/// the sync engine.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    last_id: TargetId,
}

impl TargetIdGenerator {
    pub fn for_target_cache() -> Self {
        Self { last_id: 0 }
    }

    pub fn for_sync_engine() -> Self {
        Self { last_id: -1 }
    }

    /// Resumes after `highest` (which must belong to this generator's sequence).
    pub fn seeded(highest: TargetId) -> Self {
        Self { last_id: highest }
    }

    pub fn next_id(&mut self) -> TargetId {
        self.last_id += 2;
        self.last_id
    }
}
