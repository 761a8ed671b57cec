use std::collections::{BTreeSet, HashMap};

use crate::core::{Target, TargetIdGenerator};
use crate::error::{internal_error, FirestoreResult};
use crate::local::reference_set::ReferenceSet;
use crate::local::target_data::TargetData;
use crate::model::{DocumentKey, ListenSequenceNumber, SnapshotVersion, TargetId};

/// Cached targets and the documents the server reported for each of them.
pub trait TargetCache: Send + Sync {
    fn get_target_data(&self, target: &Target) -> Option<TargetData>;

    fn all_target_data(&self) -> Vec<TargetData>;

    fn add_target_data(&mut self, target_data: TargetData) -> FirestoreResult<()>;

    fn update_target_data(&mut self, target_data: TargetData) -> FirestoreResult<()>;

    /// Drops the target and every key associated with it.
    fn remove_target_data(&mut self, target_data: &TargetData);

    fn highest_target_id(&self) -> TargetId;

    fn highest_listen_sequence_number(&self) -> ListenSequenceNumber;

    fn last_remote_snapshot_version(&self) -> SnapshotVersion;

    fn set_targets_metadata(
        &mut self,
        highest_listen_sequence_number: ListenSequenceNumber,
        last_remote_snapshot_version: Option<SnapshotVersion>,
    );

    fn target_count(&self) -> usize;

    /// Reserves a fresh target id above every id handed out so far.
    fn allocate_target_id(&mut self) -> TargetId;

    fn add_matching_keys(&mut self, keys: &BTreeSet<DocumentKey>, target_id: TargetId);

    fn remove_matching_keys(&mut self, keys: &BTreeSet<DocumentKey>, target_id: TargetId);

    fn remove_matching_keys_for_target_id(&mut self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    fn get_matching_keys_for_target_id(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    fn contains_key(&self, key: &DocumentKey) -> bool;
}

#[derive(Clone, Debug)]
pub struct MemoryTargetCache {
    targets: HashMap<String, TargetData>,
    references: ReferenceSet,
    target_id_generator: TargetIdGenerator,
    highest_target_id: TargetId,
    highest_sequence_number: ListenSequenceNumber,
    last_remote_snapshot_version: SnapshotVersion,
}

impl Default for MemoryTargetCache {
    fn default() -> Self {
        Self {
            targets: HashMap::new(),
            references: ReferenceSet::new(),
            target_id_generator: TargetIdGenerator::for_target_cache(),
            highest_target_id: 0,
            highest_sequence_number: 0,
            last_remote_snapshot_version: SnapshotVersion::min(),
        }
    }
}

impl MemoryTargetCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn save_target_data(&mut self, target_data: TargetData) {
        if target_data.target_id > self.highest_target_id {
            self.target_id_generator = TargetIdGenerator::seeded(target_data.target_id);
            self.highest_target_id = target_data.target_id;
        }
        if target_data.sequence_number > self.highest_sequence_number {
            self.highest_sequence_number = target_data.sequence_number;
        }
        self.targets
            .insert(target_data.target.canonical_id().to_string(), target_data);
    }
}

impl TargetCache for MemoryTargetCache {
    fn get_target_data(&self, target: &Target) -> Option<TargetData> {
        self.targets.get(target.canonical_id()).cloned()
    }

    fn all_target_data(&self) -> Vec<TargetData> {
        let mut all: Vec<TargetData> = self.targets.values().cloned().collect();
        all.sort_by_key(|data| data.target_id);
        all
    }

    fn add_target_data(&mut self, target_data: TargetData) -> FirestoreResult<()> {
        if self.targets.contains_key(target_data.target.canonical_id()) {
            return Err(internal_error(format!(
                "Adding a target that already exists (target id {})",
                target_data.target_id
            )));
        }
        self.save_target_data(target_data);
        Ok(())
    }

    fn update_target_data(&mut self, target_data: TargetData) -> FirestoreResult<()> {
        if !self.targets.contains_key(target_data.target.canonical_id()) {
            return Err(internal_error(format!(
                "Updating a nonexistent target (target id {})",
                target_data.target_id
            )));
        }
        self.save_target_data(target_data);
        Ok(())
    }

    fn remove_target_data(&mut self, target_data: &TargetData) {
        self.targets.remove(target_data.target.canonical_id());
        self.references.remove_references_for_id(target_data.target_id);
    }

    fn highest_target_id(&self) -> TargetId {
        self.highest_target_id
    }

    fn highest_listen_sequence_number(&self) -> ListenSequenceNumber {
        self.highest_sequence_number
    }

    fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.last_remote_snapshot_version
    }

    fn set_targets_metadata(
        &mut self,
        highest_listen_sequence_number: ListenSequenceNumber,
        last_remote_snapshot_version: Option<SnapshotVersion>,
    ) {
        if let Some(version) = last_remote_snapshot_version {
            self.last_remote_snapshot_version = version;
        }
        if highest_listen_sequence_number > self.highest_sequence_number {
            self.highest_sequence_number = highest_listen_sequence_number;
        }
    }

    fn target_count(&self) -> usize {
        self.targets.len()
    }

    fn allocate_target_id(&mut self) -> TargetId {
        let target_id = self.target_id_generator.next_id();
        self.highest_target_id = self.highest_target_id.max(target_id);
        target_id
    }

    fn add_matching_keys(&mut self, keys: &BTreeSet<DocumentKey>, target_id: TargetId) {
        self.references.add_references(keys, target_id);
    }

    fn remove_matching_keys(&mut self, keys: &BTreeSet<DocumentKey>, target_id: TargetId) {
        self.references.remove_references(keys, target_id);
    }

    fn remove_matching_keys_for_target_id(&mut self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.references.remove_references_for_id(target_id)
    }

    fn get_matching_keys_for_target_id(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.references.references_for_id(target_id)
    }

    fn contains_key(&self, key: &DocumentKey) -> bool {
        self.references.contains_key(key)
    }
}
