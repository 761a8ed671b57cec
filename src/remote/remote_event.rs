use std::collections::{BTreeMap, BTreeSet};

use crate::local::TargetPurpose;
use crate::model::{Document, DocumentKey, SnapshotVersion, TargetId};

/// Everything the watch stream reported up to a consistent snapshot.
#[derive(Clone, Debug, Default)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose cached results were discarded and must be re-queried.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    pub document_updates: BTreeMap<DocumentKey, Document>,
    /// Updated documents that only belong to limbo resolution targets.
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    /// Event telling `target_id` it has caught up without changing any documents.
    pub fn synthesize_current_change(snapshot_version: SnapshotVersion, target_id: TargetId, current: bool) -> Self {
        let mut target_changes = BTreeMap::new();
        target_changes.insert(target_id, TargetChange::create_synthesized(current));
        Self {
            snapshot_version,
            target_changes,
            ..Self::default()
        }
    }
}

/// Per-target delta carried by a [`RemoteEvent`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TargetChange {
    pub resume_token: Vec<u8>,
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    pub fn create_synthesized(current: bool) -> Self {
        Self {
            current,
            ..Self::default()
        }
    }

    pub fn has_document_changes(&self) -> bool {
        !(self.added_documents.is_empty() && self.modified_documents.is_empty() && self.removed_documents.is_empty())
    }
}
