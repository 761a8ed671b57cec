use std::collections::{BTreeMap, BTreeSet};

use crate::local::{TargetData, TargetPurpose};
use crate::model::{DatabaseId, Document, DocumentKey, SnapshotVersion, TargetId};
use crate::remote::bloom_filter::BloomFilter;
use crate::remote::remote_event::{RemoteEvent, TargetChange};
use crate::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, WatchTargetChange, WatchTargetChangeState,
};

/// What the aggregator needs to know about targets it does not own.
pub trait TargetMetadataProvider {
    /// Keys the local store currently associates with the target.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// Target data for an active target, `None` once it was unlistened.
    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChangeType {
    Added,
    Modified,
    Removed,
}

/// Outcome of applying a bloom filter after an existence filter mismatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BloomFilterApplicationStatus {
    Success,
    /// No usable filter was sent.
    Skipped,
    /// The filter was applied but counts still disagree.
    FalsePositive,
}

#[derive(Debug)]
struct TargetState {
    /// Outstanding watch/unwatch requests. While non-zero the target ignores changes.
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: Vec<u8>,
    current: bool,
    has_pending_changes: bool,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            // Newly added targets always produce a first change.
            has_pending_changes: true,
        }
    }
}

impl TargetState {
    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: &[u8]) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, change_type) in &self.document_changes {
            match change_type {
                ChangeType::Added => change.added_documents.insert(key.clone()),
                ChangeType::Modified => change.modified_documents.insert(key.clone()),
                ChangeType::Removed => change.removed_documents.insert(key.clone()),
            };
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses = (self.pending_responses - 1).max(0);
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Accumulates watch changes between consistent snapshots and turns them
/// into [`RemoteEvent`]s.
///
/// Target metadata is passed into each call rather than stored, so the
/// caller decides which locks are held while it is consulted.
#[derive(Debug)]
pub struct WatchChangeAggregator {
    database_id: DatabaseId,
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, Document>,
    /// Targets whose membership of a key changed, used to find limbo-only updates.
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            database_id,
            target_states: BTreeMap::new(),
            pending_document_updates: BTreeMap::new(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeMap::new(),
        }
    }

    pub fn handle_document_change(&mut self, provider: &dyn TargetMetadataProvider, change: DocumentWatchChange) {
        for target_id in &change.updated_target_ids {
            match &change.new_doc {
                Some(document) if document.is_found_document() => {
                    self.add_document_to_target(provider, *target_id, document.clone());
                }
                other => self.remove_document_from_target(provider, *target_id, &change.key, other.clone()),
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(provider, *target_id, &change.key, change.new_doc.clone());
        }
    }

    pub fn handle_target_change(&mut self, provider: &dyn TargetMetadataProvider, change: &WatchTargetChange) {
        for target_id in self.affected_targets(provider, change) {
            match change.state {
                WatchTargetChangeState::NoChange => {
                    if self.is_active_target(provider, target_id) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Add => {
                    // Acknowledges a watch request; only the last one clears changes.
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                WatchTargetChangeState::Remove => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                }
                WatchTargetChangeState::Current => {
                    if self.is_active_target(provider, target_id) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Reset => {
                    if self.is_active_target(provider, target_id) {
                        // Everything the server sent so far is invalid.
                        self.reset_target(provider, target_id);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    fn affected_targets(&self, provider: &dyn TargetMetadataProvider, change: &WatchTargetChange) -> Vec<TargetId> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        self.target_states
            .keys()
            .copied()
            .filter(|target_id| self.is_active_target(provider, *target_id))
            .collect()
    }

    /// Compares the server's document count with the local one and, on a
    /// mismatch, uses the bloom filter to find the documents that were
    /// deleted while the client was not listening.
    pub fn handle_existence_filter(&mut self, provider: &dyn TargetMetadataProvider, change: &ExistenceFilterChange) {
        let target_id = change.target_id;
        let expected_count = change.count;
        let Some(target_data) = self.target_data_for_active_target(provider, target_id) else {
            return;
        };

        if target_data.target.is_document_target() {
            if expected_count == 0 {
                // The single document is gone; synthesize a delete.
                let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) else {
                    return;
                };
                let deleted = Document::new_no_document(key.clone(), SnapshotVersion::min());
                self.remove_document_from_target(provider, target_id, &key, Some(deleted));
            } else if expected_count != 1 {
                log::warn!("Single document existence filter with count {expected_count} for target {target_id}");
            }
            return;
        }

        let current_count = self.current_document_count_for_target(provider, target_id);
        if current_count == expected_count as i64 {
            return;
        }
        let status = self.apply_bloom_filter(provider, change, current_count);
        log::debug!(
            "Existence filter mismatch for target {target_id}: expected {expected_count}, had {current_count}, bloom filter {status:?}"
        );
        if status != BloomFilterApplicationStatus::Success {
            self.reset_target(provider, target_id);
            let purpose = if status == BloomFilterApplicationStatus::FalsePositive {
                TargetPurpose::ExistenceFilterMismatchBloom
            } else {
                TargetPurpose::ExistenceFilterMismatch
            };
            self.pending_target_resets.insert(target_id, purpose);
        }
    }

    fn apply_bloom_filter(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        change: &ExistenceFilterChange,
        current_count: i64,
    ) -> BloomFilterApplicationStatus {
        let Some(params) = &change.unchanged_names else {
            return BloomFilterApplicationStatus::Skipped;
        };
        let bloom_filter = match BloomFilter::new(params.bitmap.clone(), params.padding, params.hash_count) {
            Ok(filter) => filter,
            Err(err) => {
                log::warn!("Applying bloom filter failed: {err}");
                return BloomFilterApplicationStatus::Skipped;
            }
        };
        if bloom_filter.is_empty() {
            return BloomFilterApplicationStatus::Skipped;
        }

        let removed = self.filter_removed_documents(provider, &bloom_filter, change.target_id);
        if change.count as i64 != current_count - removed {
            return BloomFilterApplicationStatus::FalsePositive;
        }
        BloomFilterApplicationStatus::Success
    }

    /// Removes every known key the filter proves absent; returns how many.
    fn filter_removed_documents(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        bloom_filter: &BloomFilter,
        target_id: TargetId,
    ) -> i64 {
        let mut removed = 0;
        for key in provider.get_remote_keys_for_target(target_id) {
            let name = self.database_id.document_name(&key);
            if !bloom_filter.might_contain(&name) {
                self.remove_document_from_target(provider, target_id, &key, None);
                removed += 1;
            }
        }
        removed
    }

    /// Builds the event for everything accumulated so far and resets the
    /// pending document state.
    pub fn create_remote_event(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        snapshot_version: SnapshotVersion,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();

        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(provider, target_id) else {
                continue;
            };
            let is_current = self
                .target_states
                .get(&target_id)
                .is_some_and(|state| state.current);
            if is_current && target_data.target.is_document_target() {
                // A current document target that never saw its document means
                // the document does not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    let updated_for_target = self
                        .pending_document_target_mapping
                        .get(&key)
                        .is_some_and(|targets| targets.contains(&target_id))
                        && self.pending_document_updates.contains_key(&key);
                    if !updated_for_target && !target_contains_document(provider, target_id, &key) {
                        let deleted = Document::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(provider, target_id, &key, Some(deleted));
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = BTreeSet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo_targets = targets.iter().all(|target_id| {
                match self.target_data_for_active_target(provider, *target_id) {
                    Some(data) => data.purpose == TargetPurpose::LimboResolution,
                    None => true,
                }
            });
            if only_limbo_targets {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    /// Records that a watch or unwatch request for `target_id` was sent.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id).record_pending_target_request();
    }

    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    fn add_document_to_target(&mut self, provider: &dyn TargetMetadataProvider, target_id: TargetId, document: Document) {
        if !self.is_active_target(provider, target_id) {
            return;
        }
        let key = document.key().clone();
        let change_type = if target_contains_document(provider, target_id, &key) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.pending_document_updates.insert(key, document);
    }

    /// `updated_document` is `None` when the document merely left the target.
    fn remove_document_from_target(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        target_id: TargetId,
        key: &DocumentKey,
        updated_document: Option<Document>,
    ) {
        if !self.is_active_target(provider, target_id) {
            return;
        }
        let contained = target_contains_document(provider, target_id, key);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // Added and removed within one snapshot.
            state.remove_document_change(key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key.clone(), document);
        }
    }

    fn current_document_count_for_target(&mut self, provider: &dyn TargetMetadataProvider, target_id: TargetId) -> i64 {
        let change = self.ensure_target_state(target_id).to_target_change();
        provider.get_remote_keys_for_target(target_id).len() as i64 + change.added_documents.len() as i64
            - change.removed_documents.len() as i64
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states.entry(target_id).or_default()
    }

    fn is_active_target(&self, provider: &dyn TargetMetadataProvider, target_id: TargetId) -> bool {
        let active = self.target_data_for_active_target(provider, target_id).is_some();
        if !active {
            log::debug!("Detected inactive target {target_id}");
        }
        active
    }

    fn target_data_for_active_target(
        &self,
        provider: &dyn TargetMetadataProvider,
        target_id: TargetId,
    ) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => provider.get_target_data_for_target(target_id),
        }
    }

    /// Drops all known documents and changes of a target.
    fn reset_target(&mut self, provider: &dyn TargetMetadataProvider, target_id: TargetId) {
        self.target_states.insert(target_id, TargetState::default());
        for key in provider.get_remote_keys_for_target(target_id) {
            self.remove_document_from_target(provider, target_id, &key, None);
        }
    }
}

fn target_contains_document(provider: &dyn TargetMetadataProvider, target_id: TargetId, key: &DocumentKey) -> bool {
    provider.get_remote_keys_for_target(target_id).contains(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Query;
    use crate::remote::watch_change::BloomFilterParams;
    use crate::test_support::{doc, key, map, query, version};

    #[derive(Default)]
    struct Metadata {
        targets: BTreeMap<TargetId, TargetData>,
        remote_keys: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
    }

    impl Metadata {
        fn with_query_target(mut self, target_id: TargetId, keys: &[&str]) -> Self {
            self.targets.insert(
                target_id,
                TargetData::new(query("rooms").to_target(), target_id, TargetPurpose::Listen, 1),
            );
            self.remote_keys
                .insert(target_id, keys.iter().map(|path| key(path)).collect());
            self
        }

        fn with_target(mut self, data: TargetData) -> Self {
            self.targets.insert(data.target_id, data);
            self
        }
    }

    impl TargetMetadataProvider for Metadata {
        fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
            self.remote_keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
            self.targets.get(&target_id).cloned()
        }
    }

    fn aggregator() -> WatchChangeAggregator {
        WatchChangeAggregator::new(DatabaseId::new("test-project", "(default)"))
    }

    fn target_change(state: WatchTargetChangeState, ids: &[TargetId], token: &[u8]) -> WatchTargetChange {
        WatchTargetChange {
            state,
            target_ids: ids.to_vec(),
            resume_token: token.to_vec(),
            read_time: SnapshotVersion::min(),
            cause: None,
        }
    }

    fn updated(path: &str, targets: &[TargetId]) -> DocumentWatchChange {
        DocumentWatchChange {
            updated_target_ids: targets.to_vec(),
            removed_target_ids: Vec::new(),
            key: key(path),
            new_doc: Some(doc(path, 2, map(&[]))),
        }
    }

    fn filter(target_id: TargetId, count: i32, bloom: Option<BloomFilterParams>) -> ExistenceFilterChange {
        ExistenceFilterChange {
            target_id,
            count,
            unchanged_names: bloom,
        }
    }

    fn bloom_containing(database_id: &DatabaseId, paths: &[&str]) -> BloomFilterParams {
        let mut bloom = BloomFilter::with_bit_count(200, 5);
        for path in paths {
            bloom.insert(&database_id.document_name(&key(path)));
        }
        BloomFilterParams {
            bitmap: bloom.bitmap().to_vec(),
            padding: bloom.padding() as i32,
            hash_count: 5,
        }
    }

    #[test]
    fn accumulates_added_and_modified_documents() {
        let metadata = Metadata::default().with_query_target(2, &["rooms/a"]);
        let mut aggregator = aggregator();
        aggregator.handle_document_change(&metadata, updated("rooms/a", &[2]));
        aggregator.handle_document_change(&metadata, updated("rooms/b", &[2]));
        aggregator.handle_target_change(&metadata, &target_change(WatchTargetChangeState::Current, &[2], b"t1"));

        let event = aggregator.create_remote_event(&metadata, version(3));
        let change = &event.target_changes[&2];
        assert!(change.current);
        assert_eq!(change.resume_token, b"t1".to_vec());
        assert_eq!(change.added_documents, BTreeSet::from([key("rooms/b")]));
        assert_eq!(change.modified_documents, BTreeSet::from([key("rooms/a")]));
        assert_eq!(event.document_updates.len(), 2);
        assert_eq!(event.document_updates[&key("rooms/b")].read_time(), version(3));
        assert!(event.resolved_limbo_documents.is_empty());
    }

    #[test]
    fn pending_targets_ignore_changes_until_acknowledged() {
        let metadata = Metadata::default().with_query_target(2, &[]);
        let mut aggregator = aggregator();
        aggregator.record_pending_target_request(2);
        aggregator.handle_document_change(&metadata, updated("rooms/a", &[2]));
        let event = aggregator.create_remote_event(&metadata, version(1));
        assert!(event.target_changes.is_empty());
        assert!(event.document_updates.is_empty());

        aggregator.handle_target_change(&metadata, &target_change(WatchTargetChangeState::Add, &[2], b""));
        aggregator.handle_document_change(&metadata, updated("rooms/a", &[2]));
        let event = aggregator.create_remote_event(&metadata, version(2));
        assert_eq!(event.target_changes[&2].added_documents.len(), 1);
    }

    #[test]
    fn document_added_and_removed_in_one_snapshot_cancels_out() {
        let metadata = Metadata::default().with_query_target(2, &[]);
        let mut aggregator = aggregator();
        aggregator.handle_document_change(&metadata, updated("rooms/a", &[2]));
        aggregator.handle_document_change(
            &metadata,
            DocumentWatchChange {
                updated_target_ids: Vec::new(),
                removed_target_ids: vec![2],
                key: key("rooms/a"),
                new_doc: None,
            },
        );
        let event = aggregator.create_remote_event(&metadata, version(2));
        let change = &event.target_changes[&2];
        assert!(change.added_documents.is_empty());
        assert!(change.removed_documents.is_empty());
    }

    #[test]
    fn reset_removes_known_documents() {
        let metadata = Metadata::default().with_query_target(2, &["rooms/a", "rooms/b"]);
        let mut aggregator = aggregator();
        aggregator.handle_target_change(&metadata, &target_change(WatchTargetChangeState::Reset, &[2], b""));
        aggregator.handle_document_change(&metadata, updated("rooms/a", &[2]));
        let event = aggregator.create_remote_event(&metadata, version(2));
        let change = &event.target_changes[&2];
        assert_eq!(change.removed_documents, BTreeSet::from([key("rooms/b")]));
        assert_eq!(change.modified_documents, BTreeSet::from([key("rooms/a")]));
    }

    #[test]
    fn global_target_change_applies_to_active_targets() {
        let metadata = Metadata::default().with_query_target(2, &[]).with_query_target(4, &[]);
        let mut aggregator = aggregator();
        aggregator.record_pending_target_request(4);
        aggregator.handle_target_change(&metadata, &target_change(WatchTargetChangeState::Add, &[2], b""));
        aggregator.handle_target_change(&metadata, &target_change(WatchTargetChangeState::NoChange, &[], b"global"));
        let event = aggregator.create_remote_event(&metadata, version(5));
        assert_eq!(event.target_changes[&2].resume_token, b"global".to_vec());
        assert!(!event.target_changes.contains_key(&4));
    }

    #[test]
    fn existence_filter_mismatch_without_bloom_filter_resets_target() {
        let metadata = Metadata::default().with_query_target(2, &["rooms/a", "rooms/b"]);
        let mut aggregator = aggregator();
        aggregator.handle_existence_filter(&metadata, &filter(2, 1, None));
        let event = aggregator.create_remote_event(&metadata, version(2));
        assert_eq!(event.target_mismatches.get(&2), Some(&TargetPurpose::ExistenceFilterMismatch));
        assert_eq!(event.target_changes[&2].removed_documents.len(), 2);
    }

    #[test]
    fn zero_count_filter_removes_the_only_cached_document() {
        let metadata = Metadata::default().with_query_target(2, &["rooms/a"]);
        let mut aggregator = aggregator();
        aggregator.handle_existence_filter(&metadata, &filter(2, 0, None));
        let event = aggregator.create_remote_event(&metadata, version(2));
        assert_eq!(
            event.target_changes[&2].removed_documents,
            BTreeSet::from([key("rooms/a")])
        );
    }

    #[test]
    fn bloom_filter_removes_deleted_documents() {
        let database_id = DatabaseId::new("test-project", "(default)");
        let metadata = Metadata::default().with_query_target(2, &["rooms/a", "rooms/b", "rooms/c"]);
        let mut aggregator = aggregator();
        let bloom = bloom_containing(&database_id, &["rooms/a", "rooms/c"]);
        aggregator.handle_existence_filter(&metadata, &filter(2, 2, Some(bloom)));

        let event = aggregator.create_remote_event(&metadata, version(2));
        assert!(event.target_mismatches.is_empty());
        assert_eq!(
            event.target_changes[&2].removed_documents,
            BTreeSet::from([key("rooms/b")])
        );
    }

    #[test]
    fn bloom_filter_false_positive_schedules_bloom_requery() {
        let metadata = Metadata::default().with_query_target(2, &["rooms/a", "rooms/b"]);
        let mut aggregator = aggregator();
        // Every bit set: nothing is proven absent, yet the server reports one document.
        let bloom = BloomFilterParams {
            bitmap: vec![0xff; 4],
            padding: 0,
            hash_count: 3,
        };
        aggregator.handle_existence_filter(&metadata, &filter(2, 1, Some(bloom)));
        let event = aggregator.create_remote_event(&metadata, version(2));
        assert_eq!(
            event.target_mismatches.get(&2),
            Some(&TargetPurpose::ExistenceFilterMismatchBloom)
        );
    }

    #[test]
    fn malformed_bloom_filter_is_skipped() {
        let metadata = Metadata::default().with_query_target(2, &["rooms/a", "rooms/b"]);
        let mut aggregator = aggregator();
        let bloom = BloomFilterParams {
            bitmap: vec![1],
            padding: 9,
            hash_count: 1,
        };
        aggregator.handle_existence_filter(&metadata, &filter(2, 1, Some(bloom)));
        let event = aggregator.create_remote_event(&metadata, version(2));
        assert_eq!(event.target_mismatches.get(&2), Some(&TargetPurpose::ExistenceFilterMismatch));
    }

    #[test]
    fn matching_count_leaves_target_alone() {
        let metadata = Metadata::default().with_query_target(2, &["rooms/a"]);
        let mut aggregator = aggregator();
        aggregator.handle_existence_filter(&metadata, &filter(2, 1, None));
        let event = aggregator.create_remote_event(&metadata, version(2));
        assert!(event.target_mismatches.is_empty());
    }

    #[test]
    fn document_target_with_zero_count_synthesizes_delete() {
        let data = TargetData::new(Query::document(&key("rooms/a")).to_target(), 3, TargetPurpose::Listen, 1);
        let mut metadata = Metadata::default().with_target(data);
        metadata.remote_keys.insert(3, BTreeSet::from([key("rooms/a")]));
        let mut aggregator = aggregator();
        aggregator.handle_existence_filter(&metadata, &filter(3, 0, None));
        let event = aggregator.create_remote_event(&metadata, version(4));
        assert!(event.document_updates[&key("rooms/a")].is_no_document());
        assert_eq!(
            event.target_changes[&3].removed_documents,
            BTreeSet::from([key("rooms/a")])
        );
    }

    #[test]
    fn current_limbo_target_without_document_resolves_to_delete() {
        let data = TargetData::new(
            Query::document(&key("rooms/x")).to_target(),
            5,
            TargetPurpose::LimboResolution,
            1,
        );
        let metadata = Metadata::default().with_target(data);
        let mut aggregator = aggregator();
        aggregator.handle_target_change(&metadata, &target_change(WatchTargetChangeState::Current, &[5], b"t"));
        let event = aggregator.create_remote_event(&metadata, version(6));
        let deleted = &event.document_updates[&key("rooms/x")];
        assert!(deleted.is_no_document());
        assert_eq!(deleted.version(), version(6));
        assert!(event.resolved_limbo_documents.contains(&key("rooms/x")));
    }

    #[test]
    fn documents_in_query_targets_are_not_limbo_resolutions() {
        let limbo = TargetData::new(
            Query::document(&key("rooms/a")).to_target(),
            5,
            TargetPurpose::LimboResolution,
            1,
        );
        let metadata = Metadata::default().with_query_target(2, &[]).with_target(limbo);
        let mut aggregator = aggregator();
        aggregator.handle_document_change(&metadata, updated("rooms/a", &[2, 5]));
        let event = aggregator.create_remote_event(&metadata, version(2));
        assert!(event.resolved_limbo_documents.is_empty());
    }

    #[test]
    fn removed_targets_stop_reporting() {
        let metadata = Metadata::default().with_query_target(2, &[]);
        let mut aggregator = aggregator();
        aggregator.record_pending_target_request(2);
        aggregator.handle_target_change(&metadata, &target_change(WatchTargetChangeState::Remove, &[2], b""));
        let event = aggregator.create_remote_event(&metadata, version(2));
        assert!(event.target_changes.is_empty());
    }
}
