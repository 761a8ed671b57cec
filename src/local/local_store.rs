use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use crate::core::{ChangeType, Query, Target, ViewSnapshot};
use crate::error::{internal_error, FirestoreResult};
use crate::local::index_manager::backfill_index;
use crate::local::local_documents_view::{self, DocumentMap};
use crate::local::persistence::{Persistence, PersistenceExt, PersistenceTransaction, TransactionMode};
use crate::local::query_engine::QueryEngine;
use crate::local::remote_document_cache::RemoteDocumentChangeBuffer;
use crate::local::target_data::{TargetData, TargetPurpose};
use crate::model::{
    BatchId, Document, DocumentKey, FieldIndex, Mutation, MutationBatch, MutationBatchResult, SnapshotVersion,
    TargetId, Timestamp, User, BATCHID_UNKNOWN,
};
use crate::remote::{RemoteEvent, TargetChange};
use crate::settings::IndexAutoCreationSettings;
use crate::util::lock;

/// Resume tokens older than this are persisted even without document changes.
const RESUME_TOKEN_MAX_AGE_MICROS: i64 = 5 * 60 * 1_000_000;

/// Outcome of [`LocalStore::local_write`].
#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    /// Local view of every document the batch touched.
    pub changes: DocumentMap,
}

/// Documents matching a query plus the keys the server last confirmed for
/// its target.
#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    pub documents: BTreeMap<DocumentKey, Document>,
    pub remote_keys: BTreeSet<DocumentKey>,
}

/// Documents added to or removed from a view, used to pin documents in use.
#[derive(Clone, Debug)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

impl LocalViewChanges {
    pub fn from_snapshot(target_id: TargetId, snapshot: &ViewSnapshot) -> Self {
        let mut added_keys = BTreeSet::new();
        let mut removed_keys = BTreeSet::new();
        for change in &snapshot.doc_changes {
            match change.change_type {
                ChangeType::Added => {
                    added_keys.insert(change.document.key().clone());
                }
                ChangeType::Removed => {
                    removed_keys.insert(change.document.key().clone());
                }
                ChangeType::Modified | ChangeType::Metadata => {}
            }
        }
        Self {
            target_id,
            from_cache: snapshot.from_cache,
            added_keys,
            removed_keys,
        }
    }
}

/// Outcome of [`LocalStore::handle_user_change`].
#[derive(Clone, Debug, Default)]
pub struct UserChangeResult {
    pub affected_documents: DocumentMap,
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
}

struct LocalStoreState {
    user: User,
    query_engine: QueryEngine,
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    target_id_by_target: HashMap<String, TargetId>,
}

/// Local half of the sync engine: applies local writes and remote events to
/// the caches and answers queries from them.
///
/// Each public operation runs in a single persistence transaction.
pub struct LocalStore {
    persistence: Arc<dyn Persistence>,
    state: Mutex<LocalStoreState>,
}

impl LocalStore {
    pub fn new(persistence: Arc<dyn Persistence>, user: User, index_auto_creation: IndexAutoCreationSettings) -> Self {
        Self {
            persistence,
            state: Mutex::new(LocalStoreState {
                user,
                query_engine: QueryEngine::new(index_auto_creation),
                target_data_by_target: BTreeMap::new(),
                target_id_by_target: HashMap::new(),
            }),
        }
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn user(&self) -> User {
        lock(&self.state).user.clone()
    }

    /// Queues `mutations` as a new batch and returns the resulting local view.
    pub fn local_write(&self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let user = self.user();
        let keys: BTreeSet<DocumentKey> = mutations.iter().map(|m| m.key().clone()).collect();
        let local_write_time = Timestamp::now();

        self.persistence
            .run_transaction("Locally write mutations", TransactionMode::ReadWrite, &user, |txn| {
                let remote_docs = txn.remote_document_cache().get_entries(&keys);
                let without_remote_version: BTreeSet<DocumentKey> = remote_docs
                    .iter()
                    .filter(|(_, doc)| !doc.is_valid_document())
                    .map(|(key, _)| key.clone())
                    .collect();
                let mut overlayed = local_documents_view::get_overlayed_documents(txn, remote_docs)?;

                let batch = txn
                    .mutation_queue_mut()?
                    .add_mutation_batch(local_write_time, mutations);
                let overlays = batch.apply_to_local_document_set(&mut overlayed, &without_remote_version);
                txn.document_overlay_cache_mut()?
                    .save_overlays(batch.batch_id, &overlays);

                Ok(LocalWriteResult {
                    batch_id: batch.batch_id,
                    changes: overlayed
                        .into_iter()
                        .map(|(key, overlayed)| (key, overlayed.document))
                        .collect(),
                })
            })
    }

    /// Applies a server acknowledgement: the head batch leaves the queue and
    /// its results land in the remote document cache.
    pub fn acknowledge_batch(&self, result: &MutationBatchResult) -> FirestoreResult<DocumentMap> {
        let user = self.user();
        self.persistence
            .run_transaction("Acknowledge batch", TransactionMode::ReadWritePrimary, &user, |txn| {
                let affected = result.batch.keys();
                txn.mutation_queue_mut()?
                    .acknowledge_batch(&result.batch, result.stream_token.clone())?;

                let mut buffer = RemoteDocumentChangeBuffer::new();
                apply_write_to_remote_document_cache(txn, result, &mut buffer)?;
                buffer.apply(txn)?;

                txn.document_overlay_cache_mut()?
                    .remove_overlays_for_batch_id(&affected, result.batch.batch_id);
                let with_transforms: BTreeSet<DocumentKey> = result
                    .batch
                    .mutations
                    .iter()
                    .zip(&result.mutation_results)
                    .filter(|(_, mutation_result)| !mutation_result.transform_results.is_empty())
                    .map(|(mutation, _)| mutation.key().clone())
                    .collect();
                local_documents_view::recalculate_and_save_overlays_for_document_keys(txn, &with_transforms)?;
                local_documents_view::get_documents(txn, &affected)
            })
    }

    /// Removes a batch the server rejected and rolls back its overlays.
    pub fn reject_batch(&self, batch_id: BatchId) -> FirestoreResult<DocumentMap> {
        let user = self.user();
        self.persistence
            .run_transaction("Reject batch", TransactionMode::ReadWritePrimary, &user, |txn| {
                let batch = txn
                    .mutation_queue()
                    .lookup_mutation_batch(batch_id)
                    .ok_or_else(|| internal_error(format!("Attempt to reject nonexistent batch {batch_id}")))?;
                let affected = batch.keys();
                remove_mutation_batch(txn, &batch)?;
                txn.document_overlay_cache_mut()?
                    .remove_overlays_for_batch_id(&affected, batch_id);
                local_documents_view::recalculate_and_save_overlays_for_document_keys(txn, &affected)?;
                local_documents_view::get_documents(txn, &affected)
            })
    }

    pub fn highest_unacknowledged_batch_id(&self) -> FirestoreResult<BatchId> {
        let user = self.user();
        self.persistence
            .run_transaction("Get highest unacknowledged batch id", TransactionMode::ReadOnly, &user, |txn| {
                Ok(txn.mutation_queue().highest_unacknowledged_batch_id())
            })
    }

    /// The first pending batch after `after_batch_id`, if any.
    pub fn next_mutation_batch(&self, after_batch_id: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>> {
        let user = self.user();
        let after = after_batch_id.unwrap_or(BATCHID_UNKNOWN);
        self.persistence
            .run_transaction("Get next mutation batch", TransactionMode::ReadOnly, &user, |txn| {
                Ok(txn.mutation_queue().next_mutation_batch_after_batch_id(after))
            })
    }

    pub fn last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        let user = self.user();
        self.persistence
            .run_transaction("Get last remote snapshot version", TransactionMode::ReadOnly, &user, |txn| {
                Ok(txn.target_cache().last_remote_snapshot_version())
            })
    }

    /// Applies a consistent batch of watch changes and returns the local view
    /// of every changed document.
    pub fn apply_remote_event(&self, event: &RemoteEvent) -> FirestoreResult<DocumentMap> {
        let remote_version = event.snapshot_version;
        let (user, mut target_data_by_target) = {
            let state = lock(&self.state);
            (state.user.clone(), state.target_data_by_target.clone())
        };

        let changed = self
            .persistence
            .run_transaction("Apply remote event", TransactionMode::ReadWritePrimary, &user, |txn| {
                let sequence_number = txn.current_sequence_number();
                for (target_id, change) in &event.target_changes {
                    let Some(old) = target_data_by_target.get(target_id).cloned() else {
                        continue;
                    };

                    txn.target_cache_mut()?
                        .remove_matching_keys(&change.removed_documents, *target_id);
                    for key in &change.removed_documents {
                        txn.remove_reference(*target_id, key);
                    }
                    txn.target_cache_mut()?
                        .add_matching_keys(&change.added_documents, *target_id);
                    for key in &change.added_documents {
                        txn.add_reference(*target_id, key);
                    }

                    let mut updated = old.with_sequence_number(sequence_number);
                    if event.target_mismatches.contains_key(target_id) {
                        updated = updated
                            .with_resume_token(Vec::new(), SnapshotVersion::min())
                            .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                    } else if !change.resume_token.is_empty() {
                        updated = updated.with_resume_token(change.resume_token.clone(), remote_version);
                    }

                    if should_persist_target_data(&old, &updated, change) {
                        txn.target_cache_mut()?.update_target_data(updated.clone())?;
                    }
                    target_data_by_target.insert(*target_id, updated);
                }

                for key in event.document_updates.keys() {
                    if event.resolved_limbo_documents.contains(key) {
                        txn.update_limbo_document(key);
                    }
                }

                let mut buffer = RemoteDocumentChangeBuffer::new();
                let (changed_docs, existence_changed) =
                    populate_document_change_buffer(txn, &mut buffer, &event.document_updates);

                if !remote_version.is_min() {
                    let last = txn.target_cache().last_remote_snapshot_version();
                    if remote_version < last {
                        return Err(internal_error(format!(
                            "Watch stream reverted to previous snapshot?? {remote_version} < {last}"
                        )));
                    }
                    txn.target_cache_mut()?
                        .set_targets_metadata(sequence_number, Some(remote_version));
                }

                buffer.apply(txn)?;
                local_documents_view::get_local_view_of_documents(txn, changed_docs, &existence_changed)
            })?;

        lock(&self.state).target_data_by_target = target_data_by_target;
        Ok(changed)
    }

    /// Pins documents shown in live views and advances the limbo-free
    /// version of targets whose views are in sync.
    pub fn notify_local_view_changes(&self, view_changes: &[LocalViewChanges]) -> FirestoreResult<()> {
        let user = self.user();
        self.persistence
            .run_transaction("Notify local view changes", TransactionMode::ReadWrite, &user, |txn| {
                for change in view_changes {
                    for key in &change.added_keys {
                        txn.local_view_references_mut()?
                            .add_reference(key.clone(), change.target_id);
                        txn.add_reference(change.target_id, key);
                    }
                    for key in &change.removed_keys {
                        txn.local_view_references_mut()?
                            .remove_reference(key, change.target_id);
                        txn.remove_reference(change.target_id, key);
                    }
                }
                Ok(())
            })?;

        let mut state = lock(&self.state);
        for change in view_changes {
            if change.from_cache {
                continue;
            }
            if let Some(target_data) = state.target_data_by_target.get(&change.target_id) {
                let updated = target_data.with_last_limbo_free_snapshot_version(target_data.snapshot_version);
                state.target_data_by_target.insert(change.target_id, updated);
            }
        }
        Ok(())
    }

    /// Reuses the cached target for `target` or assigns a new target id.
    pub fn allocate_target(&self, target: Target) -> FirestoreResult<TargetData> {
        let user = self.user();
        let target_data = self
            .persistence
            .run_transaction("Allocate target", TransactionMode::ReadWrite, &user, |txn| {
                if let Some(cached) = txn.target_cache().get_target_data(&target) {
                    return Ok(cached);
                }
                let target_id = txn.target_cache_mut()?.allocate_target_id();
                let data = TargetData::new(
                    target.clone(),
                    target_id,
                    TargetPurpose::Listen,
                    txn.current_sequence_number(),
                );
                txn.target_cache_mut()?.add_target_data(data.clone())?;
                Ok(data)
            })?;

        let mut state = lock(&self.state);
        let replace = state
            .target_data_by_target
            .get(&target_data.target_id)
            .map_or(true, |cached| target_data.snapshot_version > cached.snapshot_version);
        if replace {
            state
                .target_data_by_target
                .insert(target_data.target_id, target_data.clone());
            state
                .target_id_by_target
                .insert(target_data.target.canonical_id().to_string(), target_data.target_id);
        }
        Ok(target_data)
    }

    /// Stops tracking an active target. Unless `keep_persisted_target_data`
    /// is set the target becomes eligible for garbage collection.
    pub fn release_target(&self, target_id: TargetId, keep_persisted_target_data: bool) -> FirestoreResult<()> {
        let (user, target_data) = {
            let state = lock(&self.state);
            (state.user.clone(), state.target_data_by_target.get(&target_id).cloned())
        };
        let target_data =
            target_data.ok_or_else(|| internal_error(format!("Tried to release nonexistent target {target_id}")))?;
        let mode = if keep_persisted_target_data {
            TransactionMode::ReadWrite
        } else {
            TransactionMode::ReadWritePrimary
        };

        self.persistence.run_transaction("Release target", mode, &user, |txn| {
            let removed = txn.local_view_references_mut()?.remove_references_for_id(target_id);
            for key in &removed {
                txn.remove_reference(target_id, key);
            }
            if !keep_persisted_target_data {
                txn.remove_target(&target_data)?;
            }
            Ok(())
        })?;

        let mut state = lock(&self.state);
        state.target_data_by_target.remove(&target_id);
        state.target_id_by_target.remove(target_data.target.canonical_id());
        Ok(())
    }

    /// Runs `query` against the local caches. With `use_previous_results`
    /// the target's last limbo-free result set is reused when possible.
    pub fn execute_query(&self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        let (user, engine, active) = {
            let state = lock(&self.state);
            let target = query.to_target();
            let active = state
                .target_id_by_target
                .get(target.canonical_id())
                .and_then(|id| state.target_data_by_target.get(id))
                .cloned();
            (state.user.clone(), state.query_engine.clone(), active)
        };

        self.persistence
            .run_transaction("Execute query", TransactionMode::ReadWrite, &user, |txn| {
                let target_data = match active {
                    Some(data) => Some(data),
                    None => txn.target_cache().get_target_data(&query.to_target()),
                };
                let (last_limbo_free, remote_keys) = match &target_data {
                    Some(data) => (
                        data.last_limbo_free_snapshot_version,
                        txn.target_cache().get_matching_keys_for_target_id(data.target_id),
                    ),
                    None => (SnapshotVersion::min(), BTreeSet::new()),
                };

                let documents = if use_previous_results {
                    engine.get_documents_matching_query(txn, query, last_limbo_free, &remote_keys)?
                } else {
                    engine.get_documents_matching_query(txn, query, SnapshotVersion::min(), &BTreeSet::new())?
                };
                Ok(QueryResult {
                    documents,
                    remote_keys,
                })
            })
    }

    /// Local view of a single document.
    pub fn read_document(&self, key: &DocumentKey) -> FirestoreResult<Document> {
        let user = self.user();
        self.persistence
            .run_transaction("Read document", TransactionMode::ReadOnly, &user, |txn| {
                Ok(local_documents_view::get_document(txn, key))
            })
    }

    /// Switches to `user`'s queue and overlays and reports which documents'
    /// local view may have changed.
    pub fn handle_user_change(&self, user: User) -> FirestoreResult<UserChangeResult> {
        let old_user = self.user();
        let old_batches = self
            .persistence
            .run_transaction("Load old user batches", TransactionMode::ReadOnly, &old_user, |txn| {
                Ok(txn.mutation_queue().all_mutation_batches())
            })?;

        let (new_batches, affected_documents) = self.persistence.run_transaction(
            "Handle user change",
            TransactionMode::ReadOnly,
            &user,
            |txn| {
                let new_batches = txn.mutation_queue().all_mutation_batches();
                let changed_keys: BTreeSet<DocumentKey> = old_batches
                    .iter()
                    .chain(new_batches.iter())
                    .flat_map(MutationBatch::keys)
                    .collect();
                let documents = local_documents_view::get_documents(txn, &changed_keys)?;
                Ok((new_batches, documents))
            },
        )?;

        lock(&self.state).user = user;
        Ok(UserChangeResult {
            affected_documents,
            removed_batch_ids: old_batches.iter().map(|batch| batch.batch_id).collect(),
            added_batch_ids: new_batches.iter().map(|batch| batch.batch_id).collect(),
        })
    }

    /// Replaces the configured field indexes with `indexes`.
    pub fn configure_field_indexes(&self, indexes: Vec<FieldIndex>) -> FirestoreResult<()> {
        let user = self.user();
        self.persistence
            .run_transaction("Configure indexes", TransactionMode::ReadWrite, &user, |txn| {
                let existing = txn.index_manager().get_field_indexes(None);
                for old in &existing {
                    if !indexes.iter().any(|index| index.same_definition(old)) {
                        txn.index_manager_mut()?.delete_field_index(old);
                    }
                }
                for index in indexes {
                    if existing.iter().any(|old| old.same_definition(&index)) {
                        continue;
                    }
                    let stored = txn.index_manager_mut()?.add_field_index(index);
                    backfill_index(txn, &stored)?;
                }
                Ok(())
            })
    }

    pub fn delete_all_field_indexes(&self) -> FirestoreResult<()> {
        self.configure_field_indexes(Vec::new())
    }

    pub fn set_index_auto_creation_enabled(&self, enabled: bool) {
        lock(&self.state)
            .query_engine
            .set_index_auto_creation_enabled(enabled);
    }

    /// Drops inactive targets and every document nothing refers to. Returns
    /// the number of documents removed.
    pub fn collect_garbage(&self) -> FirestoreResult<usize> {
        let (user, active) = {
            let state = lock(&self.state);
            let active: BTreeSet<TargetId> = state.target_data_by_target.keys().copied().collect();
            (state.user.clone(), active)
        };

        let removed = self
            .persistence
            .run_transaction("Collect garbage", TransactionMode::ReadWritePrimary, &user, |txn| {
                for target_data in txn.target_cache().all_target_data() {
                    if !active.contains(&target_data.target_id) {
                        txn.target_cache_mut()?.remove_target_data(&target_data);
                    }
                }

                let mut buffer = RemoteDocumentChangeBuffer::new();
                let mut removed = 0;
                for key in txn.remote_document_cache().keys() {
                    if !txn.is_referenced(&key) {
                        buffer.remove_entry(&key);
                        removed += 1;
                    }
                }
                buffer.apply(txn)?;
                Ok(removed)
            })?;
        log::debug!("Garbage collection removed {removed} documents");
        Ok(removed)
    }
}

fn remove_mutation_batch(txn: &mut dyn PersistenceTransaction, batch: &MutationBatch) -> FirestoreResult<()> {
    txn.mutation_queue_mut()?.remove_mutation_batch(batch)?;
    for key in batch.keys() {
        txn.mark_potentially_orphaned(&key);
    }
    Ok(())
}

fn apply_write_to_remote_document_cache(
    txn: &mut dyn PersistenceTransaction,
    result: &MutationBatchResult,
    buffer: &mut RemoteDocumentChangeBuffer,
) -> FirestoreResult<()> {
    let batch = &result.batch;
    for key in batch.keys() {
        let mut document = buffer.get_entry(txn, &key);
        let ack_version = result
            .doc_versions
            .get(&key)
            .copied()
            .ok_or_else(|| internal_error(format!("No version for acknowledged document {key}")))?;
        if document.version() < ack_version {
            batch.apply_to_remote_document(&mut document, result);
            if document.is_valid_document() {
                document.set_read_time(result.commit_version);
                buffer.add_entry(document);
            }
        }
    }
    remove_mutation_batch(txn, batch)
}

/// Writes newer watch documents into `buffer`. Returns the changed documents
/// and the keys whose existence flipped.
fn populate_document_change_buffer(
    txn: &dyn PersistenceTransaction,
    buffer: &mut RemoteDocumentChangeBuffer,
    documents: &BTreeMap<DocumentKey, Document>,
) -> (DocumentMap, BTreeSet<DocumentKey>) {
    let keys: BTreeSet<DocumentKey> = documents.keys().cloned().collect();
    let existing_docs = buffer.get_entries(txn, &keys);
    let mut changed = DocumentMap::new();
    let mut existence_changed = BTreeSet::new();

    for (key, document) in documents {
        let existing = existing_docs
            .get(key)
            .cloned()
            .unwrap_or_else(|| Document::new_invalid_document(key.clone()));
        if document.is_found_document() != existing.is_found_document() {
            existence_changed.insert(key.clone());
        }

        // Manufactured deletes (rejected limbo resolutions) never add to the cache.
        if document.is_no_document() && document.version().is_min() {
            buffer.remove_entry(key);
            changed.insert(key.clone(), document.clone());
        } else if !existing.is_valid_document()
            || document.version() > existing.version()
            || (document.version() == existing.version() && existing.has_pending_writes())
        {
            buffer.add_entry(document.clone());
            changed.insert(key.clone(), document.clone());
        } else {
            log::debug!(
                "Ignoring outdated watch update for {key}. Current version: {} Watch version: {}",
                existing.version(),
                document.version()
            );
        }
    }
    (changed, existence_changed)
}

fn should_persist_target_data(old: &TargetData, new: &TargetData, change: &TargetChange) -> bool {
    if old.resume_token.is_empty() {
        return true;
    }
    let delta = new.snapshot_version.to_micros() - old.snapshot_version.to_micros();
    if delta >= RESUME_TOKEN_MAX_AGE_MICROS {
        return true;
    }
    change.added_documents.len() + change.modified_documents.len() + change.removed_documents.len() > 0
}
