use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use async_trait::async_trait;
use futures::channel::oneshot;

use crate::core::event_manager::{QueryListenHandler, SyncEngineListener};
use crate::core::view::{LimboDocumentChange, View};
use crate::core::{OnlineState, Query, Target, TargetIdGenerator, ViewSnapshot};
use crate::error::{cancelled, FirestoreError, FirestoreResult};
use crate::local::{DocumentMap, LocalStore, LocalViewChanges, ReferenceSet, TargetData, TargetPurpose};
use crate::model::{
    BatchId, Document, DocumentKey, Mutation, MutationBatchResult, SnapshotVersion, TargetId, User,
    BATCHID_UNKNOWN, INVALID_SEQUENCE_NUMBER,
};
use crate::remote::{RemoteEvent, RemoteStore, RemoteSyncer, TargetChange};
use crate::util::lock;

/// Resolves once the batch is acknowledged, or with the rejection error.
pub type WriteCompletion = oneshot::Receiver<FirestoreResult<()>>;

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

/// Network work decided while the engine's state was locked, carried out
/// once the lock is released.
enum RemoteOp {
    Listen(TargetData),
    Unlisten(TargetId),
}

struct LimboResolution {
    key: DocumentKey,
    /// Set once the resolution target reported the document; the remote
    /// keys of the target are then `{key}`.
    received_document: bool,
}

/// Limbo documents, the dedicated targets resolving them and the queue of
/// documents waiting for a free slot.
struct LimboTracker {
    max_concurrent_resolutions: usize,
    enqueued: VecDeque<DocumentKey>,
    active_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    /// Which query targets consider each key to be in limbo.
    document_refs: ReferenceSet,
    target_id_generator: TargetIdGenerator,
}

impl LimboTracker {
    fn new(max_concurrent_resolutions: usize) -> Self {
        Self {
            max_concurrent_resolutions,
            enqueued: VecDeque::new(),
            active_targets_by_key: BTreeMap::new(),
            active_resolutions_by_target: BTreeMap::new(),
            document_refs: ReferenceSet::new(),
            target_id_generator: TargetIdGenerator::for_sync_engine(),
        }
    }

    fn update(&mut self, target_id: TargetId, changes: Vec<LimboDocumentChange>, ops: &mut Vec<RemoteOp>) {
        for change in changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    self.document_refs.add_reference(key.clone(), target_id);
                    self.track(key, ops);
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("Document no longer in limbo: {key}");
                    self.document_refs.remove_reference(&key, target_id);
                    if !self.document_refs.contains_key(&key) {
                        self.remove(&key, ops);
                    }
                }
            }
        }
    }

    fn track(&mut self, key: DocumentKey, ops: &mut Vec<RemoteOp>) {
        if self.active_targets_by_key.contains_key(&key) || self.enqueued.contains(&key) {
            return;
        }
        log::debug!("New document in limbo: {key}");
        self.enqueued.push_back(key);
        self.pump(ops);
    }

    /// Starts resolution targets for queued keys while slots are free.
    fn pump(&mut self, ops: &mut Vec<RemoteOp>) {
        while self.active_targets_by_key.len() < self.max_concurrent_resolutions {
            let Some(key) = self.enqueued.pop_front() else {
                break;
            };
            let target_id = self.target_id_generator.next_id();
            self.active_resolutions_by_target.insert(
                target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.active_targets_by_key.insert(key.clone(), target_id);
            ops.push(RemoteOp::Listen(TargetData::new(
                Target::for_document(&key),
                target_id,
                TargetPurpose::LimboResolution,
                INVALID_SEQUENCE_NUMBER,
            )));
        }
    }

    fn remove(&mut self, key: &DocumentKey, ops: &mut Vec<RemoteOp>) {
        self.enqueued.retain(|queued| queued != key);
        let Some(target_id) = self.active_targets_by_key.remove(key) else {
            return;
        };
        self.active_resolutions_by_target.remove(&target_id);
        ops.push(RemoteOp::Unlisten(target_id));
        self.pump(ops);
    }

    /// Forgets the resolution behind a target the backend removed on its
    /// own and frees its slot. No unlisten is issued.
    fn reject(&mut self, target_id: TargetId, ops: &mut Vec<RemoteOp>) -> Option<DocumentKey> {
        let resolution = self.active_resolutions_by_target.remove(&target_id)?;
        self.active_targets_by_key.remove(&resolution.key);
        self.pump(ops);
        Some(resolution.key)
    }

    fn release_query_target(&mut self, target_id: TargetId, ops: &mut Vec<RemoteOp>) {
        for key in self.document_refs.remove_references_for_id(target_id) {
            if !self.document_refs.contains_key(&key) {
                self.remove(&key, ops);
            }
        }
    }
}

struct SyncEngineState {
    query_views: HashMap<String, QueryView>,
    /// Canonical ids of the queries sharing each target.
    queries_by_target: BTreeMap<TargetId, Vec<String>>,
    limbo: LimboTracker,
    /// Per user, the completion of each of their unacknowledged batches.
    mutation_callbacks: HashMap<User, BTreeMap<BatchId, oneshot::Sender<FirestoreResult<()>>>>,
    /// Waiters keyed by the highest batch id pending when they registered.
    pending_writes_callbacks: BTreeMap<BatchId, Vec<oneshot::Sender<FirestoreResult<()>>>>,
    current_user: User,
    online_state: OnlineState,
}

/// Reconciles local writes, remote events and active queries.
///
/// The sync engine owns the views of all active queries. It registers query
/// targets with the local and remote stores, recomputes views whenever
/// documents change, and resolves documents that a view still shows but the
/// backend no longer reports ("limbo" documents) through dedicated
/// single-document targets.
///
/// All methods run on the async queue.
pub struct SyncEngine {
    local_store: Arc<LocalStore>,
    remote_store: Arc<RemoteStore>,
    listener: OnceLock<Weak<dyn SyncEngineListener>>,
    state: Mutex<SyncEngineState>,
}

impl SyncEngine {
    pub fn new(
        local_store: Arc<LocalStore>,
        remote_store: Arc<RemoteStore>,
        max_concurrent_limbo_resolutions: usize,
    ) -> Arc<Self> {
        let current_user = local_store.user();
        let engine = Arc::new(Self {
            local_store,
            remote_store,
            listener: OnceLock::new(),
            state: Mutex::new(SyncEngineState {
                query_views: HashMap::new(),
                queries_by_target: BTreeMap::new(),
                limbo: LimboTracker::new(max_concurrent_limbo_resolutions),
                mutation_callbacks: HashMap::new(),
                pending_writes_callbacks: BTreeMap::new(),
                current_user,
                online_state: OnlineState::Unknown,
            }),
        });
        let weak: Weak<Self> = Arc::downgrade(&engine);
        let syncer: Weak<dyn RemoteSyncer> = weak;
        engine.remote_store.set_syncer(syncer);
        engine
    }

    /// Connects the component snapshots are delivered to. Set once.
    pub fn set_listener(&self, listener: Weak<dyn SyncEngineListener>) {
        if self.listener.set(listener).is_err() {
            log::warn!("sync engine listener already set");
        }
    }

    fn listener(&self) -> Option<Arc<dyn SyncEngineListener>> {
        self.listener.get().and_then(Weak::upgrade)
    }

    fn state(&self) -> MutexGuard<'_, SyncEngineState> {
        lock(&self.state)
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.local_store
    }

    pub fn remote_store(&self) -> &Arc<RemoteStore> {
        &self.remote_store
    }

    /// Keys currently awaiting limbo resolution, with their target ids.
    pub fn active_limbo_documents(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.state().limbo.active_targets_by_key.clone()
    }

    pub fn enqueued_limbo_documents(&self) -> Vec<DocumentKey> {
        self.state().limbo.enqueued.iter().cloned().collect()
    }

    async fn run_remote_ops(&self, ops: Vec<RemoteOp>) {
        for op in ops {
            match op {
                RemoteOp::Listen(target_data) => self.remote_store.listen(target_data).await,
                RemoteOp::Unlisten(target_id) => self.remote_store.unlisten(target_id).await,
            }
        }
    }

    /// Registers the first listener of `query`: allocates its target, builds
    /// the view from the local cache and starts watching.
    pub async fn listen(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let canonical_id = query.canonical_id();
        if let Some(existing) = self.state().query_views.get(&canonical_id) {
            // Equal queries share one view.
            return Ok(existing.view.compute_initial_snapshot());
        }

        let target_data = self.local_store.allocate_target(query.to_target())?;
        let target_id = target_data.target_id;
        let result = self.local_store.execute_query(&query, true)?;

        let mut ops = Vec::new();
        let snapshot = {
            let mut state = self.state();
            let mut view = View::new(query.clone(), result.remote_keys.clone());
            let doc_changes = view.compute_doc_changes(&result.documents, None);
            let mut synthesized = TargetChange::create_synthesized(false);
            synthesized.resume_token = target_data.resume_token.clone();
            let view_change = view.apply_changes(doc_changes, true, Some(&synthesized), false);
            state.limbo.update(target_id, view_change.limbo_changes, &mut ops);
            let snapshot = view_change
                .snapshot
                .unwrap_or_else(|| view.compute_initial_snapshot());

            state.query_views.insert(
                canonical_id.clone(),
                QueryView {
                    query,
                    target_id,
                    view,
                },
            );
            state.queries_by_target.entry(target_id).or_default().push(canonical_id);
            snapshot
        };

        self.remote_store.listen(target_data).await;
        self.run_remote_ops(ops).await;
        Ok(snapshot)
    }

    /// Drops the view of `query`; the target is released once no query
    /// uses it any more.
    pub async fn unlisten(&self, query: Query) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let target_id = {
            let mut state = self.state();
            let Some(query_view) = state.query_views.remove(&canonical_id) else {
                log::debug!("unlisten for unknown query {query}");
                return Ok(());
            };
            let target_id = query_view.target_id;
            let remaining = state.queries_by_target.get_mut(&target_id).map(|queries| {
                queries.retain(|id| *id != canonical_id);
                queries.len()
            });
            if remaining.unwrap_or(0) > 0 {
                return Ok(());
            }
            target_id
        };

        self.local_store.release_target(target_id, false)?;
        self.remote_store.unlisten(target_id).await;
        let ops = self.remove_and_clean_up_target(target_id, None);
        self.run_remote_ops(ops).await;
        Ok(())
    }

    fn remove_and_clean_up_target(&self, target_id: TargetId, error: Option<FirestoreError>) -> Vec<RemoteOp> {
        let mut ops = Vec::new();
        let removed_queries = {
            let mut state = self.state();
            let canonical_ids = state.queries_by_target.remove(&target_id).unwrap_or_default();
            let removed: Vec<Query> = canonical_ids
                .iter()
                .filter_map(|id| state.query_views.remove(id))
                .map(|query_view| query_view.query)
                .collect();
            state.limbo.release_query_target(target_id, &mut ops);
            removed
        };

        if let (Some(error), Some(listener)) = (error, self.listener()) {
            for query in &removed_queries {
                listener.on_watch_error(query, error.clone());
            }
        }
        ops
    }

    /// Applies `mutations` locally, raises the resulting snapshots and hands
    /// the batch to the write pipeline. The returned receiver completes when
    /// the backend accepts or rejects the batch.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<WriteCompletion> {
        let result = self.local_store.local_write(mutations)?;
        let (sender, receiver) = oneshot::channel();
        {
            let mut state = self.state();
            let user = state.current_user.clone();
            state
                .mutation_callbacks
                .entry(user)
                .or_default()
                .insert(result.batch_id, sender);
        }
        self.emit_new_snapshots_and_notify_local_store(&result.changes, None)
            .await?;
        self.remote_store.fill_write_pipeline().await;
        Ok(receiver)
    }

    /// Resolves once every batch pending at the time of the call has been
    /// acknowledged. Rejections and user changes reject it.
    pub fn register_pending_writes_callback(&self) -> FirestoreResult<oneshot::Receiver<FirestoreResult<()>>> {
        let (sender, receiver) = oneshot::channel();
        if !self.remote_store.can_use_network() {
            log::debug!("The network is disabled. The task returned by 'wait_for_pending_writes' will not complete until the network is enabled.");
        }
        let highest_batch_id = self.local_store.highest_unacknowledged_batch_id()?;
        if highest_batch_id == BATCHID_UNKNOWN {
            let _ = sender.send(Ok(()));
        } else {
            self.state()
                .pending_writes_callbacks
                .entry(highest_batch_id)
                .or_default()
                .push(sender);
        }
        Ok(receiver)
    }

    fn process_user_callback(&self, batch_id: BatchId, result: FirestoreResult<()>) {
        let callback = {
            let mut state = self.state();
            let user = state.current_user.clone();
            state
                .mutation_callbacks
                .get_mut(&user)
                .and_then(|callbacks| callbacks.remove(&batch_id))
        };
        if let Some(callback) = callback {
            let _ = callback.send(result);
        }
    }

    /// Resolves waiters whose batches are all acknowledged.
    fn resolve_pending_writes_callbacks(&self, batch_id: BatchId) {
        let ready: Vec<_> = {
            let mut state = self.state();
            let later = state.pending_writes_callbacks.split_off(&(batch_id + 1));
            std::mem::replace(&mut state.pending_writes_callbacks, later)
                .into_values()
                .flatten()
                .collect()
        };
        for callback in ready {
            let _ = callback.send(Ok(()));
        }
    }

    /// Rejects every waiter that was still waiting for `batch_id`.
    fn reject_pending_writes_callbacks_from(&self, batch_id: BatchId, error: &FirestoreError) {
        let waiting: Vec<_> = {
            let mut state = self.state();
            state
                .pending_writes_callbacks
                .split_off(&batch_id)
                .into_values()
                .flatten()
                .collect()
        };
        for callback in waiting {
            let _ = callback.send(Err(error.clone()));
        }
    }

    fn reject_all_pending_writes_callbacks(&self, error: FirestoreError) {
        let all = std::mem::take(&mut self.state().pending_writes_callbacks);
        for callback in all.into_values().flatten() {
            let _ = callback.send(Err(error.clone()));
        }
    }

    /// Recomputes every view with `changes`, delivers the snapshots and pins
    /// the documents now visible.
    async fn emit_new_snapshots_and_notify_local_store(
        &self,
        changes: &DocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        let mut ops = Vec::new();
        let mut snapshots = Vec::new();
        let mut view_changes = Vec::new();
        {
            let mut state = self.state();
            let SyncEngineState { query_views, limbo, .. } = &mut *state;
            for query_view in query_views.values_mut() {
                let view = &mut query_view.view;
                let mut doc_changes = view.compute_doc_changes(changes, None);
                if doc_changes.needs_refill {
                    // The limit edge moved; recompute against the whole local result.
                    let result = self.local_store.execute_query(&query_view.query, false)?;
                    doc_changes = view.compute_doc_changes(&result.documents, Some(doc_changes));
                }
                let target_id = query_view.target_id;
                let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
                let pending_reset =
                    remote_event.is_some_and(|event| event.target_mismatches.contains_key(&target_id));
                let view_change = view.apply_changes(doc_changes, true, target_change, pending_reset);
                limbo.update(target_id, view_change.limbo_changes, &mut ops);
                if let Some(snapshot) = view_change.snapshot {
                    view_changes.push(LocalViewChanges::from_snapshot(target_id, &snapshot));
                    snapshots.push(snapshot);
                }
            }
        }

        if let Some(listener) = self.listener() {
            listener.on_watch_change(snapshots);
        }
        self.local_store.notify_local_view_changes(&view_changes)?;
        self.run_remote_ops(ops).await;
        Ok(())
    }

    fn record_limbo_resolution_progress(&self, event: &RemoteEvent) {
        let mut state = self.state();
        for (target_id, change) in &event.target_changes {
            let Some(resolution) = state.limbo.active_resolutions_by_target.get_mut(target_id) else {
                continue;
            };
            let change_count =
                change.added_documents.len() + change.modified_documents.len() + change.removed_documents.len();
            if change_count > 1 {
                log::warn!("Limbo resolution for {} contains {change_count} changes", resolution.key);
            }
            if !change.added_documents.is_empty() {
                resolution.received_document = true;
            } else if !change.removed_documents.is_empty() {
                resolution.received_document = false;
            }
        }
    }
}

#[async_trait]
impl QueryListenHandler for SyncEngine {
    async fn listen(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        SyncEngine::listen(self, query).await
    }

    async fn unlisten(&self, query: Query) -> FirestoreResult<()> {
        SyncEngine::unlisten(self, query).await
    }
}

#[async_trait]
impl RemoteSyncer for SyncEngine {
    async fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()> {
        self.record_limbo_resolution_progress(&event);
        let changes = self.local_store.apply_remote_event(&event)?;
        self.emit_new_snapshots_and_notify_local_store(&changes, Some(&event))
            .await
    }

    async fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        let mut ops = Vec::new();
        let limbo_key = self.state().limbo.reject(target_id, &mut ops);

        match limbo_key {
            Some(key) => {
                // The watch already dropped the target; only free the slot.
                self.run_remote_ops(ops).await;

                // The backend refused to tell us about the document; treat it
                // as deleted so the query can become consistent again.
                let mut event = RemoteEvent {
                    snapshot_version: SnapshotVersion::min(),
                    ..RemoteEvent::default()
                };
                event.document_updates.insert(
                    key.clone(),
                    Document::new_no_document(key.clone(), SnapshotVersion::min()),
                );
                event.resolved_limbo_documents.insert(key);
                self.apply_remote_event(event).await?;
            }
            None => {
                self.local_store.release_target(target_id, false)?;
                let ops = self.remove_and_clean_up_target(target_id, Some(error));
                self.run_remote_ops(ops).await;
            }
        }
        Ok(())
    }

    async fn apply_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id;
        let changes = self.local_store.acknowledge_batch(&result)?;
        self.process_user_callback(batch_id, Ok(()));
        self.resolve_pending_writes_callbacks(batch_id);
        self.emit_new_snapshots_and_notify_local_store(&changes, None)
            .await
    }

    async fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        let changes = self.local_store.reject_batch(batch_id)?;
        self.process_user_callback(batch_id, Err(error.clone()));
        self.reject_pending_writes_callbacks_from(batch_id, &error);
        self.emit_new_snapshots_and_notify_local_store(&changes, None)
            .await
    }

    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        let state = self.state();
        if let Some(resolution) = state.limbo.active_resolutions_by_target.get(&target_id) {
            let mut keys = BTreeSet::new();
            if resolution.received_document {
                keys.insert(resolution.key.clone());
            }
            return keys;
        }
        state
            .queries_by_target
            .get(&target_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.query_views.get(id))
            .flat_map(|query_view| query_view.view.synced_documents().iter().cloned())
            .collect()
    }

    async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        if self.state().current_user == user {
            return Ok(());
        }
        log::debug!("User change. New user: {}", user.storage_key());
        let result = self.local_store.handle_user_change(user.clone())?;
        self.state().current_user = user;
        self.reject_all_pending_writes_callbacks(cancelled(
            "'wait_for_pending_writes' is rejected due to a user change",
        ));
        self.emit_new_snapshots_and_notify_local_store(&result.affected_documents, None)
            .await
    }

    fn apply_online_state_change(&self, online_state: OnlineState) {
        let snapshots: Vec<ViewSnapshot> = {
            let mut state = self.state();
            state.online_state = online_state;
            state
                .query_views
                .values_mut()
                .filter_map(|query_view| query_view.view.apply_online_state_change(online_state).snapshot)
                .collect()
        };
        if let Some(listener) = self.listener() {
            listener.on_online_state_change(online_state);
            listener.on_watch_change(snapshots);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::key;

    fn listened(ops: &[RemoteOp]) -> Vec<(TargetId, Target)> {
        ops.iter()
            .filter_map(|op| match op {
                RemoteOp::Listen(data) => Some((data.target_id, data.target.clone())),
                RemoteOp::Unlisten(_) => None,
            })
            .collect()
    }

    fn unlistened(ops: &[RemoteOp]) -> Vec<TargetId> {
        ops.iter()
            .filter_map(|op| match op {
                RemoteOp::Unlisten(target_id) => Some(*target_id),
                RemoteOp::Listen(_) => None,
            })
            .collect()
    }

    #[test]
    fn limbo_resolutions_are_bounded_and_queued_in_order() {
        let mut limbo = LimboTracker::new(2);
        let mut ops = Vec::new();
        limbo.update(
            2,
            vec![
                LimboDocumentChange::Added(key("rooms/a")),
                LimboDocumentChange::Added(key("rooms/b")),
                LimboDocumentChange::Added(key("rooms/c")),
            ],
            &mut ops,
        );

        let started = listened(&ops);
        assert_eq!(started.len(), 2);
        assert_eq!(started[0].1, Target::for_document(&key("rooms/a")));
        assert_eq!(started[1].1, Target::for_document(&key("rooms/b")));
        assert!(started.iter().all(|(target_id, _)| target_id % 2 == 1));
        assert_eq!(limbo.enqueued, VecDeque::from(vec![key("rooms/c")]));

        let mut ops = Vec::new();
        limbo.update(2, vec![LimboDocumentChange::Removed(key("rooms/a"))], &mut ops);
        assert_eq!(unlistened(&ops), vec![started[0].0]);
        let next = listened(&ops);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].1, Target::for_document(&key("rooms/c")));
        assert!(limbo.enqueued.is_empty());
        assert_eq!(limbo.active_targets_by_key.len(), 2);
    }

    #[test]
    fn limbo_document_shared_by_two_queries_is_resolved_once() {
        let mut limbo = LimboTracker::new(5);
        let mut ops = Vec::new();
        limbo.update(2, vec![LimboDocumentChange::Added(key("rooms/a"))], &mut ops);
        limbo.update(4, vec![LimboDocumentChange::Added(key("rooms/a"))], &mut ops);
        assert_eq!(listened(&ops).len(), 1);

        let mut ops = Vec::new();
        limbo.release_query_target(2, &mut ops);
        assert!(ops.is_empty());
        assert!(limbo.active_targets_by_key.contains_key(&key("rooms/a")));

        limbo.release_query_target(4, &mut ops);
        assert_eq!(unlistened(&ops).len(), 1);
        assert!(limbo.active_targets_by_key.is_empty());
        assert!(limbo.active_resolutions_by_target.is_empty());
    }

    #[test]
    fn rejected_limbo_target_frees_its_slot_without_unlisten() {
        let mut limbo = LimboTracker::new(1);
        let mut ops = Vec::new();
        limbo.update(
            2,
            vec![
                LimboDocumentChange::Added(key("rooms/a")),
                LimboDocumentChange::Added(key("rooms/b")),
            ],
            &mut ops,
        );
        let rejected = listened(&ops)[0].0;

        let mut ops = Vec::new();
        assert_eq!(limbo.reject(rejected, &mut ops), Some(key("rooms/a")));
        assert!(unlistened(&ops).is_empty());
        let next = listened(&ops);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].1, Target::for_document(&key("rooms/b")));

        // The view dropping the deleted document afterwards sends nothing.
        let mut ops = Vec::new();
        limbo.update(2, vec![LimboDocumentChange::Removed(key("rooms/a"))], &mut ops);
        assert!(ops.is_empty());
        assert_eq!(limbo.reject(rejected, &mut ops), None);
    }

    #[test]
    fn removing_a_queued_key_drops_it_from_the_queue() {
        let mut limbo = LimboTracker::new(1);
        let mut ops = Vec::new();
        limbo.update(
            2,
            vec![
                LimboDocumentChange::Added(key("rooms/a")),
                LimboDocumentChange::Added(key("rooms/b")),
            ],
            &mut ops,
        );
        assert_eq!(limbo.enqueued.len(), 1);

        let mut ops = Vec::new();
        limbo.update(2, vec![LimboDocumentChange::Removed(key("rooms/b"))], &mut ops);
        assert!(ops.is_empty());
        assert!(limbo.enqueued.is_empty());
    }
}
