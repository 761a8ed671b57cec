use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use crate::error::{failed_precondition, storage_transaction_error, FirestoreResult};
use crate::local::document_overlay_cache::{DocumentOverlayCache, MemoryDocumentOverlayCache};
use crate::local::index_manager::{IndexManager, MemoryIndexManager};
use crate::local::mutation_queue::{MemoryMutationQueue, MutationQueue};
use crate::local::persistence::{Persistence, PersistenceTransaction, TransactionMode};
use crate::local::reference_set::ReferenceSet;
use crate::local::remote_document_cache::{MemoryRemoteDocumentCache, RemoteDocumentCache};
use crate::local::target_cache::{MemoryTargetCache, TargetCache};
use crate::local::target_data::TargetData;
use crate::model::{Document, DocumentKey, ListenSequenceNumber, TargetId, User};
use crate::settings::GarbageCollectionMode;
use crate::util::lock;

/// Committed state. Tables are shared with running transactions and cloned
/// on first write, so a failed transaction simply drops its copies.
#[derive(Clone, Default)]
struct MemoryTables {
    mutation_queues: BTreeMap<String, Arc<MemoryMutationQueue>>,
    overlays: BTreeMap<String, Arc<MemoryDocumentOverlayCache>>,
    remote_documents: Arc<MemoryRemoteDocumentCache>,
    targets: Arc<MemoryTargetCache>,
    indexes: Arc<MemoryIndexManager>,
    local_view_references: Arc<ReferenceSet>,
}

struct MemoryState {
    tables: MemoryTables,
    started: bool,
    listen_sequence: ListenSequenceNumber,
    injected_failures: usize,
}

/// In-memory [`Persistence`] backend.
pub struct MemoryPersistence {
    state: Mutex<MemoryState>,
    gc_mode: GarbageCollectionMode,
}

impl MemoryPersistence {
    pub fn new(gc_mode: GarbageCollectionMode) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                tables: MemoryTables::default(),
                started: true,
                listen_sequence: 0,
                injected_failures: 0,
            }),
            gc_mode,
        }
    }

    /// Makes the next `count` transactions fail with a storage-transaction
    /// error, the way a durable backend reports I/O failures.
    pub fn fail_next_transactions(&self, count: usize) {
        lock(&self.state).injected_failures = count;
    }

    /// Number of documents currently held in the remote document cache.
    pub fn remote_document_count(&self) -> usize {
        lock(&self.state).tables.remote_documents.len()
    }
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new(GarbageCollectionMode::Eager)
    }
}

impl Persistence for MemoryPersistence {
    fn start(&self) -> FirestoreResult<()> {
        let mut state = lock(&self.state);
        state.started = true;
        state.injected_failures = 0;
        Ok(())
    }

    fn shutdown(&self) {
        lock(&self.state).started = false;
    }

    fn is_started(&self) -> bool {
        lock(&self.state).started
    }

    fn garbage_collection_mode(&self) -> GarbageCollectionMode {
        self.gc_mode
    }

    fn run_transaction_dyn(
        &self,
        label: &str,
        mode: TransactionMode,
        user: &User,
        work: &mut dyn FnMut(&mut dyn PersistenceTransaction) -> FirestoreResult<()>,
    ) -> FirestoreResult<()> {
        let mut state = lock(&self.state);
        if !state.started {
            return Err(failed_precondition("The client has already been terminated."));
        }
        if state.injected_failures > 0 {
            state.injected_failures -= 1;
            return Err(storage_transaction_error(format!("Transaction '{label}' failed")));
        }

        if !mode.is_read_only() {
            state.listen_sequence += 1;
        }
        log::trace!("Starting transaction: {label}");
        let mut txn = MemoryTransaction::begin(&state.tables, mode, user, state.listen_sequence, self.gc_mode);
        if let Err(err) = work(&mut txn) {
            log::debug!("Transaction '{label}' failed: {err}");
            return Err(err);
        }
        txn.collect_orphans();
        state.tables = txn.into_tables();
        Ok(())
    }
}

struct MemoryTransaction {
    mode: TransactionMode,
    sequence_number: ListenSequenceNumber,
    gc_mode: GarbageCollectionMode,
    user_key: String,
    mutation_queue: Arc<MemoryMutationQueue>,
    overlays: Arc<MemoryDocumentOverlayCache>,
    tables: MemoryTables,
    orphaned: BTreeSet<DocumentKey>,
}

impl MemoryTransaction {
    fn begin(
        committed: &MemoryTables,
        mode: TransactionMode,
        user: &User,
        sequence_number: ListenSequenceNumber,
        gc_mode: GarbageCollectionMode,
    ) -> Self {
        let mut tables = committed.clone();
        let user_key = user.storage_key();
        let mutation_queue = tables.mutation_queues.remove(&user_key).unwrap_or_default();
        let overlays = tables.overlays.remove(&user_key).unwrap_or_default();
        Self {
            mode,
            sequence_number,
            gc_mode,
            user_key,
            mutation_queue,
            overlays,
            tables,
            orphaned: BTreeSet::new(),
        }
    }

    fn ensure_writable(&self) -> FirestoreResult<()> {
        if self.mode.is_read_only() {
            Err(failed_precondition("Cannot write inside a read-only transaction"))
        } else {
            Ok(())
        }
    }

    fn eager(&self) -> bool {
        self.gc_mode == GarbageCollectionMode::Eager
    }

    /// Drops orphaned documents nothing refers to any more.
    fn collect_orphans(&mut self) {
        if !self.eager() || self.orphaned.is_empty() || self.mode.is_read_only() {
            return;
        }
        let orphaned = std::mem::take(&mut self.orphaned);
        let mut removed = Vec::new();
        for key in orphaned {
            if !self.is_referenced(&key) {
                Arc::make_mut(&mut self.tables.remote_documents).remove_entry(&key);
                removed.push(Document::new_invalid_document(key));
            }
        }
        if !removed.is_empty() {
            log::debug!("Garbage collected {} orphaned documents", removed.len());
            Arc::make_mut(&mut self.tables.indexes).update_index_entries(&removed);
        }
    }

    fn into_tables(self) -> MemoryTables {
        let mut tables = self.tables;
        tables.mutation_queues.insert(self.user_key.clone(), self.mutation_queue);
        tables.overlays.insert(self.user_key, self.overlays);
        tables
    }
}

impl PersistenceTransaction for MemoryTransaction {
    fn mode(&self) -> TransactionMode {
        self.mode
    }

    fn current_sequence_number(&self) -> ListenSequenceNumber {
        self.sequence_number
    }

    fn mutation_queue(&self) -> &dyn MutationQueue {
        self.mutation_queue.as_ref()
    }

    fn mutation_queue_mut(&mut self) -> FirestoreResult<&mut dyn MutationQueue> {
        self.ensure_writable()?;
        let table = Arc::make_mut(&mut self.mutation_queue);
        Ok(table)
    }

    fn document_overlay_cache(&self) -> &dyn DocumentOverlayCache {
        self.overlays.as_ref()
    }

    fn document_overlay_cache_mut(&mut self) -> FirestoreResult<&mut dyn DocumentOverlayCache> {
        self.ensure_writable()?;
        let table = Arc::make_mut(&mut self.overlays);
        Ok(table)
    }

    fn remote_document_cache(&self) -> &dyn RemoteDocumentCache {
        self.tables.remote_documents.as_ref()
    }

    fn remote_document_cache_mut(&mut self) -> FirestoreResult<&mut dyn RemoteDocumentCache> {
        self.ensure_writable()?;
        let table = Arc::make_mut(&mut self.tables.remote_documents);
        Ok(table)
    }

    fn target_cache(&self) -> &dyn TargetCache {
        self.tables.targets.as_ref()
    }

    fn target_cache_mut(&mut self) -> FirestoreResult<&mut dyn TargetCache> {
        self.ensure_writable()?;
        let table = Arc::make_mut(&mut self.tables.targets);
        Ok(table)
    }

    fn index_manager(&self) -> &dyn IndexManager {
        self.tables.indexes.as_ref()
    }

    fn index_manager_mut(&mut self) -> FirestoreResult<&mut dyn IndexManager> {
        self.ensure_writable()?;
        let table = Arc::make_mut(&mut self.tables.indexes);
        Ok(table)
    }

    fn local_view_references(&self) -> &ReferenceSet {
        &self.tables.local_view_references
    }

    fn local_view_references_mut(&mut self) -> FirestoreResult<&mut ReferenceSet> {
        self.ensure_writable()?;
        Ok(Arc::make_mut(&mut self.tables.local_view_references))
    }

    fn add_reference(&mut self, _target_id: TargetId, key: &DocumentKey) {
        if self.eager() {
            self.orphaned.remove(key);
        }
    }

    fn remove_reference(&mut self, _target_id: TargetId, key: &DocumentKey) {
        if self.eager() {
            self.orphaned.insert(key.clone());
        }
    }

    fn mark_potentially_orphaned(&mut self, key: &DocumentKey) {
        if self.eager() {
            self.orphaned.insert(key.clone());
        }
    }

    fn remove_target(&mut self, target_data: &TargetData) -> FirestoreResult<()> {
        if self.eager() {
            let targets = self.target_cache_mut()?;
            let keys = targets.remove_matching_keys_for_target_id(target_data.target_id);
            targets.remove_target_data(target_data);
            self.orphaned.extend(keys);
            Ok(())
        } else {
            let updated = target_data.with_sequence_number(self.sequence_number);
            self.target_cache_mut()?.update_target_data(updated)
        }
    }

    fn update_limbo_document(&mut self, key: &DocumentKey) {
        if !self.eager() {
            return;
        }
        if self.is_referenced(key) {
            self.orphaned.remove(key);
        } else {
            self.orphaned.insert(key.clone());
        }
    }

    fn is_referenced(&self, key: &DocumentKey) -> bool {
        self.tables.targets.contains_key(key)
            || self.mutation_queue.contains_key(key)
            || self
                .tables
                .mutation_queues
                .values()
                .any(|queue| queue.contains_key(key))
            || self.tables.local_view_references.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FirestoreErrorCode;
    use crate::local::persistence::PersistenceExt;
    use crate::model::{SnapshotVersion, Timestamp};
    use crate::test_support::{doc, key, map, set_mutation, version};

    fn add_document(txn: &mut dyn PersistenceTransaction, path: &str) -> FirestoreResult<()> {
        txn.remote_document_cache_mut()?
            .add_entry(doc(path, 1, map(&[])), version(1))
    }

    #[test]
    fn failed_transactions_leave_no_trace() {
        let persistence = MemoryPersistence::default();
        let user = User::unauthenticated();
        let result: FirestoreResult<()> =
            persistence.run_transaction("fail", TransactionMode::ReadWrite, &user, |txn| {
                add_document(txn, "rooms/a")?;
                Err(crate::error::internal_error("boom"))
            });
        assert!(result.is_err());
        assert_eq!(persistence.remote_document_count(), 0);
    }

    #[test]
    fn read_only_transactions_reject_writes() {
        let persistence = MemoryPersistence::default();
        let user = User::unauthenticated();
        let err = persistence
            .run_transaction("read", TransactionMode::ReadOnly, &user, |txn| add_document(txn, "rooms/a"))
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);
    }

    #[test]
    fn injected_failures_surface_as_storage_errors() {
        let persistence = MemoryPersistence::default();
        persistence.fail_next_transactions(1);
        let user = User::unauthenticated();
        let err = persistence
            .run_transaction("probe", TransactionMode::ReadOnly, &user, |_| Ok(()))
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::StorageTransaction);
        assert!(persistence
            .run_transaction("probe", TransactionMode::ReadOnly, &user, |_| Ok(()))
            .is_ok());
    }

    #[test]
    fn eager_collection_keeps_referenced_documents() {
        let persistence = MemoryPersistence::default();
        let user = User::unauthenticated();
        persistence
            .run_transaction("seed", TransactionMode::ReadWrite, &user, |txn| {
                add_document(txn, "rooms/a")?;
                add_document(txn, "rooms/b")?;
                txn.mutation_queue_mut()?
                    .add_mutation_batch(Timestamp::now(), vec![set_mutation("rooms/b", map(&[]))]);
                txn.mark_potentially_orphaned(&key("rooms/a"));
                txn.mark_potentially_orphaned(&key("rooms/b"));
                Ok(())
            })
            .unwrap();
        assert_eq!(persistence.remote_document_count(), 1);

        let other = User::authenticated("alice");
        let remaining = persistence
            .run_transaction("read", TransactionMode::ReadOnly, &other, |txn| {
                Ok(txn.remote_document_cache().get_entry(&key("rooms/b")))
            })
            .unwrap();
        assert!(remaining.is_found_document());
        assert_ne!(remaining.read_time(), SnapshotVersion::min());
    }

    #[test]
    fn mutation_queues_are_per_user() {
        let persistence = MemoryPersistence::default();
        let alice = User::authenticated("alice");
        persistence
            .run_transaction("write", TransactionMode::ReadWrite, &alice, |txn| {
                txn.mutation_queue_mut()?
                    .add_mutation_batch(Timestamp::now(), vec![set_mutation("rooms/a", map(&[]))]);
                Ok(())
            })
            .unwrap();

        let empty_for_bob = persistence
            .run_transaction("read", TransactionMode::ReadOnly, &User::authenticated("bob"), |txn| {
                Ok(txn.mutation_queue().is_empty())
            })
            .unwrap();
        assert!(empty_for_bob);
        let pending_for_alice = persistence
            .run_transaction("read", TransactionMode::ReadOnly, &alice, |txn| {
                Ok(txn.mutation_queue().all_mutation_batches().len())
            })
            .unwrap();
        assert_eq!(pending_for_alice, 1);
    }

    #[test]
    fn shutdown_rejects_transactions_until_restarted() {
        let persistence = MemoryPersistence::default();
        let user = User::unauthenticated();
        persistence.shutdown();
        assert!(!persistence.is_started());
        assert!(persistence
            .run_transaction("after", TransactionMode::ReadOnly, &user, |_| Ok(()))
            .is_err());
        persistence.start().unwrap();
        assert!(persistence
            .run_transaction("after", TransactionMode::ReadOnly, &user, |_| Ok(()))
            .is_ok());
    }
}
