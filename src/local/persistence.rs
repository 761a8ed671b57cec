use crate::error::{internal_error, FirestoreResult};
use crate::local::document_overlay_cache::DocumentOverlayCache;
use crate::local::index_manager::IndexManager;
use crate::local::mutation_queue::MutationQueue;
use crate::local::reference_set::ReferenceSet;
use crate::local::remote_document_cache::RemoteDocumentCache;
use crate::local::target_cache::TargetCache;
use crate::local::target_data::TargetData;
use crate::model::{DocumentKey, ListenSequenceNumber, TargetId, User};
use crate::settings::GarbageCollectionMode;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    /// Read-write work that only the primary client may perform.
    ReadWritePrimary,
}

impl TransactionMode {
    pub fn is_read_only(&self) -> bool {
        matches!(self, TransactionMode::ReadOnly)
    }
}

/// A unit of work against the local caches.
///
/// Read accessors are always available; the `_mut` accessors fail in a
/// read-only transaction. Nothing written through a transaction becomes
/// visible unless the whole transaction succeeds.
pub trait PersistenceTransaction {
    fn mode(&self) -> TransactionMode;

    /// Sequence number tagging everything this transaction touches.
    fn current_sequence_number(&self) -> ListenSequenceNumber;

    /// Pending writes of the user the transaction runs for.
    fn mutation_queue(&self) -> &dyn MutationQueue;

    fn mutation_queue_mut(&mut self) -> FirestoreResult<&mut dyn MutationQueue>;

    fn document_overlay_cache(&self) -> &dyn DocumentOverlayCache;

    fn document_overlay_cache_mut(&mut self) -> FirestoreResult<&mut dyn DocumentOverlayCache>;

    fn remote_document_cache(&self) -> &dyn RemoteDocumentCache;

    fn remote_document_cache_mut(&mut self) -> FirestoreResult<&mut dyn RemoteDocumentCache>;

    fn target_cache(&self) -> &dyn TargetCache;

    fn target_cache_mut(&mut self) -> FirestoreResult<&mut dyn TargetCache>;

    fn index_manager(&self) -> &dyn IndexManager;

    fn index_manager_mut(&mut self) -> FirestoreResult<&mut dyn IndexManager>;

    /// Documents pinned by live query views.
    fn local_view_references(&self) -> &ReferenceSet;

    fn local_view_references_mut(&mut self) -> FirestoreResult<&mut ReferenceSet>;

    /// A target started referencing `key`.
    fn add_reference(&mut self, target_id: TargetId, key: &DocumentKey);

    /// A target stopped referencing `key`; it may now be collectable.
    fn remove_reference(&mut self, target_id: TargetId, key: &DocumentKey);

    fn mark_potentially_orphaned(&mut self, key: &DocumentKey);

    /// Releases a target. Depending on the garbage-collection mode the target
    /// is dropped with its keys or merely stamped with the current sequence
    /// number.
    fn remove_target(&mut self, target_data: &TargetData) -> FirestoreResult<()>;

    /// A limbo resolution touched `key`; keep it only while referenced.
    fn update_limbo_document(&mut self, key: &DocumentKey);

    /// Whether any target, pending write, or live view still needs `key`.
    fn is_referenced(&self, key: &DocumentKey) -> bool;
}

/// Storage backend for the local caches.
///
/// A backend runs closures as atomic transactions; the in-memory backend is
/// [`MemoryPersistence`](crate::local::MemoryPersistence).
pub trait Persistence: Send + Sync {
    fn start(&self) -> FirestoreResult<()>;

    fn shutdown(&self);

    fn is_started(&self) -> bool;

    fn garbage_collection_mode(&self) -> GarbageCollectionMode;

    /// Runs `work` inside a transaction scoped to `user`'s mutation queue and
    /// overlays. Errors roll the transaction back.
    fn run_transaction_dyn(
        &self,
        label: &str,
        mode: TransactionMode,
        user: &User,
        work: &mut dyn FnMut(&mut dyn PersistenceTransaction) -> FirestoreResult<()>,
    ) -> FirestoreResult<()>;
}

/// Typed wrapper over [`Persistence::run_transaction_dyn`].
pub trait PersistenceExt: Persistence {
    fn run_transaction<T, F>(&self, label: &str, mode: TransactionMode, user: &User, work: F) -> FirestoreResult<T>
    where
        F: FnOnce(&mut dyn PersistenceTransaction) -> FirestoreResult<T>,
    {
        let mut work = Some(work);
        let mut output = None;
        self.run_transaction_dyn(label, mode, user, &mut |txn| {
            let work = work
                .take()
                .ok_or_else(|| internal_error("Transaction body invoked more than once"))?;
            output = Some(work(txn)?);
            Ok(())
        })?;
        output.ok_or_else(|| internal_error(format!("Transaction '{label}' produced no result")))
    }
}

impl<P: Persistence + ?Sized> PersistenceExt for P {}
