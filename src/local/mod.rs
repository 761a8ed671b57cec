//! Local caches and the store that keeps them consistent.

pub mod document_overlay_cache;
pub mod index_manager;
pub mod local_documents_view;
mod local_store;
mod memory_persistence;
pub mod mutation_queue;
mod persistence;
mod query_engine;
mod reference_set;
pub mod remote_document_cache;
pub mod target_cache;
mod target_data;

pub use document_overlay_cache::{DocumentOverlayCache, MemoryDocumentOverlayCache};
pub use index_manager::{IndexManager, IndexType, MemoryIndexManager};
pub use local_documents_view::DocumentMap;
pub use local_store::{LocalStore, LocalViewChanges, LocalWriteResult, QueryResult, UserChangeResult};
pub use memory_persistence::MemoryPersistence;
pub use mutation_queue::{MemoryMutationQueue, MutationQueue};
pub use persistence::{Persistence, PersistenceExt, PersistenceTransaction, TransactionMode};
pub use query_engine::{QueryContext, QueryEngine};
pub use reference_set::ReferenceSet;
pub use remote_document_cache::{MemoryRemoteDocumentCache, RemoteDocumentCache, RemoteDocumentChangeBuffer};
pub use target_cache::{MemoryTargetCache, TargetCache};
pub use target_data::{TargetData, TargetPurpose};
