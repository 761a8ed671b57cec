//! Query model, views and the components that turn local and remote state
//! into snapshots for listeners.

mod event_manager;
mod firestore_client;
mod online_state;
mod query;
mod sync_engine;
mod target;
mod target_id_generator;
mod view;
pub(crate) mod view_snapshot;

pub use event_manager::{
    EventManager, ListenOptions, QueryListenHandler, QueryListener, SnapshotObserver, SyncEngineListener,
};
pub use firestore_client::{FirestoreClient, FirestoreClientBuilder, ListenerRegistration};
pub use online_state::OnlineState;
pub use query::{
    Bound, CompositeFilter, CompositeOperator, Direction, DocumentComparator, FieldFilter, Filter, LimitType, Operator,
    OrderBy, Query,
};
pub use sync_engine::SyncEngine;
pub use target::Target;
pub use target_id_generator::TargetIdGenerator;
pub use view::{LimboDocumentChange, SyncState, View, ViewChange, ViewDocumentChanges};
pub use view_snapshot::{ChangeType, DocumentChangeSet, DocumentViewChange, ViewSnapshot};
