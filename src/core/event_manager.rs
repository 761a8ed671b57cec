use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::core::{OnlineState, Query};
use crate::error::{FirestoreError, FirestoreResult};
use crate::util::lock;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

fn next_listener_id() -> u64 {
    NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Options controlling which snapshots a query listener receives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots for metadata-only changes (pending writes, cache state).
    pub include_metadata_changes: bool,
    /// Hold back the first cached snapshot while the client may be online.
    pub wait_for_sync_when_online: bool,
}

impl ListenOptions {
    pub fn with_metadata_changes(mut self) -> Self {
        self.include_metadata_changes = true;
        self
    }

    pub fn wait_for_sync_when_online(mut self) -> Self {
        self.wait_for_sync_when_online = true;
        self
    }
}

pub type SnapshotObserver = Arc<dyn Fn(FirestoreResult<ViewSnapshot>) + Send + Sync>;

#[derive(Default)]
struct QueryListenerState {
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

/// One user subscription to a query.
pub struct QueryListener {
    id: u64,
    query: Query,
    options: ListenOptions,
    observer: SnapshotObserver,
    state: Mutex<QueryListenerState>,
}

impl fmt::Debug for QueryListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryListener")
            .field("id", &self.id)
            .field("query", &self.query)
            .field("options", &self.options)
            .finish()
    }
}

impl QueryListener {
    pub fn new<F>(query: Query, options: ListenOptions, observer: F) -> Arc<Self>
    where
        F: Fn(FirestoreResult<ViewSnapshot>) + Send + Sync + 'static,
    {
        Arc::new(Self {
            id: next_listener_id(),
            query,
            options,
            observer: Arc::new(observer),
            state: Mutex::new(QueryListenerState::default()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Delivers `snapshot` if it is visible to this listener; returns whether
    /// an event was raised.
    pub fn on_view_snapshot(&self, snapshot: ViewSnapshot) -> bool {
        let mut snapshot = snapshot;
        if !self.options.include_metadata_changes {
            snapshot
                .doc_changes
                .retain(|change| change.change_type != ChangeType::Metadata);
            snapshot.excludes_metadata_changes = true;
        }

        let to_raise = {
            let mut state = lock(&self.state);
            let to_raise = if !state.raised_initial_event {
                if self.should_raise_initial_event(&snapshot, state.online_state) {
                    state.raised_initial_event = true;
                    Some(initial_event(&snapshot))
                } else {
                    None
                }
            } else if self.should_raise_event(state.snapshot.as_ref(), &snapshot) {
                Some(snapshot.clone())
            } else {
                None
            };
            state.snapshot = Some(snapshot);
            to_raise
        };

        match to_raise {
            Some(event) => {
                (self.observer)(Ok(event));
                true
            }
            None => false,
        }
    }

    pub fn on_error(&self, error: FirestoreError) {
        (self.observer)(Err(error));
    }

    /// Records the new online state; may release a held-back initial snapshot.
    pub fn apply_online_state_change(&self, online_state: OnlineState) -> bool {
        let to_raise = {
            let mut state = lock(&self.state);
            state.online_state = online_state;
            match &state.snapshot {
                Some(snapshot)
                    if !state.raised_initial_event && self.should_raise_initial_event(snapshot, online_state) =>
                {
                    let event = initial_event(snapshot);
                    state.raised_initial_event = true;
                    Some(event)
                }
                _ => None,
            }
        };
        match to_raise {
            Some(event) => {
                (self.observer)(Ok(event));
                true
            }
            None => false,
        }
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        !snapshot.docs.is_empty() || snapshot.has_cached_results || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, previous: Option<&ViewSnapshot>, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.doc_changes.is_empty() {
            return true;
        }
        let pending_writes_changed =
            previous.is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }
}

fn initial_event(snapshot: &ViewSnapshot) -> ViewSnapshot {
    ViewSnapshot::from_initial_documents(
        snapshot.query.clone(),
        snapshot.docs.clone(),
        snapshot.mutated_keys.clone(),
        snapshot.from_cache,
        snapshot.has_cached_results,
    )
}

/// The component that owns query targets; the event manager calls it for
/// the first listener of a query and after the last one leaves.
#[async_trait]
pub trait QueryListenHandler: Send + Sync {
    async fn listen(&self, query: Query) -> FirestoreResult<ViewSnapshot>;
    async fn unlisten(&self, query: Query) -> FirestoreResult<()>;
}

/// Receives view snapshots and query errors produced by the sync engine.
pub trait SyncEngineListener: Send + Sync {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>);
    fn on_watch_error(&self, query: &Query, error: FirestoreError);
    fn on_online_state_change(&self, online_state: OnlineState);
}

struct QueryListenersInfo {
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<Arc<QueryListener>>,
}

type SnapshotsInSyncObserver = Arc<dyn Fn() + Send + Sync>;

struct EventManagerState {
    queries: HashMap<String, QueryListenersInfo>,
    online_state: OnlineState,
    snapshots_in_sync: Vec<(u64, SnapshotsInSyncObserver)>,
}

/// Fans out view snapshots to query listeners and shares one target among
/// listeners of equal queries.
pub struct EventManager {
    handler: Arc<dyn QueryListenHandler>,
    state: Mutex<EventManagerState>,
}

impl EventManager {
    pub fn new(handler: Arc<dyn QueryListenHandler>) -> Self {
        Self {
            handler,
            state: Mutex::new(EventManagerState {
                queries: HashMap::new(),
                online_state: OnlineState::Unknown,
                snapshots_in_sync: Vec::new(),
            }),
        }
    }

    pub async fn listen(&self, listener: Arc<QueryListener>) -> FirestoreResult<()> {
        let canonical_id = listener.query().canonical_id();
        let first_listen = {
            let mut state = lock(&self.state);
            if state.queries.contains_key(&canonical_id) {
                false
            } else {
                state.queries.insert(
                    canonical_id.clone(),
                    QueryListenersInfo {
                        view_snapshot: None,
                        listeners: Vec::new(),
                    },
                );
                true
            }
        };

        if first_listen {
            match self.handler.listen(listener.query().clone()).await {
                Ok(snapshot) => {
                    let mut state = lock(&self.state);
                    if let Some(info) = state.queries.get_mut(&canonical_id) {
                        info.view_snapshot = Some(snapshot);
                    }
                }
                Err(error) => {
                    log::warn!("listen for {} failed: {error}", listener.query());
                    lock(&self.state).queries.remove(&canonical_id);
                    listener.on_error(error);
                    return Ok(());
                }
            }
        }

        let (online_state, view_snapshot) = {
            let mut state = lock(&self.state);
            let online_state = state.online_state;
            let Some(info) = state.queries.get_mut(&canonical_id) else {
                return Ok(());
            };
            info.listeners.push(Arc::clone(&listener));
            (online_state, info.view_snapshot.clone())
        };

        let mut raised = listener.apply_online_state_change(online_state);
        if let Some(snapshot) = view_snapshot {
            raised |= listener.on_view_snapshot(snapshot);
        }
        if raised {
            self.raise_snapshots_in_sync_event();
        }
        Ok(())
    }

    pub async fn unlisten(&self, listener: &QueryListener) -> FirestoreResult<()> {
        let canonical_id = listener.query().canonical_id();
        let last_listen = {
            let mut state = lock(&self.state);
            let last = match state.queries.get_mut(&canonical_id) {
                Some(info) => {
                    let before = info.listeners.len();
                    info.listeners.retain(|existing| existing.id() != listener.id());
                    before != info.listeners.len() && info.listeners.is_empty()
                }
                None => false,
            };
            if last {
                state.queries.remove(&canonical_id);
            }
            last
        };
        if last_listen {
            self.handler.unlisten(listener.query().clone()).await?;
        }
        Ok(())
    }

    pub fn add_snapshots_in_sync_listener<F>(&self, observer: F) -> u64
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = next_listener_id();
        let observer: SnapshotsInSyncObserver = Arc::new(observer);
        lock(&self.state).snapshots_in_sync.push((id, Arc::clone(&observer)));
        observer();
        id
    }

    pub fn remove_snapshots_in_sync_listener(&self, id: u64) {
        lock(&self.state).snapshots_in_sync.retain(|(existing, _)| *existing != id);
    }

    pub fn online_state(&self) -> OnlineState {
        lock(&self.state).online_state
    }

    pub fn has_listeners(&self) -> bool {
        !lock(&self.state).queries.is_empty()
    }

    fn raise_snapshots_in_sync_event(&self) {
        let observers: Vec<SnapshotsInSyncObserver> = lock(&self.state)
            .snapshots_in_sync
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            observer();
        }
    }
}

impl SyncEngineListener for EventManager {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
        let mut deliveries = Vec::new();
        {
            let mut state = lock(&self.state);
            for snapshot in snapshots {
                if let Some(info) = state.queries.get_mut(&snapshot.query.canonical_id()) {
                    deliveries.push((info.listeners.clone(), snapshot.clone()));
                    info.view_snapshot = Some(snapshot);
                }
            }
        }

        let mut raised = false;
        for (listeners, snapshot) in deliveries {
            for listener in listeners {
                raised |= listener.on_view_snapshot(snapshot.clone());
            }
        }
        if raised {
            self.raise_snapshots_in_sync_event();
        }
    }

    fn on_watch_error(&self, query: &Query, error: FirestoreError) {
        let removed = lock(&self.state).queries.remove(&query.canonical_id());
        if let Some(info) = removed {
            for listener in info.listeners {
                listener.on_error(error.clone());
            }
        }
    }

    fn on_online_state_change(&self, online_state: OnlineState) {
        let listeners: Vec<Arc<QueryListener>> = {
            let mut state = lock(&self.state);
            state.online_state = online_state;
            state
                .queries
                .values()
                .flat_map(|info| info.listeners.iter().cloned())
                .collect()
        };
        let mut raised = false;
        for listener in listeners {
            raised |= listener.apply_online_state_change(online_state);
        }
        if raised {
            self.raise_snapshots_in_sync_event();
        }
    }
}
