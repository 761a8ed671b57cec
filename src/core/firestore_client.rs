use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::core::event_manager::{EventManager, ListenOptions, QueryListener, SyncEngineListener};
use crate::core::sync_engine::SyncEngine;
use crate::core::view::View;
use crate::core::{OnlineState, Query, ViewSnapshot};
use crate::error::{cancelled, unavailable, FirestoreResult};
use crate::local::{LocalStore, MemoryPersistence, Persistence};
use crate::model::{DatabaseId, Document, DocumentKey, FieldIndex, Mutation, User};
use crate::remote::{RemoteStore, StreamingDatastore};
use crate::settings::FirestoreSettings;
use crate::util::AsyncQueue;

/// Configures and creates a [`FirestoreClient`].
pub struct FirestoreClientBuilder {
    database_id: DatabaseId,
    datastore: Arc<dyn StreamingDatastore>,
    user: User,
    settings: FirestoreSettings,
    persistence: Option<Arc<dyn Persistence>>,
}

impl FirestoreClientBuilder {
    /// The user whose pending writes are active at start-up.
    pub fn with_user(mut self, user: User) -> Self {
        self.user = user;
        self
    }

    pub fn with_settings(mut self, settings: FirestoreSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replaces the default in-memory persistence.
    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Wires the components together and schedules start-up on the client's
    /// queue. Operations issued afterwards run once start-up has finished.
    pub fn build(self) -> FirestoreClient {
        let settings = self.settings;
        let queue = AsyncQueue::with_retry_backoff(&settings.retry_backoff);
        let persistence = self
            .persistence
            .unwrap_or_else(|| Arc::new(MemoryPersistence::new(settings.garbage_collection)) as Arc<dyn Persistence>);
        let local_store = Arc::new(LocalStore::new(
            Arc::clone(&persistence),
            self.user,
            settings.index_auto_creation.clone(),
        ));
        let remote_store = RemoteStore::new(
            Arc::clone(&local_store),
            self.datastore,
            queue.clone(),
            &settings,
        );
        let sync_engine = SyncEngine::new(
            Arc::clone(&local_store),
            Arc::clone(&remote_store),
            settings.max_concurrent_limbo_resolutions,
        );
        let event_manager = Arc::new(EventManager::new(sync_engine.clone()));
        let listener: Arc<dyn SyncEngineListener> = event_manager.clone();
        sync_engine.set_listener(Arc::downgrade(&listener));

        let startup_persistence = Arc::clone(&persistence);
        let startup_remote_store = Arc::clone(&remote_store);
        queue.enqueue_and_forget(move || async move {
            if let Err(err) = startup_persistence.start() {
                log::error!("failed to start persistence: {err}");
                return;
            }
            startup_remote_store.start().await;
        });
        log::debug!("FirestoreClient created for {}", self.database_id.database_name());

        FirestoreClient {
            database_id: self.database_id,
            settings,
            queue,
            persistence,
            local_store,
            remote_store,
            sync_engine,
            event_manager,
        }
    }
}

/// The client context: owns the async queue and every component of the
/// engine. Public operations are scheduled on the queue and resolve with
/// their result.
pub struct FirestoreClient {
    database_id: DatabaseId,
    settings: FirestoreSettings,
    queue: AsyncQueue,
    persistence: Arc<dyn Persistence>,
    local_store: Arc<LocalStore>,
    remote_store: Arc<RemoteStore>,
    sync_engine: Arc<SyncEngine>,
    event_manager: Arc<EventManager>,
}

impl fmt::Debug for FirestoreClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirestoreClient")
            .field("database_id", &self.database_id)
            .field("queue", &self.queue)
            .finish()
    }
}

impl FirestoreClient {
    pub fn builder(database_id: DatabaseId, datastore: Arc<dyn StreamingDatastore>) -> FirestoreClientBuilder {
        FirestoreClientBuilder {
            database_id,
            datastore,
            user: User::unauthenticated(),
            settings: FirestoreSettings::default(),
            persistence: None,
        }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn settings(&self) -> &FirestoreSettings {
        &self.settings
    }

    pub fn async_queue(&self) -> &AsyncQueue {
        &self.queue
    }

    pub fn sync_engine(&self) -> &Arc<SyncEngine> {
        &self.sync_engine
    }

    pub fn online_state(&self) -> OnlineState {
        self.event_manager.online_state()
    }

    pub fn is_terminated(&self) -> bool {
        self.queue.is_shutting_down()
    }

    /// Subscribes `observer` to `query`. The observer is called on the
    /// client's queue with every snapshot, or once with an error after which
    /// the listener is dropped.
    pub async fn listen<F>(
        &self,
        query: Query,
        options: ListenOptions,
        observer: F,
    ) -> FirestoreResult<ListenerRegistration>
    where
        F: Fn(FirestoreResult<ViewSnapshot>) + Send + Sync + 'static,
    {
        let listener = QueryListener::new(query, options, observer);
        let event_manager = Arc::clone(&self.event_manager);
        let registered = Arc::clone(&listener);
        self.queue
            .enqueue(move || async move { event_manager.listen(registered).await })
            .await?;
        Ok(ListenerRegistration {
            queue: self.queue.clone(),
            event_manager: Arc::clone(&self.event_manager),
            listener,
        })
    }

    /// Applies `mutations` as one atomic batch. The batch is queued when
    /// this is called; listeners see the change right away and the returned
    /// future resolves when the backend accepts the batch or fails if it is
    /// rejected.
    pub fn write(&self, mutations: Vec<Mutation>) -> impl Future<Output = FirestoreResult<()>> + Send + 'static {
        let sync_engine = Arc::clone(&self.sync_engine);
        let completion = self
            .queue
            .enqueue(move || async move { sync_engine.write(mutations).await });
        async move {
            completion
                .await?
                .await
                .map_err(|_| cancelled("the write was abandoned before the backend answered"))?
        }
    }

    /// Local view of one document, including pending writes. `None` when
    /// the cache knows the document does not exist.
    pub async fn get_document_from_local_cache(&self, key: DocumentKey) -> FirestoreResult<Option<Document>> {
        let local_store = Arc::clone(&self.local_store);
        let document = self
            .queue
            .enqueue(move || async move { local_store.read_document(&key) })
            .await?;
        if document.is_found_document() {
            Ok(Some(document))
        } else if document.is_no_document() {
            Ok(None)
        } else {
            Err(unavailable(format!(
                "Failed to get document {} from cache. (However, this document may exist on the server.)",
                document.key()
            )))
        }
    }

    /// Runs `query` against the local cache only.
    pub async fn get_documents_from_local_cache(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let local_store = Arc::clone(&self.local_store);
        self.queue
            .enqueue(move || async move {
                let result = local_store.execute_query(&query, true)?;
                let mut view = View::new(query, result.remote_keys.clone());
                let changes = view.compute_doc_changes(&result.documents, None);
                let view_change = view.apply_changes(changes, false, None, false);
                Ok(view_change
                    .snapshot
                    .unwrap_or_else(|| view.compute_initial_snapshot()))
            })
            .await
    }

    /// Resolves once every write issued before the call is acknowledged.
    /// Fails if one of those writes is rejected or the user changes.
    pub fn wait_for_pending_writes(&self) -> impl Future<Output = FirestoreResult<()>> + Send + 'static {
        let sync_engine = Arc::clone(&self.sync_engine);
        let waiter = self
            .queue
            .enqueue(move || async move { sync_engine.register_pending_writes_callback() });
        async move {
            waiter
                .await?
                .await
                .map_err(|_| cancelled("'wait_for_pending_writes' was abandoned"))?
        }
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        let remote_store = Arc::clone(&self.remote_store);
        self.queue
            .enqueue(move || async move {
                remote_store.enable_network().await;
                Ok(())
            })
            .await
    }

    /// Stops both streams; listeners receive cached results until the
    /// network is enabled again.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        let remote_store = Arc::clone(&self.remote_store);
        self.queue
            .enqueue(move || async move {
                remote_store.disable_network().await;
                Ok(())
            })
            .await
    }

    /// Switches to `user`, restarting the streams with fresh credentials.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        let remote_store = Arc::clone(&self.remote_store);
        self.queue
            .enqueue(move || async move { remote_store.handle_credential_change(user).await })
            .await
    }

    /// `observer` is called whenever all active listeners have seen a
    /// consistent set of snapshots, and once right away.
    pub async fn add_snapshots_in_sync_listener<F>(&self, observer: F) -> FirestoreResult<u64>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let event_manager = Arc::clone(&self.event_manager);
        self.queue
            .enqueue(move || async move { Ok(event_manager.add_snapshots_in_sync_listener(observer)) })
            .await
    }

    pub async fn remove_snapshots_in_sync_listener(&self, id: u64) -> FirestoreResult<()> {
        let event_manager = Arc::clone(&self.event_manager);
        self.queue
            .enqueue(move || async move {
                event_manager.remove_snapshots_in_sync_listener(id);
                Ok(())
            })
            .await
    }

    pub async fn configure_field_indexes(&self, indexes: Vec<FieldIndex>) -> FirestoreResult<()> {
        let local_store = Arc::clone(&self.local_store);
        self.queue
            .enqueue(move || async move { local_store.configure_field_indexes(indexes) })
            .await
    }

    pub async fn delete_all_field_indexes(&self) -> FirestoreResult<()> {
        let local_store = Arc::clone(&self.local_store);
        self.queue
            .enqueue(move || async move { local_store.delete_all_field_indexes() })
            .await
    }

    pub async fn set_index_auto_creation_enabled(&self, enabled: bool) -> FirestoreResult<()> {
        let local_store = Arc::clone(&self.local_store);
        self.queue
            .enqueue(move || async move {
                local_store.set_index_auto_creation_enabled(enabled);
                Ok(())
            })
            .await
    }

    /// Sweeps documents no target, view or pending write refers to.
    pub async fn collect_garbage(&self) -> FirestoreResult<usize> {
        let local_store = Arc::clone(&self.local_store);
        self.queue
            .enqueue(move || async move { local_store.collect_garbage() })
            .await
    }

    /// Shuts the client down: streams are closed, persistence is released
    /// and every later operation fails. Calling it again is a no-op.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        let remote_store = Arc::clone(&self.remote_store);
        let persistence = Arc::clone(&self.persistence);
        self.queue
            .enqueue_and_initiate_shutdown(move || async move {
                remote_store.shutdown().await;
                persistence.shutdown();
                log::debug!("FirestoreClient terminated");
            })
            .await
    }
}

/// Handle returned by [`FirestoreClient::listen`].
pub struct ListenerRegistration {
    queue: AsyncQueue,
    event_manager: Arc<EventManager>,
    listener: Arc<QueryListener>,
}

impl fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("listener", &self.listener)
            .finish()
    }
}

impl ListenerRegistration {
    pub fn query(&self) -> &Query {
        self.listener.query()
    }

    /// Detaches the listener. The query's target is released once its last
    /// listener is gone.
    pub fn remove(self) {
        let event_manager = self.event_manager;
        let listener = self.listener;
        self.queue.enqueue_and_forget(move || async move {
            if let Err(err) = event_manager.unlisten(&listener).await {
                log::debug!("failed to remove listener: {err}");
            }
        });
    }
}
