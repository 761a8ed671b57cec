use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::core::OnlineState;
use crate::error::{FirestoreError, FirestoreResult};
use crate::local::{LocalStore, TargetData};
use crate::model::{DocumentKey, MutationBatch, MutationBatchResult, MutationResult, SnapshotVersion, TargetId, User};
use crate::remote::datastore::StreamingDatastore;
use crate::remote::online_state_tracker::{OnlineStateHandler, OnlineStateTracker};
use crate::remote::remote_syncer::RemoteSyncer;
use crate::remote::streams::{WatchStream, WatchStreamListener, WriteStream, WriteStreamListener};
use crate::remote::watch_change::{WatchChange, WatchTargetChange, WatchTargetChangeState};
use crate::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::settings::FirestoreSettings;
use crate::util::{lock, AsyncQueue};

/// Reasons the network is currently off. The network is used only while
/// the set is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum OfflineCause {
    UserDisabled,
    /// Local storage failed; the network stays off until it recovers.
    IoFailure,
    CredentialChange,
    Shutdown,
}

struct RemoteStoreState {
    /// Targets the backend should be watching, by id.
    listen_targets: BTreeMap<TargetId, TargetData>,
    /// Batches sent (or about to be sent) on the write stream, oldest first.
    write_pipeline: VecDeque<MutationBatch>,
    /// Present while a watch stream is running.
    watch_change_aggregator: Option<WatchChangeAggregator>,
    offline_causes: BTreeSet<OfflineCause>,
}

struct ListenTargetMetadata<'a> {
    listen_targets: &'a BTreeMap<TargetId, TargetData>,
    syncer: Option<&'a Arc<dyn RemoteSyncer>>,
}

impl TargetMetadataProvider for ListenTargetMetadata<'_> {
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.syncer
            .map(|syncer| syncer.get_remote_keys_for_target(target_id))
            .unwrap_or_default()
    }

    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.listen_targets.get(&target_id).cloned()
    }
}

/// Owns the Listen and Write streams and keeps them in step with the local
/// store: active targets are (re)watched whenever the watch stream opens,
/// and pending mutation batches are pipelined onto the write stream.
///
/// Every method runs on the async queue.
pub struct RemoteStore {
    local_store: Arc<LocalStore>,
    datastore: Arc<dyn StreamingDatastore>,
    queue: AsyncQueue,
    max_pending_writes: usize,
    watch_stream: WatchStream,
    write_stream: WriteStream,
    online_state_tracker: Arc<OnlineStateTracker>,
    syncer: OnceLock<Weak<dyn RemoteSyncer>>,
    state: Mutex<RemoteStoreState>,
    this: Weak<Self>,
}

impl RemoteStore {
    pub fn new(
        local_store: Arc<LocalStore>,
        datastore: Arc<dyn StreamingDatastore>,
        queue: AsyncQueue,
        settings: &FirestoreSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let watch_listener: Weak<dyn WatchStreamListener> = this.clone();
            let write_listener: Weak<dyn WriteStreamListener> = this.clone();
            let store = this.clone();
            let handler: OnlineStateHandler = Arc::new(move |online_state| {
                if let Some(syncer) = store.upgrade().and_then(|store| store.syncer()) {
                    syncer.apply_online_state_change(online_state);
                }
            });

            Self {
                watch_stream: WatchStream::new(
                    Arc::clone(&datastore),
                    queue.clone(),
                    settings.stream.clone(),
                    watch_listener,
                ),
                write_stream: WriteStream::new(
                    Arc::clone(&datastore),
                    queue.clone(),
                    settings.stream.clone(),
                    write_listener,
                ),
                online_state_tracker: OnlineStateTracker::new(queue.clone(), settings.online_state_timeout, handler),
                local_store,
                datastore,
                queue,
                max_pending_writes: settings.max_pending_writes,
                syncer: OnceLock::new(),
                state: Mutex::new(RemoteStoreState {
                    listen_targets: BTreeMap::new(),
                    write_pipeline: VecDeque::new(),
                    watch_change_aggregator: None,
                    offline_causes: BTreeSet::new(),
                }),
                this: this.clone(),
            }
        })
    }

    /// Connects the component that consumes remote results. Set once.
    pub fn set_syncer(&self, syncer: Weak<dyn RemoteSyncer>) {
        if self.syncer.set(syncer).is_err() {
            log::warn!("remote syncer already set");
        }
    }

    fn syncer(&self) -> Option<Arc<dyn RemoteSyncer>> {
        self.syncer.get().and_then(Weak::upgrade)
    }

    fn state(&self) -> MutexGuard<'_, RemoteStoreState> {
        lock(&self.state)
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state_tracker.state()
    }

    pub fn watch_stream(&self) -> &WatchStream {
        &self.watch_stream
    }

    pub fn write_stream(&self) -> &WriteStream {
        &self.write_stream
    }

    pub fn can_use_network(&self) -> bool {
        self.state().offline_causes.is_empty()
    }

    pub fn write_pipeline_len(&self) -> usize {
        self.state().write_pipeline.len()
    }

    pub async fn start(&self) {
        self.enable_network().await;
    }

    pub async fn enable_network(&self) {
        self.state().offline_causes.remove(&OfflineCause::UserDisabled);
        self.enable_network_internal().await;
    }

    async fn enable_network_internal(&self) {
        if !self.can_use_network() {
            return;
        }
        self.watch_stream.inhibit_backoff();
        if self.should_start_watch_stream() {
            self.start_watch_stream();
        } else {
            self.online_state_tracker.set(OnlineState::Unknown);
        }

        self.write_stream.inhibit_backoff();
        self.fill_write_pipeline().await;
    }

    /// Stops both streams and reports `Offline` until re-enabled.
    pub async fn disable_network(&self) {
        self.state().offline_causes.insert(OfflineCause::UserDisabled);
        self.disable_network_internal().await;
        // Reported explicitly so cached snapshots are raised right away.
        self.online_state_tracker.set(OnlineState::Offline);
    }

    async fn disable_network_internal(&self) {
        self.write_stream.stop().await;
        {
            let mut state = self.state();
            if !state.write_pipeline.is_empty() {
                log::debug!(
                    "Stopping write stream with {} pending writes",
                    state.write_pipeline.len()
                );
                state.write_pipeline.clear();
            }
        }
        self.watch_stream.stop().await;
        self.clean_up_watch_stream_state();
    }

    pub async fn shutdown(&self) {
        log::debug!("RemoteStore shutting down");
        self.state().offline_causes.insert(OfflineCause::Shutdown);
        self.disable_network_internal().await;
        self.datastore.terminate();
        // Not offline, just gone; listeners should not flip to cached results.
        self.online_state_tracker.set(OnlineState::Unknown);
    }

    /// Starts watching `target_data` unless it is already being watched.
    pub async fn listen(&self, target_data: TargetData) {
        let start_stream = {
            let mut state = self.state();
            if state.listen_targets.contains_key(&target_data.target_id) {
                return;
            }
            state
                .listen_targets
                .insert(target_data.target_id, target_data.clone());
            self.should_start_watch_stream_locked(&state)
        };

        if start_stream {
            self.start_watch_stream();
        } else if self.watch_stream.is_open() {
            self.send_watch_request(target_data).await;
        }
    }

    pub async fn unlisten(&self, target_id: TargetId) {
        let now_empty = {
            let mut state = self.state();
            if state.listen_targets.remove(&target_id).is_none() {
                log::debug!("unlisten of unknown target {target_id}");
                return;
            }
            state.listen_targets.is_empty()
        };

        if self.watch_stream.is_open() {
            self.send_unwatch_request(target_id).await;
        }
        if now_empty {
            if self.watch_stream.is_open() {
                self.watch_stream.mark_idle();
            } else if self.can_use_network() {
                // No targets, no stream: connectivity is unknowable.
                self.online_state_tracker.set(OnlineState::Unknown);
            }
        }
    }

    async fn send_watch_request(&self, target_data: TargetData) {
        let target_id = target_data.target_id;
        if let Some(aggregator) = self.state().watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }

        let resuming = !target_data.resume_token.is_empty() || target_data.snapshot_version > SnapshotVersion::min();
        let target_data = match self.syncer() {
            Some(syncer) if resuming => {
                let expected_count = syncer.get_remote_keys_for_target(target_id).len() as i32;
                target_data.with_expected_count(expected_count)
            }
            _ => target_data,
        };

        if let Err(err) = self.watch_stream.watch(&target_data).await {
            log::debug!("failed to send watch request for target {target_id}: {err}");
        }
    }

    async fn send_unwatch_request(&self, target_id: TargetId) {
        if let Some(aggregator) = self.state().watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        if let Err(err) = self.watch_stream.unwatch(target_id).await {
            log::debug!("failed to send unwatch request for target {target_id}: {err}");
        }
    }

    fn start_watch_stream(&self) {
        self.state().watch_change_aggregator = Some(WatchChangeAggregator::new(self.datastore.database_id().clone()));
        self.watch_stream.start();
        self.online_state_tracker.handle_watch_stream_start();
    }

    fn should_start_watch_stream(&self) -> bool {
        let state = self.state();
        self.should_start_watch_stream_locked(&state)
    }

    fn should_start_watch_stream_locked(&self, state: &RemoteStoreState) -> bool {
        state.offline_causes.is_empty() && !self.watch_stream.is_started() && !state.listen_targets.is_empty()
    }

    fn clean_up_watch_stream_state(&self) {
        self.state().watch_change_aggregator = None;
    }

    /// Removes targets the backend rejected and tells the syncer.
    async fn handle_target_error(&self, change: &WatchTargetChange, cause: &FirestoreError) -> FirestoreResult<()> {
        let syncer = self.syncer();
        for target_id in &change.target_ids {
            let removed = {
                let mut state = self.state();
                let removed = state.listen_targets.remove(target_id).is_some();
                if removed {
                    if let Some(aggregator) = state.watch_change_aggregator.as_mut() {
                        aggregator.remove_target(*target_id);
                    }
                }
                removed
            };
            if let (true, Some(syncer)) = (removed, &syncer) {
                syncer.reject_listen(*target_id, cause.clone()).await?;
            }
        }
        Ok(())
    }

    /// Builds a remote event at `snapshot_version`, schedules re-queries for
    /// targets whose results were discarded and hands the event on.
    async fn raise_watcher_event(&self, snapshot_version: SnapshotVersion) -> FirestoreResult<()> {
        let syncer = self.syncer();
        let (event, requeries) = {
            let mut state = self.state();
            let RemoteStoreState {
                listen_targets,
                watch_change_aggregator,
                ..
            } = &mut *state;
            let Some(aggregator) = watch_change_aggregator.as_mut() else {
                return Ok(());
            };
            let provider = ListenTargetMetadata {
                listen_targets,
                syncer: syncer.as_ref(),
            };
            let event = aggregator.create_remote_event(&provider, snapshot_version);

            for (target_id, change) in &event.target_changes {
                if change.resume_token.is_empty() {
                    continue;
                }
                if let Some(target_data) = listen_targets.get_mut(target_id) {
                    *target_data = target_data.with_resume_token(change.resume_token.clone(), snapshot_version);
                }
            }

            let mut requeries = Vec::new();
            for (target_id, purpose) in &event.target_mismatches {
                let Some(target_data) = listen_targets.get_mut(target_id) else {
                    continue;
                };
                // Resume tokens would make the backend skip the documents we dropped.
                *target_data = target_data.with_resume_token(Vec::new(), target_data.snapshot_version);
                requeries.push(TargetData::new(
                    target_data.target.clone(),
                    *target_id,
                    *purpose,
                    target_data.sequence_number,
                ));
            }
            (event, requeries)
        };

        for request in requeries {
            self.send_unwatch_request(request.target_id).await;
            self.send_watch_request(request).await;
        }

        if let Some(syncer) = syncer {
            syncer.apply_remote_event(event).await?;
        }
        Ok(())
    }

    /// Sends as many pending batches as the pipeline allows and opens the
    /// write stream if needed.
    pub async fn fill_write_pipeline(&self) {
        let mut last_batch_id = self.state().write_pipeline.back().map(|batch| batch.batch_id);
        while self.can_add_to_write_pipeline() {
            match self.local_store.next_mutation_batch(last_batch_id) {
                Ok(Some(batch)) => {
                    last_batch_id = Some(batch.batch_id);
                    self.add_to_write_pipeline(batch).await;
                }
                Ok(None) => {
                    if self.state().write_pipeline.is_empty() {
                        self.write_stream.mark_idle();
                    }
                    break;
                }
                Err(err) => {
                    self.disable_network_until_recovery(err).await;
                    break;
                }
            }
        }

        if self.should_start_write_stream() {
            self.write_stream.start();
        }
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        let state = self.state();
        state.offline_causes.is_empty() && state.write_pipeline.len() < self.max_pending_writes
    }

    async fn add_to_write_pipeline(&self, batch: MutationBatch) {
        self.state().write_pipeline.push_back(batch.clone());
        if self.write_stream.is_open() && self.write_stream.handshake_complete() {
            if let Err(err) = self.write_stream.write_mutations(&batch.mutations).await {
                log::debug!("failed to send batch {}: {err}", batch.batch_id);
            }
        }
    }

    fn should_start_write_stream(&self) -> bool {
        let state = self.state();
        state.offline_causes.is_empty() && !self.write_stream.is_started() && !state.write_pipeline.is_empty()
    }

    fn handle_handshake_error(&self, error: &FirestoreError) {
        // Transient failures keep the token so the stream can resume.
        if error.code.is_permanent() {
            log::debug!("RemoteStore error before completed handshake; resetting stream token: {error}");
            self.write_stream.clear_stream_token();
        }
    }

    async fn handle_write_error(&self, error: &FirestoreError) {
        if !error.code.is_permanent_write_error() {
            return;
        }
        let Some(batch) = self.state().write_pipeline.pop_front() else {
            return;
        };
        // The failure was the batch's fault, not the connection's.
        self.write_stream.inhibit_backoff();
        if let Some(syncer) = self.syncer() {
            if let Err(err) = syncer.reject_failed_write(batch.batch_id, error.clone()).await {
                self.disable_network_until_recovery(err).await;
            }
        }
        self.fill_write_pipeline().await;
    }

    /// Switches the signed-in user: streams are restarted with the new
    /// credentials after the syncer has swapped its local state.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        log::debug!("RemoteStore received new credentials");
        let uses_network = self.can_use_network();
        self.state().offline_causes.insert(OfflineCause::CredentialChange);
        self.disable_network_internal().await;
        if uses_network {
            self.online_state_tracker.set(OnlineState::Unknown);
        }

        let result = match self.syncer() {
            Some(syncer) => syncer.handle_credential_change(user).await,
            None => Ok(()),
        };

        self.state().offline_causes.remove(&OfflineCause::CredentialChange);
        self.enable_network_internal().await;
        result
    }

    /// Takes the client offline after a storage failure and keeps retrying
    /// until storage works again. Other errors are logged.
    pub async fn disable_network_until_recovery(&self, error: FirestoreError) {
        if !error.is_storage_transaction_error() {
            log::error!("unexpected local failure in the remote store: {error}");
            return;
        }
        log::debug!("Recording storage failure, disabling network until recovery: {error}");
        self.state().offline_causes.insert(OfflineCause::IoFailure);
        self.disable_network_internal().await;
        self.online_state_tracker.set(OnlineState::Offline);

        let this = self.this.clone();
        self.queue.enqueue_retryable(move || recover_network(this.clone()));
    }
}

/// Probes storage and re-enables the network once it works.
fn recover_network(this: Weak<RemoteStore>) -> BoxFuture<'static, FirestoreResult<()>> {
    async move {
        let Some(store) = this.upgrade() else {
            return Ok(());
        };
        log::debug!("Retrying storage access before re-enabling the network");
        store.local_store.persistence().start()?;
        store.local_store.last_remote_snapshot_version()?;
        store.state().offline_causes.remove(&OfflineCause::IoFailure);
        store.enable_network_internal().await;
        Ok(())
    }
    .boxed()
}

#[async_trait]
impl WatchStreamListener for RemoteStore {
    async fn on_watch_stream_open(&self) {
        let targets: Vec<TargetData> = self.state().listen_targets.values().cloned().collect();
        for target_data in targets {
            self.send_watch_request(target_data).await;
        }
    }

    async fn on_watch_stream_change(&self, change: WatchChange, snapshot_version: SnapshotVersion) {
        // Any response proves the backend is reachable.
        self.online_state_tracker.set(OnlineState::Online);

        if let WatchChange::TargetChange(target_change) = &change {
            if let (WatchTargetChangeState::Remove, Some(cause)) = (target_change.state, &target_change.cause) {
                log::debug!("Watch stream rejected targets {:?}: {cause}", target_change.target_ids);
                if let Err(err) = self.handle_target_error(target_change, cause).await {
                    self.disable_network_until_recovery(err).await;
                }
                return;
            }
        }

        let syncer = self.syncer();
        {
            let mut state = self.state();
            let RemoteStoreState {
                listen_targets,
                watch_change_aggregator,
                ..
            } = &mut *state;
            let Some(aggregator) = watch_change_aggregator.as_mut() else {
                return;
            };
            let provider = ListenTargetMetadata {
                listen_targets,
                syncer: syncer.as_ref(),
            };
            match change {
                WatchChange::DocumentChange(document_change) => {
                    aggregator.handle_document_change(&provider, document_change)
                }
                WatchChange::ExistenceFilter(filter) => aggregator.handle_existence_filter(&provider, &filter),
                WatchChange::TargetChange(target_change) => {
                    aggregator.handle_target_change(&provider, &target_change)
                }
            }
        }

        if snapshot_version.is_min() {
            return;
        }
        let result = match self.local_store.last_remote_snapshot_version() {
            // Events older than what is already applied are replays.
            Ok(last) if snapshot_version >= last => self.raise_watcher_event(snapshot_version).await,
            Ok(_) => Ok(()),
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            self.disable_network_until_recovery(err).await;
        }
    }

    async fn on_watch_stream_close(&self, error: Option<FirestoreError>) {
        self.clean_up_watch_stream_state();

        if self.should_start_watch_stream() {
            self.online_state_tracker.handle_watch_stream_failure(error.as_ref());
            self.start_watch_stream();
        } else {
            // No targets to watch; connectivity is unknown.
            self.online_state_tracker.set(OnlineState::Unknown);
        }
    }
}

#[async_trait]
impl WriteStreamListener for RemoteStore {
    async fn on_write_stream_open(&self) {
        if let Err(err) = self.write_stream.write_handshake().await {
            log::debug!("failed to send write handshake: {err}");
        }
    }

    async fn on_write_handshake_complete(&self) {
        let pending: Vec<MutationBatch> = self.state().write_pipeline.iter().cloned().collect();
        for batch in pending {
            if let Err(err) = self.write_stream.write_mutations(&batch.mutations).await {
                log::debug!("failed to send batch {}: {err}", batch.batch_id);
                break;
            }
        }
    }

    async fn on_mutation_result(&self, commit_version: SnapshotVersion, results: Vec<MutationResult>) {
        let Some(batch) = self.state().write_pipeline.pop_front() else {
            log::warn!("received a write result with an empty write pipeline");
            return;
        };
        let stream_token = self.write_stream.last_stream_token();
        match MutationBatchResult::from(batch, commit_version, results, stream_token) {
            Ok(result) => {
                if let Some(syncer) = self.syncer() {
                    if let Err(err) = syncer.apply_successful_write(result).await {
                        self.disable_network_until_recovery(err).await;
                    }
                }
            }
            Err(err) => log::error!("invalid write response: {err}"),
        }
        self.fill_write_pipeline().await;
    }

    async fn on_write_stream_close(&self, error: Option<FirestoreError>) {
        if let Some(error) = &error {
            let has_pending = !self.state().write_pipeline.is_empty();
            if has_pending {
                if self.write_stream.handshake_complete() {
                    self.handle_write_error(error).await;
                } else {
                    self.handle_handshake_error(error);
                }
            }
        }

        if self.should_start_write_stream() {
            self.write_stream.start();
        }
    }
}
