use std::sync::{Arc, Weak};

use async_trait::async_trait;

use super::{decode_message, encode_message};
use crate::error::{FirestoreError, FirestoreResult};
use crate::local::TargetData;
use crate::model::{SnapshotVersion, TargetId};
use crate::remote::datastore::{StreamKind, StreamingDatastore};
use crate::remote::serializer::JsonProtoSerializer;
use crate::remote::stream::{PersistentStream, PersistentStreamListener, StreamState};
use crate::remote::watch_change::{decode_watch_change, version_from_listen_response, WatchChange};
use crate::settings::StreamSettings;
use crate::util::AsyncQueue;

/// Callbacks of the Listen stream, run on the async queue.
#[async_trait]
pub trait WatchStreamListener: Send + Sync + 'static {
    async fn on_watch_stream_open(&self);

    async fn on_watch_stream_change(&self, change: WatchChange, snapshot_version: SnapshotVersion);

    async fn on_watch_stream_close(&self, error: Option<FirestoreError>);
}

struct WatchStreamEvents {
    serializer: JsonProtoSerializer,
    listener: Weak<dyn WatchStreamListener>,
}

#[async_trait]
impl PersistentStreamListener for WatchStreamEvents {
    async fn on_open(&self) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_watch_stream_open().await;
        }
    }

    async fn on_message(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        let response = decode_message(&payload)?;
        let Some(change) = decode_watch_change(&self.serializer, &response)? else {
            log::debug!("ignoring listen response without a change: {response}");
            return Ok(());
        };
        let snapshot_version = version_from_listen_response(&self.serializer, &response)?;
        if let Some(listener) = self.listener.upgrade() {
            listener.on_watch_stream_change(change, snapshot_version).await;
        }
        Ok(())
    }

    async fn on_close(&self, error: Option<FirestoreError>) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_watch_stream_close(error).await;
        }
    }
}

/// The `Listen` RPC: adds and removes targets, receives watch changes.
pub struct WatchStream {
    stream: Arc<PersistentStream<WatchStreamEvents>>,
    serializer: JsonProtoSerializer,
}

impl WatchStream {
    pub fn new(
        datastore: Arc<dyn StreamingDatastore>,
        queue: AsyncQueue,
        settings: StreamSettings,
        listener: Weak<dyn WatchStreamListener>,
    ) -> Self {
        let serializer = datastore.serializer();
        let events = WatchStreamEvents {
            serializer: serializer.clone(),
            listener,
        };
        Self {
            stream: PersistentStream::new(StreamKind::Listen, datastore, queue, settings, events),
            serializer,
        }
    }

    pub fn start(&self) {
        self.stream.start();
    }

    pub async fn stop(&self) {
        self.stream.stop().await;
    }

    pub fn state(&self) -> StreamState {
        self.stream.state()
    }

    pub fn is_started(&self) -> bool {
        self.stream.is_started()
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    pub fn mark_idle(&self) {
        self.stream.mark_idle();
    }

    pub fn inhibit_backoff(&self) {
        self.stream.inhibit_backoff();
    }

    /// Registers a target with the backend.
    pub async fn watch(&self, target_data: &TargetData) -> FirestoreResult<()> {
        let request = self.serializer.encode_listen_request(target_data);
        log::debug!("watching target {}", target_data.target_id);
        self.stream.send(encode_message(&request)?).await
    }

    pub async fn unwatch(&self, target_id: TargetId) -> FirestoreResult<()> {
        let request = self.serializer.encode_unlisten_request(target_id);
        log::debug!("unwatching target {target_id}");
        self.stream.send(encode_message(&request)?).await
    }
}
