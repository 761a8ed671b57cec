use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;

use super::{decode_message, encode_message};
use crate::error::{FirestoreError, FirestoreResult};
use crate::model::{Mutation, MutationResult, SnapshotVersion};
use crate::remote::datastore::{StreamKind, StreamingDatastore};
use crate::remote::serializer::JsonProtoSerializer;
use crate::remote::stream::{PersistentStream, PersistentStreamListener, StreamState};
use crate::settings::StreamSettings;
use crate::util::{lock, AsyncQueue};

/// Callbacks of the Write stream, run on the async queue.
#[async_trait]
pub trait WriteStreamListener: Send + Sync + 'static {
    async fn on_write_stream_open(&self);

    /// The handshake response arrived; writes may now be sent.
    async fn on_write_handshake_complete(&self);

    /// Results for the oldest unacknowledged request.
    async fn on_mutation_result(&self, commit_version: SnapshotVersion, results: Vec<MutationResult>);

    async fn on_write_stream_close(&self, error: Option<FirestoreError>);
}

#[derive(Default)]
struct WriteStreamState {
    handshake_complete: bool,
    /// Echoed on every request so the backend can match acknowledgements.
    last_stream_token: Vec<u8>,
}

struct WriteStreamEvents {
    serializer: JsonProtoSerializer,
    listener: Weak<dyn WriteStreamListener>,
    state: Arc<Mutex<WriteStreamState>>,
}

#[async_trait]
impl PersistentStreamListener for WriteStreamEvents {
    async fn on_open(&self) {
        lock(&self.state).handshake_complete = false;
        if let Some(listener) = self.listener.upgrade() {
            listener.on_write_stream_open().await;
        }
    }

    async fn on_message(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        let response = self.serializer.decode_write_response(&decode_message(&payload)?)?;
        let first_response = {
            let mut state = lock(&self.state);
            state.last_stream_token = response.stream_token;
            !std::mem::replace(&mut state.handshake_complete, true)
        };
        let Some(listener) = self.listener.upgrade() else {
            return Ok(());
        };
        if first_response {
            // The handshake response carries no results.
            listener.on_write_handshake_complete().await;
        } else {
            listener
                .on_mutation_result(response.commit_version, response.mutation_results)
                .await;
        }
        Ok(())
    }

    async fn on_close(&self, error: Option<FirestoreError>) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_write_stream_close(error).await;
        }
    }
}

/// The `Write` RPC.
///
/// After opening, the client sends a handshake and waits for its response
/// before sending mutations. Each response acknowledges the oldest
/// outstanding request.
pub struct WriteStream {
    stream: Arc<PersistentStream<WriteStreamEvents>>,
    serializer: JsonProtoSerializer,
    state: Arc<Mutex<WriteStreamState>>,
}

impl WriteStream {
    pub fn new(
        datastore: Arc<dyn StreamingDatastore>,
        queue: AsyncQueue,
        settings: StreamSettings,
        listener: Weak<dyn WriteStreamListener>,
    ) -> Self {
        let serializer = datastore.serializer();
        let state = Arc::new(Mutex::new(WriteStreamState::default()));
        let events = WriteStreamEvents {
            serializer: serializer.clone(),
            listener,
            state: Arc::clone(&state),
        };
        Self {
            stream: PersistentStream::new(StreamKind::Write, datastore, queue, settings, events),
            serializer,
            state,
        }
    }

    pub fn start(&self) {
        lock(&self.state).handshake_complete = false;
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

    pub fn handshake_complete(&self) -> bool {
        lock(&self.state).handshake_complete
    }

    pub fn last_stream_token(&self) -> Vec<u8> {
        lock(&self.state).last_stream_token.clone()
    }

    /// Forgets the stream token after the backend rejected the handshake.
    pub fn clear_stream_token(&self) {
        lock(&self.state).last_stream_token.clear();
    }

    pub async fn write_handshake(&self) -> FirestoreResult<()> {
        let request = self.serializer.encode_handshake();
        self.stream.send(encode_message(&request)?).await
    }

    pub async fn write_mutations(&self, mutations: &[Mutation]) -> FirestoreResult<()> {
        let request = self
            .serializer
            .encode_write_request(&self.last_stream_token(), mutations);
        self.stream.send(encode_message(&request)?).await
    }
}
