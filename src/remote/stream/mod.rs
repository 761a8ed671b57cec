//! Multiplexed bidirectional streams over a single frame transport.

mod persistent;
mod websocket;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;

use crate::error::{internal_error, unavailable, FirestoreError, FirestoreResult};
use crate::platform::runtime;
use crate::util::lock;

pub use persistent::{PersistentStream, PersistentStreamListener, StreamState};
pub use websocket::WebSocketTransport;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(u32);

impl StreamId {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

/// First frame of a stream: which RPC it carries and its request headers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamOpen {
    pub method: String,
    pub metadata: Vec<(String, String)>,
}

impl StreamOpen {
    pub fn new(method: impl Into<String>, metadata: Vec<(String, String)>) -> Self {
        Self {
            method: method.into(),
            metadata,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Clone, Debug)]
pub enum FrameKind {
    Open(StreamOpen),
    Data(Vec<u8>),
    Close,
    Error(FirestoreError),
}

#[derive(Clone, Debug)]
pub struct TransportFrame {
    stream_id: StreamId,
    kind: FrameKind,
}

impl TransportFrame {
    pub fn new(stream_id: StreamId, kind: FrameKind) -> Self {
        Self { stream_id, kind }
    }

    pub fn open(stream_id: StreamId, open: StreamOpen) -> Self {
        Self::new(stream_id, FrameKind::Open(open))
    }

    pub fn data(stream_id: StreamId, payload: Vec<u8>) -> Self {
        Self::new(stream_id, FrameKind::Data(payload))
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameKind::Close)
    }

    pub fn error(stream_id: StreamId, error: FirestoreError) -> Self {
        Self::new(stream_id, FrameKind::Error(error))
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn kind(&self) -> &FrameKind {
        &self.kind
    }

    pub fn into_kind(self) -> FrameKind {
        self.kind
    }
}

/// Moves frames between two endpoints.
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()>;
    async fn next(&self) -> FirestoreResult<TransportFrame>;
}

type StreamRegistry = Arc<Mutex<HashMap<StreamId, Sender<FrameKind>>>>;

/// Runs any number of logical streams over one [`StreamTransport`].
///
/// Streams are opened by one side and accepted by the other; a connection
/// should be used for one role only so stream ids do not collide.
pub struct MultiplexedConnection {
    next_stream_id: AtomicU32,
    outbound_tx: Sender<TransportFrame>,
    streams: StreamRegistry,
    incoming: Receiver<MultiplexedStream>,
}

impl MultiplexedConnection {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        let (outbound_tx, outbound_rx) = async_channel::unbounded();
        let (incoming_tx, incoming) = async_channel::unbounded();
        let streams: StreamRegistry = Arc::new(Mutex::new(HashMap::new()));

        start_outbound_loop(Arc::clone(&transport), outbound_rx);
        start_inbound_loop(transport, Arc::clone(&streams), outbound_tx.clone(), incoming_tx);

        Self {
            next_stream_id: AtomicU32::new(1),
            outbound_tx,
            streams,
            incoming,
        }
    }

    /// Opens a new stream for `open.method`.
    pub async fn open_stream(&self, open: StreamOpen) -> FirestoreResult<MultiplexedStream> {
        let stream_id = StreamId::new(self.next_stream_id.fetch_add(1, Ordering::SeqCst));
        let (inbound_tx, inbound_rx) = async_channel::unbounded();
        lock(&self.streams).insert(stream_id, inbound_tx);
        self.outbound_tx
            .send(TransportFrame::open(stream_id, open.clone()))
            .await
            .map_err(|err| unavailable(format!("failed to queue open frame: {err}")))?;
        Ok(MultiplexedStream::new(
            stream_id,
            open,
            self.outbound_tx.clone(),
            inbound_rx,
            Arc::clone(&self.streams),
        ))
    }

    /// Waits for the peer to open a stream. `None` once the transport is gone.
    pub async fn accept_stream(&self) -> Option<MultiplexedStream> {
        self.incoming.recv().await.ok()
    }

    pub fn open_stream_count(&self) -> usize {
        lock(&self.streams).len()
    }
}

fn start_outbound_loop(transport: Arc<dyn StreamTransport>, outbound_rx: Receiver<TransportFrame>) {
    runtime::spawn_detached(async move {
        while let Ok(frame) = outbound_rx.recv().await {
            if let Err(err) = transport.send(frame).await {
                log::warn!("multiplexed outbound loop terminated: {err}");
                break;
            }
        }
    });
}

fn start_inbound_loop(
    transport: Arc<dyn StreamTransport>,
    streams: StreamRegistry,
    outbound_tx: Sender<TransportFrame>,
    incoming_tx: Sender<MultiplexedStream>,
) {
    runtime::spawn_detached(async move {
        loop {
            let frame = match transport.next().await {
                Ok(frame) => frame,
                Err(err) => {
                    log::warn!("multiplexed inbound loop terminated: {err}");
                    break;
                }
            };
            let stream_id = frame.stream_id();
            let event = frame.into_kind();

            if let FrameKind::Open(open) = event {
                let (inbound_tx, inbound_rx) = async_channel::unbounded();
                lock(&streams).insert(stream_id, inbound_tx);
                let stream = MultiplexedStream::new(
                    stream_id,
                    open,
                    outbound_tx.clone(),
                    inbound_rx,
                    Arc::clone(&streams),
                );
                if incoming_tx.send(stream).await.is_err() {
                    log::debug!("no acceptor for stream {}", stream_id.value());
                }
                continue;
            }

            let terminal = matches!(event, FrameKind::Close | FrameKind::Error(_));
            let sender = if terminal {
                lock(&streams).remove(&stream_id)
            } else {
                lock(&streams).get(&stream_id).cloned()
            };
            match sender {
                Some(sender) => {
                    if sender.send(event).await.is_err() {
                        log::debug!("dropping inbound frame for closed stream {}", stream_id.value());
                    }
                }
                None => log::debug!("dropping frame for unknown stream {}", stream_id.value()),
            }
        }

        // Fail every open stream so their owners reconnect.
        let orphaned: Vec<Sender<FrameKind>> = lock(&streams).drain().map(|(_, sender)| sender).collect();
        for sender in orphaned {
            let _ = sender
                .send(FrameKind::Error(unavailable("connection to the backend was lost")))
                .await;
        }
        incoming_tx.close();
    });
}

/// One logical stream on a [`MultiplexedConnection`]. Dropping it closes the stream.
pub struct MultiplexedStream {
    id: StreamId,
    open: StreamOpen,
    outbound: Sender<TransportFrame>,
    inbound: Receiver<FrameKind>,
    streams: StreamRegistry,
}

impl MultiplexedStream {
    fn new(
        id: StreamId,
        open: StreamOpen,
        outbound: Sender<TransportFrame>,
        inbound: Receiver<FrameKind>,
        streams: StreamRegistry,
    ) -> Self {
        Self {
            id,
            open,
            outbound,
            inbound,
            streams,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.open.method
    }

    pub fn open_frame(&self) -> &StreamOpen {
        &self.open
    }

    pub async fn send(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        self.outbound
            .send(TransportFrame::data(self.id, payload))
            .await
            .map_err(|err| unavailable(format!("failed to enqueue stream frame: {err}")))
    }

    /// Next payload; `None` once the peer closed the stream.
    pub async fn next(&self) -> Option<FirestoreResult<Vec<u8>>> {
        while let Ok(event) = self.inbound.recv().await {
            match event {
                FrameKind::Data(payload) => return Some(Ok(payload)),
                FrameKind::Close => return None,
                FrameKind::Error(err) => return Some(Err(err)),
                FrameKind::Open(_) => continue,
            }
        }
        None
    }

    pub async fn close(&self) -> FirestoreResult<()> {
        self.deregister();
        self.outbound
            .send(TransportFrame::close(self.id))
            .await
            .map_err(|err| internal_error(format!("failed to enqueue close frame: {err}")))
    }

    /// Terminates the stream with an error delivered to the peer.
    pub async fn fail(&self, error: FirestoreError) -> FirestoreResult<()> {
        self.deregister();
        self.outbound
            .send(TransportFrame::error(self.id, error))
            .await
            .map_err(|err| internal_error(format!("failed to enqueue error frame: {err}")))
    }

    fn deregister(&self) -> bool {
        lock(&self.streams).remove(&self.id).is_some()
    }
}

impl Drop for MultiplexedStream {
    fn drop(&mut self) {
        if self.deregister() {
            let _ = self.outbound.try_send(TransportFrame::close(self.id));
        }
    }
}

/// Loopback transport connecting two in-process endpoints.
pub struct InMemoryTransport {
    inbound: Receiver<TransportFrame>,
    outbound: Sender<TransportFrame>,
}

impl InMemoryTransport {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (left_tx, left_rx) = async_channel::unbounded();
        let (right_tx, right_rx) = async_channel::unbounded();

        let left = Arc::new(Self {
            inbound: left_rx,
            outbound: right_tx,
        });
        let right = Arc::new(Self {
            inbound: right_rx,
            outbound: left_tx,
        });
        (left, right)
    }

    /// Severs the link; both endpoints see their streams fail.
    pub fn disconnect(&self) {
        self.outbound.close();
        self.inbound.close();
    }
}

#[async_trait]
impl StreamTransport for InMemoryTransport {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|err| unavailable(format!("loopback transport send failed: {err}")))
    }

    async fn next(&self) -> FirestoreResult<TransportFrame> {
        self.inbound
            .recv()
            .await
            .map_err(|err| unavailable(format!("loopback transport recv failed: {err}")))
    }
}
