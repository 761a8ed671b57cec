use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;

use crate::error::{unavailable, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::platform::runtime;
use crate::remote::datastore::{StreamHandle, StreamKind, StreamingDatastore};
use crate::settings::StreamSettings;
use crate::util::{lock, AsyncQueue, DelayedOperation, ExponentialBackoff, TimerId};

/// Lifecycle of a [`PersistentStream`].
///
/// ```text
/// Initial --start--> Starting --opened--> Open --health check--> Healthy
///    ^                   |                  |                       |
///    |                   +------ error -----+-----------------------+
///    |                                      v
///    +------ backoff elapsed ------- Backoff <--start-- Error
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Initial,
    /// Fetching credentials and opening the RPC.
    Starting,
    Open,
    /// Open long enough to trust the connection.
    Healthy,
    /// Closed by a failure; the next start waits for backoff.
    Error,
    Backoff,
}

/// Receives the events of a stream. Every call runs on the async queue.
#[async_trait]
pub trait PersistentStreamListener: Send + Sync + 'static {
    async fn on_open(&self);

    /// An error closes the stream with that error.
    async fn on_message(&self, payload: Vec<u8>) -> FirestoreResult<()>;

    /// `None` when the stream was closed on purpose.
    async fn on_close(&self, error: Option<FirestoreError>);
}

struct StreamInner {
    state: StreamState,
    /// Bumped on every close; callbacks from older generations are dropped.
    generation: u64,
    handle: Option<Arc<dyn StreamHandle>>,
    /// A request was sent and nothing arrived since.
    awaiting_response: bool,
    backoff: ExponentialBackoff,
    backoff_timer: Option<DelayedOperation>,
    idle_timer: Option<DelayedOperation>,
    health_timer: Option<DelayedOperation>,
}

/// A bidirectional stream that is restarted with backoff after failures,
/// closed when idle and checked for liveness once open.
///
/// All methods must be called from the async queue. Stream I/O runs on
/// detached tasks that re-dispatch every event onto the queue.
pub struct PersistentStream<L: PersistentStreamListener> {
    kind: StreamKind,
    datastore: Arc<dyn StreamingDatastore>,
    queue: AsyncQueue,
    settings: StreamSettings,
    listener: L,
    inner: Mutex<StreamInner>,
    this: Weak<Self>,
}

impl<L: PersistentStreamListener> PersistentStream<L> {
    pub fn new(
        kind: StreamKind,
        datastore: Arc<dyn StreamingDatastore>,
        queue: AsyncQueue,
        settings: StreamSettings,
        listener: L,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            kind,
            datastore,
            queue,
            inner: Mutex::new(StreamInner {
                state: StreamState::Initial,
                generation: 0,
                handle: None,
                awaiting_response: false,
                backoff: ExponentialBackoff::from_settings(&settings),
                backoff_timer: None,
                idle_timer: None,
                health_timer: None,
            }),
            settings,
            listener,
            this: this.clone(),
        })
    }

    fn inner(&self) -> MutexGuard<'_, StreamInner> {
        lock(&self.inner)
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn state(&self) -> StreamState {
        self.inner().state
    }

    /// Started means a start was requested and no stop or error followed.
    pub fn is_started(&self) -> bool {
        matches!(
            self.state(),
            StreamState::Starting | StreamState::Backoff | StreamState::Open | StreamState::Healthy
        )
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state(), StreamState::Open | StreamState::Healthy)
    }

    fn timer_ids(&self) -> (TimerId, TimerId, TimerId) {
        match self.kind {
            StreamKind::Listen => (
                TimerId::ListenStreamIdle,
                TimerId::ListenStreamHealthCheck,
                TimerId::ListenStreamConnectionBackoff,
            ),
            StreamKind::Write => (
                TimerId::WriteStreamIdle,
                TimerId::WriteStreamHealthCheck,
                TimerId::WriteStreamConnectionBackoff,
            ),
        }
    }

    /// Opens the stream, or schedules a reopen after backoff if the last
    /// attempt failed.
    pub fn start(&self) {
        let generation = {
            let mut inner = self.inner();
            match inner.state {
                StreamState::Error => {
                    self.perform_backoff(&mut inner);
                    return;
                }
                StreamState::Initial => {}
                state => {
                    log::debug!("{:?} stream already started ({state:?})", self.kind);
                    return;
                }
            }
            inner.state = StreamState::Starting;
            inner.generation
        };

        let datastore = Arc::clone(&self.datastore);
        let queue = self.queue.clone();
        let this = self.this.clone();
        let kind = self.kind;
        runtime::spawn_detached(async move {
            let result = datastore.open_stream(kind).await;
            queue.enqueue_and_forget(move || async move {
                if let Some(stream) = this.upgrade() {
                    stream.on_stream_opened(generation, result).await;
                }
            });
        });
    }

    async fn on_stream_opened(&self, generation: u64, result: FirestoreResult<Arc<dyn StreamHandle>>) {
        let handle = match result {
            Ok(handle) => handle,
            Err(err) => {
                if self.is_current(generation) {
                    log::debug!("{:?} stream failed to open: {err}", self.kind);
                    self.close(StreamState::Error, Some(err)).await;
                }
                return;
            }
        };

        {
            let mut inner = self.inner();
            if inner.generation != generation || inner.state != StreamState::Starting {
                drop(inner);
                runtime::spawn_detached(async move {
                    let _ = handle.close().await;
                });
                return;
            }
            inner.state = StreamState::Open;
            inner.handle = Some(Arc::clone(&handle));
            inner.awaiting_response = false;
            let (_, health_timer_id, _) = self.timer_ids();
            let this = self.this.clone();
            inner.health_timer = Some(self.queue.enqueue_after_delay(
                health_timer_id,
                self.settings.health_check_timeout,
                move || async move {
                    if let Some(stream) = this.upgrade() {
                        stream.on_health_check(generation).await;
                    }
                },
            ));
        }
        log::debug!("{:?} stream opened", self.kind);
        self.spawn_reader(generation, handle);
        self.listener.on_open().await;
    }

    fn spawn_reader(&self, generation: u64, handle: Arc<dyn StreamHandle>) {
        let queue = self.queue.clone();
        let this = self.this.clone();
        runtime::spawn_detached(async move {
            loop {
                let event = handle.next().await;
                let done = !matches!(event, Some(Ok(_)));
                let weak = this.clone();
                queue.enqueue_and_forget(move || async move {
                    let Some(stream) = weak.upgrade() else {
                        return;
                    };
                    match event {
                        Some(Ok(payload)) => stream.on_stream_message(generation, payload).await,
                        Some(Err(err)) => stream.on_stream_closed(generation, err).await,
                        None => {
                            stream
                                .on_stream_closed(generation, unavailable("stream closed by the backend"))
                                .await
                        }
                    }
                });
                if done {
                    break;
                }
            }
        });
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner().generation == generation
    }

    async fn on_stream_message(&self, generation: u64, payload: Vec<u8>) {
        {
            let mut inner = self.inner();
            if inner.generation != generation {
                log::debug!("{:?} stream ignoring message from a closed stream", self.kind);
                return;
            }
            inner.awaiting_response = false;
            inner.backoff.reset();
        }
        if let Err(err) = self.listener.on_message(payload).await {
            log::warn!("{:?} stream failed to handle message: {err}", self.kind);
            if self.is_current(generation) {
                self.close(StreamState::Error, Some(err)).await;
            }
        }
    }

    async fn on_stream_closed(&self, generation: u64, error: FirestoreError) {
        if !self.is_current(generation) {
            log::debug!("{:?} stream ignoring close of a superseded stream", self.kind);
            return;
        }
        log::debug!("{:?} stream closed: {error}", self.kind);
        self.close(StreamState::Error, Some(error)).await;
    }

    async fn on_health_check(&self, generation: u64) {
        let dead = {
            let mut inner = self.inner();
            if inner.generation != generation || inner.state != StreamState::Open {
                return;
            }
            inner.health_timer = None;
            if inner.awaiting_response {
                true
            } else {
                inner.state = StreamState::Healthy;
                false
            }
        };
        if dead {
            log::warn!("{:?} stream received no response within the health-check timeout", self.kind);
            self.close(
                StreamState::Error,
                Some(unavailable("no response from the backend within the health-check timeout")),
            )
            .await;
        }
    }

    /// Sends a request; cancels any pending idle close.
    pub async fn send(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        let handle = {
            let mut inner = self.inner();
            if let Some(timer) = inner.idle_timer.take() {
                timer.cancel();
            }
            inner.awaiting_response = true;
            inner.handle.clone()
        };
        match handle {
            Some(handle) => handle.send(payload).await,
            None => Err(unavailable(format!("{:?} stream is not open", self.kind))),
        }
    }

    /// Closes the stream after the idle timeout unless a request is sent first.
    pub fn mark_idle(&self) {
        let mut inner = self.inner();
        if !matches!(inner.state, StreamState::Open | StreamState::Healthy) || inner.idle_timer.is_some() {
            return;
        }
        let (idle_timer_id, _, _) = self.timer_ids();
        let this = self.this.clone();
        inner.idle_timer = Some(self.queue.enqueue_after_delay(
            idle_timer_id,
            self.settings.idle_timeout,
            move || async move {
                if let Some(stream) = this.upgrade() {
                    if stream.is_open() {
                        log::debug!("{:?} stream idle, closing", stream.kind);
                        stream.close(StreamState::Initial, None).await;
                    }
                }
            },
        ));
    }

    /// Closes the stream without error; the listener is told with `None`.
    pub async fn stop(&self) {
        if self.is_started() {
            self.close(StreamState::Initial, None).await;
        }
    }

    /// After an error, lets the next start reconnect without waiting.
    pub fn inhibit_backoff(&self) {
        let mut inner = self.inner();
        if inner.state == StreamState::Error {
            inner.state = StreamState::Initial;
            inner.backoff.reset();
        }
    }

    fn perform_backoff(&self, inner: &mut StreamInner) {
        inner.state = StreamState::Backoff;
        let delay = inner.backoff.next_delay();
        log::debug!("{:?} stream reconnecting in {delay:?}", self.kind);
        let (_, _, backoff_timer_id) = self.timer_ids();
        let this = self.this.clone();
        inner.backoff_timer = Some(self.queue.enqueue_after_delay(backoff_timer_id, delay, move || async move {
            if let Some(stream) = this.upgrade() {
                let resume = {
                    let mut inner = stream.inner();
                    inner.backoff_timer = None;
                    if inner.state == StreamState::Backoff {
                        inner.state = StreamState::Initial;
                        true
                    } else {
                        false
                    }
                };
                if resume {
                    stream.start();
                }
            }
        }));
    }

    async fn close(&self, final_state: StreamState, error: Option<FirestoreError>) {
        let handle = {
            let mut inner = self.inner();
            for timer in [inner.idle_timer.take(), inner.health_timer.take(), inner.backoff_timer.take()]
                .into_iter()
                .flatten()
            {
                timer.cancel();
            }
            inner.generation += 1;

            match (&error, final_state) {
                (_, state) if state != StreamState::Error => inner.backoff.reset(),
                (Some(err), _) if err.code == FirestoreErrorCode::ResourceExhausted => {
                    log::debug!("{:?} stream exhausted its quota, using maximum backoff", self.kind);
                    inner.backoff.reset_to_max();
                }
                (Some(err), _)
                    if err.code == FirestoreErrorCode::Unauthenticated && inner.state != StreamState::Healthy =>
                {
                    // The token was likely rejected; the next open fetches a new one.
                    self.datastore.invalidate_credentials();
                }
                _ => {}
            }

            inner.state = final_state;
            inner.awaiting_response = false;
            inner.handle.take()
        };

        if let Some(handle) = handle {
            if let Err(err) = handle.close().await {
                log::debug!("{:?} stream close failed: {err}", self.kind);
            }
        }
        self.listener.on_close(error).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{resource_exhausted, unauthenticated};
    use crate::model::DatabaseId;
    use crate::remote::credentials::StaticCredentialsProvider;
    use crate::remote::datastore::MultiplexedDatastore;
    use crate::remote::stream::{InMemoryTransport, MultiplexedConnection, MultiplexedStream};
    use async_channel::{Receiver, Sender};
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    enum Event {
        Open,
        Message(Vec<u8>),
        Close(Option<FirestoreErrorCode>),
    }

    struct RecordingListener {
        events: Sender<Event>,
    }

    #[async_trait]
    impl PersistentStreamListener for RecordingListener {
        async fn on_open(&self) {
            let _ = self.events.send(Event::Open).await;
        }

        async fn on_message(&self, payload: Vec<u8>) -> FirestoreResult<()> {
            let _ = self.events.send(Event::Message(payload)).await;
            Ok(())
        }

        async fn on_close(&self, error: Option<FirestoreError>) {
            let _ = self.events.send(Event::Close(error.map(|err| err.code))).await;
        }
    }

    struct Harness {
        queue: AsyncQueue,
        stream: Arc<PersistentStream<RecordingListener>>,
        events: Receiver<Event>,
        server: MultiplexedConnection,
        auth: Arc<StaticCredentialsProvider>,
    }

    impl Harness {
        fn new() -> Self {
            let (client_transport, server_transport) = InMemoryTransport::pair();
            let auth = Arc::new(StaticCredentialsProvider::new("token"));
            let datastore = MultiplexedDatastore::new(
                Arc::new(MultiplexedConnection::new(client_transport)),
                DatabaseId::new("p", "(default)"),
            )
            .with_credentials(auth.clone(), Arc::new(crate::remote::credentials::NoopCredentialsProvider));
            let queue = AsyncQueue::new();
            let (tx, events) = async_channel::unbounded();
            let stream = PersistentStream::new(
                StreamKind::Listen,
                Arc::new(datastore),
                queue.clone(),
                StreamSettings::default(),
                RecordingListener { events: tx },
            );
            Self {
                queue,
                stream,
                events,
                server: MultiplexedConnection::new(server_transport),
                auth,
            }
        }

        async fn run<F, Fut>(&self, op: F)
        where
            F: FnOnce(Arc<PersistentStream<RecordingListener>>) -> Fut + Send + 'static,
            Fut: std::future::Future<Output = ()> + Send + 'static,
        {
            let stream = Arc::clone(&self.stream);
            self.queue
                .enqueue(move || async move {
                    op(stream).await;
                    Ok(())
                })
                .await
                .unwrap();
        }

        async fn start(&self) -> MultiplexedStream {
            self.run(|stream| async move { stream.start() }).await;
            let peer = self.server.accept_stream().await.expect("accept");
            assert_eq!(self.next_event().await, Event::Open);
            peer
        }

        async fn next_event(&self) -> Event {
            tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .expect("timed out waiting for stream event")
                .expect("listener dropped")
        }
    }

    #[tokio::test]
    async fn delivers_messages_and_becomes_healthy() {
        let harness = Harness::new();
        let peer = harness.start().await;
        assert_eq!(harness.stream.state(), StreamState::Open);

        peer.send(b"hello".to_vec()).await.unwrap();
        assert_eq!(harness.next_event().await, Event::Message(b"hello".to_vec()));

        harness
            .queue
            .run_delayed_operations_early(TimerId::ListenStreamHealthCheck)
            .await
            .unwrap();
        assert_eq!(harness.stream.state(), StreamState::Healthy);
    }

    #[tokio::test]
    async fn unanswered_request_fails_health_check() {
        let harness = Harness::new();
        let _peer = harness.start().await;
        harness.run(|stream| async move { stream.send(b"ping".to_vec()).await.unwrap() }).await;
        harness
            .queue
            .run_delayed_operations_early(TimerId::ListenStreamHealthCheck)
            .await
            .unwrap();
        assert_eq!(harness.next_event().await, Event::Close(Some(FirestoreErrorCode::Unavailable)));
        assert_eq!(harness.stream.state(), StreamState::Error);
    }

    #[tokio::test]
    async fn restarts_after_backoff() {
        let harness = Harness::new();
        let peer = harness.start().await;
        peer.fail(unavailable("boom")).await.unwrap();
        assert_eq!(harness.next_event().await, Event::Close(Some(FirestoreErrorCode::Unavailable)));

        // The first retry after a reset is immediate.
        let peer = harness.start().await;
        peer.fail(unavailable("boom again")).await.unwrap();
        harness.next_event().await;

        harness.run(|stream| async move { stream.start() }).await;
        assert_eq!(harness.stream.state(), StreamState::Backoff);
        assert!(harness
            .queue
            .contains_delayed_operation(TimerId::ListenStreamConnectionBackoff));
        harness
            .queue
            .run_delayed_operations_early(TimerId::ListenStreamConnectionBackoff)
            .await
            .unwrap();
        let _peer = harness.server.accept_stream().await.expect("reconnect");
        assert_eq!(harness.next_event().await, Event::Open);
    }

    #[tokio::test]
    async fn resource_exhausted_forces_maximum_backoff() {
        let harness = Harness::new();
        let peer = harness.start().await;
        peer.fail(resource_exhausted("quota")).await.unwrap();
        harness.next_event().await;
        assert_eq!(
            harness.stream.inner().backoff.current_base(),
            StreamSettings::default().max_backoff
        );
    }

    #[tokio::test]
    async fn unauthenticated_before_healthy_invalidates_token() {
        let harness = Harness::new();
        let peer = harness.start().await;
        peer.fail(unauthenticated("expired")).await.unwrap();
        assert_eq!(
            harness.next_event().await,
            Event::Close(Some(FirestoreErrorCode::Unauthenticated))
        );
        assert_eq!(harness.auth.invalidation_count(), 1);

        let peer = harness.start().await;
        assert_eq!(harness.auth.refresh_count(), 1);
        assert_eq!(peer.open_frame().header("authorization"), Some("Bearer token"));
    }

    #[tokio::test]
    async fn idle_stream_closes_cleanly() {
        let harness = Harness::new();
        let peer = harness.start().await;
        harness.run(|stream| async move { stream.mark_idle() }).await;
        harness
            .queue
            .run_delayed_operations_early(TimerId::ListenStreamIdle)
            .await
            .unwrap();
        assert_eq!(harness.next_event().await, Event::Close(None));
        assert_eq!(harness.stream.state(), StreamState::Initial);
        assert!(peer.next().await.is_none());
    }

    #[tokio::test]
    async fn send_cancels_idle_timer() {
        let harness = Harness::new();
        let _peer = harness.start().await;
        harness
            .run(|stream| async move {
                stream.mark_idle();
                stream.send(b"x".to_vec()).await.unwrap();
            })
            .await;
        assert!(!harness.queue.contains_delayed_operation(TimerId::ListenStreamIdle));
    }

    #[tokio::test]
    async fn messages_after_stop_are_ignored() {
        let harness = Harness::new();
        let peer = harness.start().await;
        harness.run(|stream| async move { stream.stop().await }).await;
        assert_eq!(harness.next_event().await, Event::Close(None));
        let _ = peer.send(b"late".to_vec()).await;
        harness.run(|_| async {}).await;
        assert!(harness.events.try_recv().is_err());
    }
}
