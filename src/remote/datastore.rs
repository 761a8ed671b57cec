use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{failed_precondition, FirestoreResult};
use crate::model::DatabaseId;
use crate::remote::credentials::{credential_headers, CredentialsProviderArc, NoopCredentialsProvider};
use crate::remote::serializer::JsonProtoSerializer;
use crate::remote::stream::{MultiplexedConnection, MultiplexedStream, StreamOpen};

pub type StreamingFuture<'a, T> = BoxFuture<'a, T>;

pub const RESOURCE_PREFIX_HEADER: &str = "google-cloud-resource-prefix";
pub const REQUEST_PARAMS_HEADER: &str = "x-goog-request-params";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Listen,
    Write,
}

impl StreamKind {
    pub fn method(&self) -> &'static str {
        match self {
            StreamKind::Listen => "google.firestore.v1.Firestore/Listen",
            StreamKind::Write => "google.firestore.v1.Firestore/Write",
        }
    }

    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            m if m == StreamKind::Listen.method() => Some(StreamKind::Listen),
            m if m == StreamKind::Write.method() => Some(StreamKind::Write),
            _ => None,
        }
    }
}

/// An open bidirectional RPC.
pub trait StreamHandle: Send + Sync + 'static {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>>;

    /// Next message; `None` once the server half-closed the stream.
    fn next(&self) -> StreamingFuture<'_, Option<FirestoreResult<Vec<u8>>>>;

    fn close(&self) -> StreamingFuture<'_, FirestoreResult<()>>;
}

/// Opens the backend's streaming RPCs.
pub trait StreamingDatastore: Send + Sync + 'static {
    fn database_id(&self) -> &DatabaseId;

    fn open_stream(&self, kind: StreamKind) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>>;

    /// Forces fresh credentials for the next stream.
    fn invalidate_credentials(&self);

    /// Refuses any further streams.
    fn terminate(&self);

    fn serializer(&self) -> JsonProtoSerializer {
        JsonProtoSerializer::new(self.database_id().clone())
    }
}

/// [`StreamingDatastore`] that runs every RPC as a stream of a
/// [`MultiplexedConnection`].
pub struct MultiplexedDatastore {
    connection: Arc<MultiplexedConnection>,
    database_id: DatabaseId,
    auth: CredentialsProviderArc,
    app_check: CredentialsProviderArc,
    terminated: AtomicBool,
}

impl MultiplexedDatastore {
    pub fn new(connection: Arc<MultiplexedConnection>, database_id: DatabaseId) -> Self {
        Self {
            connection,
            database_id,
            auth: Arc::new(NoopCredentialsProvider),
            app_check: Arc::new(NoopCredentialsProvider),
            terminated: AtomicBool::new(false),
        }
    }

    pub fn with_credentials(mut self, auth: CredentialsProviderArc, app_check: CredentialsProviderArc) -> Self {
        self.auth = auth;
        self.app_check = app_check;
        self
    }

    async fn request_metadata(&self) -> FirestoreResult<Vec<(String, String)>> {
        let mut headers = credential_headers(self.auth.as_ref(), self.app_check.as_ref()).await?;
        let database_name = self.database_id.database_name();
        headers.push((RESOURCE_PREFIX_HEADER.to_string(), database_name.clone()));
        headers.push((REQUEST_PARAMS_HEADER.to_string(), database_name));
        Ok(headers)
    }
}

impl StreamingDatastore for MultiplexedDatastore {
    fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    fn open_stream(&self, kind: StreamKind) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        async move {
            if self.terminated.load(Ordering::SeqCst) {
                return Err(failed_precondition("The client has already been terminated."));
            }
            let metadata = self.request_metadata().await?;
            let stream = self
                .connection
                .open_stream(StreamOpen::new(kind.method(), metadata))
                .await?;
            Ok(Arc::new(MultiplexedStreamHandle { stream }) as Arc<dyn StreamHandle>)
        }
        .boxed()
    }

    fn invalidate_credentials(&self) {
        self.auth.invalidate_token();
        self.app_check.invalidate_token();
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }
}

struct MultiplexedStreamHandle {
    stream: MultiplexedStream,
}

impl StreamHandle for MultiplexedStreamHandle {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>> {
        self.stream.send(payload).boxed()
    }

    fn next(&self) -> StreamingFuture<'_, Option<FirestoreResult<Vec<u8>>>> {
        self.stream.next().boxed()
    }

    fn close(&self) -> StreamingFuture<'_, FirestoreResult<()>> {
        self.stream.close().boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::credentials::StaticCredentialsProvider;
    use crate::remote::stream::InMemoryTransport;

    #[tokio::test]
    async fn opens_streams_with_request_metadata() {
        let (client_transport, server_transport) = InMemoryTransport::pair();
        let server = MultiplexedConnection::new(server_transport);
        let database_id = DatabaseId::new("p", "(default)");
        let datastore = MultiplexedDatastore::new(Arc::new(MultiplexedConnection::new(client_transport)), database_id)
            .with_credentials(Arc::new(StaticCredentialsProvider::new("tok")), Arc::new(NoopCredentialsProvider));

        let handle = datastore.open_stream(StreamKind::Write).await.expect("open");
        let peer = server.accept_stream().await.expect("accept");
        assert_eq!(StreamKind::from_method(peer.method()), Some(StreamKind::Write));
        assert_eq!(peer.open_frame().header("authorization"), Some("Bearer tok"));
        assert_eq!(
            peer.open_frame().header(RESOURCE_PREFIX_HEADER),
            Some("projects/p/databases/(default)")
        );

        peer.send(b"hello".to_vec()).await.expect("send");
        assert_eq!(handle.next().await.expect("event").expect("payload"), b"hello");
        handle.close().await.expect("close");
    }

    #[tokio::test]
    async fn terminated_datastore_refuses_streams() {
        let (client_transport, _server_transport) = InMemoryTransport::pair();
        let datastore = MultiplexedDatastore::new(
            Arc::new(MultiplexedConnection::new(client_transport)),
            DatabaseId::new("p", "(default)"),
        );
        datastore.terminate();
        assert!(datastore.open_stream(StreamKind::Listen).await.is_err());
    }
}
