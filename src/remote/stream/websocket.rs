use std::sync::Arc;

use async_lock::Mutex;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::{FrameKind, StreamId, StreamOpen, StreamTransport, TransportFrame};
use crate::error::{internal_error, invalid_argument, unavailable, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::remote::rpc_error::{code_from_grpc, code_to_grpc};

/// JSON text representation of a [`TransportFrame`].
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFrame {
    stream_id: u32,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    metadata: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl WireFrame {
    fn encode(frame: TransportFrame) -> Self {
        let mut wire = WireFrame {
            stream_id: frame.stream_id().value(),
            kind: String::new(),
            method: None,
            metadata: Vec::new(),
            payload: None,
            code: None,
            message: None,
        };
        match frame.into_kind() {
            FrameKind::Open(open) => {
                wire.kind = "open".into();
                wire.method = Some(open.method);
                wire.metadata = open.metadata;
            }
            FrameKind::Data(payload) => {
                wire.kind = "data".into();
                wire.payload = Some(STANDARD.encode(payload));
            }
            FrameKind::Close => wire.kind = "close".into(),
            FrameKind::Error(err) => {
                wire.kind = "error".into();
                wire.code = Some(code_to_grpc(err.code));
                wire.message = Some(err.message().to_string());
            }
        }
        wire
    }

    fn decode(self) -> FirestoreResult<TransportFrame> {
        let stream_id = StreamId::new(self.stream_id);
        let kind = match self.kind.as_str() {
            "open" => FrameKind::Open(StreamOpen::new(self.method.unwrap_or_default(), self.metadata)),
            "data" => {
                let payload = STANDARD
                    .decode(self.payload.unwrap_or_default())
                    .map_err(|err| internal_error(format!("invalid frame payload: {err}")))?;
                FrameKind::Data(payload)
            }
            "close" => FrameKind::Close,
            "error" => {
                let code = self
                    .code
                    .and_then(code_from_grpc)
                    .unwrap_or(FirestoreErrorCode::Unknown);
                FrameKind::Error(FirestoreError::new(code, self.message.unwrap_or_default()))
            }
            other => return Err(internal_error(format!("unknown frame type '{other}'"))),
        };
        Ok(TransportFrame::new(stream_id, kind))
    }
}

/// [`StreamTransport`] carrying frames as JSON text messages over a WebSocket.
pub struct WebSocketTransport<S = MaybeTlsStream<TcpStream>> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    reader: Mutex<SplitStream<WebSocketStream<S>>>,
}

impl WebSocketTransport<MaybeTlsStream<TcpStream>> {
    /// Connects to a `ws://` or `wss://` endpoint.
    pub async fn connect(endpoint: &str) -> FirestoreResult<Arc<Self>> {
        let url = Url::parse(endpoint).map_err(|err| invalid_argument(format!("invalid endpoint {endpoint}: {err}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(invalid_argument(format!(
                "unsupported scheme '{}' for a websocket endpoint",
                url.scheme()
            )));
        }
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|err| unavailable(format!("failed to connect to {url}: {err}")))?;
        log::debug!("websocket connected to {url}");
        Ok(Self::from_websocket(stream))
    }
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps an established socket, e.g. one accepted by a server.
    pub fn from_websocket(stream: WebSocketStream<S>) -> Arc<Self> {
        let (sink, reader) = stream.split();
        Arc::new(Self {
            sink: Mutex::new(sink),
            reader: Mutex::new(reader),
        })
    }
}

#[async_trait]
impl<S> StreamTransport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()> {
        let text = serde_json::to_string(&WireFrame::encode(frame))
            .map_err(|err| internal_error(format!("failed to encode frame: {err}")))?;
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|err| unavailable(format!("websocket send failed: {err}")))
    }

    async fn next(&self) -> FirestoreResult<TransportFrame> {
        let mut reader = self.reader.lock().await;
        loop {
            let message = match reader.next().await {
                Some(Ok(message)) => message,
                Some(Err(err)) => return Err(unavailable(format!("websocket receive failed: {err}"))),
                None => return Err(unavailable("websocket closed")),
            };
            let bytes = match message {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(bytes) => bytes,
                Message::Close(_) => return Err(unavailable("websocket closed by peer")),
                // Pings are answered by tungstenite.
                _ => continue,
            };
            let wire: WireFrame = serde_json::from_slice(&bytes)
                .map_err(|err| internal_error(format!("invalid frame: {err}")))?;
            return wire.decode();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::not_found;
    use crate::remote::stream::MultiplexedConnection;
    use tokio::net::TcpListener;

    #[test]
    fn wire_frames_carry_errors_and_payloads() {
        let frame = TransportFrame::data(StreamId::new(3), b"{}".to_vec());
        let decoded = WireFrame::encode(frame).decode().unwrap();
        assert!(matches!(decoded.kind(), FrameKind::Data(payload) if payload == b"{}"));

        let frame = TransportFrame::error(StreamId::new(3), not_found("gone"));
        let decoded = WireFrame::encode(frame).decode().unwrap();
        match decoded.kind() {
            FrameKind::Error(err) => {
                assert_eq!(err.code, FirestoreErrorCode::NotFound);
                assert_eq!(err.message(), "gone");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_non_websocket_endpoints() {
        let err = WebSocketTransport::connect("https://example.com/stream").await.err().unwrap();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
        let err = WebSocketTransport::connect("not a url").await.err().unwrap();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn streams_over_a_local_websocket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let websocket = tokio_tungstenite::accept_async(socket).await.unwrap();
            let connection = MultiplexedConnection::new(WebSocketTransport::from_websocket(websocket));
            let stream = connection.accept_stream().await.unwrap();
            assert_eq!(stream.method(), "Write");
            let payload = stream.next().await.unwrap().unwrap();
            stream.send(payload).await.unwrap();
            // Keep the connection alive until the client saw the echo.
            let _ = stream.next().await;
        });

        let transport = WebSocketTransport::connect(&format!("ws://{address}")).await.unwrap();
        let connection = MultiplexedConnection::new(transport);
        let stream = connection
            .open_stream(StreamOpen::new("Write", Vec::new()))
            .await
            .unwrap();
        stream.send(b"echo".to_vec()).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), b"echo");
        stream.close().await.unwrap();
        server.await.unwrap();
    }
}
