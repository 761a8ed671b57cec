#![cfg(not(target_arch = "wasm32"))]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::prelude::*;
use firestore_sync::core::{FirestoreClient, ListenOptions, ListenerRegistration, OnlineState, Query, ViewSnapshot};
use firestore_sync::error::{permission_denied, FirestoreErrorCode};
use firestore_sync::model::{DatabaseId, DocumentKey, Mutation, ResourcePath};
use firestore_sync::remote::stream::{InMemoryTransport, MultiplexedConnection, MultiplexedStream};
use firestore_sync::remote::MultiplexedDatastore;
use firestore_sync::value::{FirestoreValue, MapValue};
use serde_json::{json, Value};

const TIMEOUT: Duration = Duration::from_secs(5);
const LISTEN: &str = "google.firestore.v1.Firestore/Listen";
const WRITE: &str = "google.firestore.v1.Firestore/Write";

type Snapshots = Arc<Mutex<Vec<ViewSnapshot>>>;

/// Server side of an in-memory connection, speaking the JSON wire format.
struct Backend {
    connection: MultiplexedConnection,
    database_id: DatabaseId,
}

impl Backend {
    async fn accept(&self, method: &str) -> MultiplexedStream {
        let stream = tokio::time::timeout(TIMEOUT, self.connection.accept_stream())
            .await
            .expect("timed out waiting for the client to open a stream")
            .expect("transport closed");
        assert_eq!(stream.method(), method);
        stream
    }

    fn document_name(&self, path: &str) -> String {
        self.database_id.document_name(&key(path))
    }

    fn document(&self, path: &str, title: &str, update_time: &str) -> Value {
        json!({
            "name": self.document_name(path),
            "fields": { "title": { "stringValue": title } },
            "updateTime": update_time,
        })
    }
}

fn setup() -> (FirestoreClient, Backend) {
    let (client_side, server_side) = InMemoryTransport::pair();
    let database_id = DatabaseId::new("sync-tests", "(default)");
    let connection = Arc::new(MultiplexedConnection::new(client_side));
    let datastore = Arc::new(MultiplexedDatastore::new(connection, database_id.clone()));
    let client = FirestoreClient::builder(database_id.clone(), datastore).build();
    let backend = Backend {
        connection: MultiplexedConnection::new(server_side),
        database_id,
    };
    (client, backend)
}

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

fn rooms() -> Query {
    Query::collection(ResourcePath::from_string("rooms").unwrap())
}

fn title(value: &str) -> MapValue {
    let mut fields = BTreeMap::new();
    fields.insert("title".to_string(), FirestoreValue::from_string(value));
    MapValue::new(fields)
}

fn token(value: &str) -> String {
    BASE64_STANDARD.encode(value)
}

fn keys(snapshot: &ViewSnapshot) -> Vec<DocumentKey> {
    snapshot.docs().iter().map(|doc| doc.key().clone()).collect()
}

async fn receive(stream: &MultiplexedStream) -> Value {
    let payload = tokio::time::timeout(TIMEOUT, stream.next())
        .await
        .expect("timed out waiting for a request")
        .expect("stream closed")
        .expect("stream failed");
    serde_json::from_slice(&payload).unwrap()
}

async fn send(stream: &MultiplexedStream, message: Value) {
    stream.send(serde_json::to_vec(&message).unwrap()).await.unwrap();
}

async fn target_change(stream: &MultiplexedStream, change_type: &str, target_id: i64, resume_token: Option<&str>) {
    let mut change = json!({ "targetChangeType": change_type, "targetIds": [target_id] });
    if let Some(resume_token) = resume_token {
        change["resumeToken"] = json!(token(resume_token));
    }
    send(stream, json!({ "targetChange": change })).await;
}

async fn global_snapshot(stream: &MultiplexedStream, read_time: &str) {
    send(stream, json!({ "targetChange": { "targetChangeType": "NO_CHANGE", "readTime": read_time } })).await;
}

async fn listen(client: &FirestoreClient, query: Query, options: ListenOptions) -> (ListenerRegistration, Snapshots) {
    let snapshots: Snapshots = Arc::new(Mutex::new(Vec::new()));
    let captured = snapshots.clone();
    let registration = client
        .listen(query, options, move |result| {
            if let Ok(snapshot) = result {
                captured.lock().unwrap().push(snapshot);
            }
        })
        .await
        .expect("register listener");
    (registration, snapshots)
}

async fn wait_for(snapshots: &Snapshots, predicate: impl Fn(&ViewSnapshot) -> bool) -> ViewSnapshot {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        if let Some(snapshot) = snapshots.lock().unwrap().iter().rev().find(|s| predicate(s)) {
            return snapshot.clone();
        }
        assert!(tokio::time::Instant::now() < deadline, "no matching snapshot was raised");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(TIMEOUT, future).await.expect("timed out")
}

/// Accepts the watch stream, answers the first target with `docs` and
/// returns the stream plus the target id.
async fn serve_initial_results(backend: &Backend, docs: &[&str]) -> (MultiplexedStream, i64) {
    let stream = backend.accept(LISTEN).await;
    let request = receive(&stream).await;
    assert!(request["addTarget"]["query"].is_object());
    let target_id = request["addTarget"]["targetId"].as_i64().unwrap();

    target_change(&stream, "ADD", target_id, None).await;
    for path in docs {
        send(
            &stream,
            json!({ "documentChange": {
                "document": backend.document(path, "initial", "2024-01-01T00:00:01Z"),
                "targetIds": [target_id],
            } }),
        )
        .await;
    }
    target_change(&stream, "CURRENT", target_id, Some("token-1")).await;
    global_snapshot(&stream, "2024-01-01T00:00:02Z").await;
    (stream, target_id)
}

#[tokio::test(flavor = "multi_thread")]
async fn listen_raises_server_snapshot_and_releases_target() {
    let (client, backend) = setup();
    let (registration, snapshots) = listen(&client, rooms(), ListenOptions::default()).await;

    let (stream, target_id) = serve_initial_results(&backend, &["rooms/a", "rooms/b"]).await;
    let snapshot = wait_for(&snapshots, |s| !s.from_cache()).await;
    assert_eq!(keys(&snapshot), vec![key("rooms/a"), key("rooms/b")]);
    assert!(!snapshot.has_pending_writes());
    assert_eq!(client.online_state(), OnlineState::Online);

    // Empty cached snapshots are never raised to a listener without metadata changes.
    assert!(snapshots.lock().unwrap().iter().all(|s| !s.from_cache()));

    registration.remove();
    let request = receive(&stream).await;
    assert_eq!(request["removeTarget"], json!(target_id));

    client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn acknowledged_write_resolves() {
    let (client, backend) = setup();
    let write = tokio::spawn(client.write(vec![Mutation::set(key("rooms/a"), title("hello"))]));

    let stream = backend.accept(WRITE).await;
    let handshake = receive(&stream).await;
    assert_eq!(handshake["database"], json!("projects/sync-tests/databases/(default)"));
    send(&stream, json!({ "streamToken": token("token-0") })).await;

    let request = receive(&stream).await;
    assert_eq!(request["streamToken"], json!(token("token-0")));
    assert_eq!(request["writes"].as_array().map(Vec::len), Some(1));
    send(
        &stream,
        json!({
            "streamToken": token("token-1"),
            "commitTime": "2024-01-01T00:00:05Z",
            "writeResults": [{ "updateTime": "2024-01-01T00:00:05Z" }],
        }),
    )
    .await;

    within(write).await.unwrap().unwrap();
    within(client.wait_for_pending_writes()).await.unwrap();
    client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_write_fails_writer_and_pending_writes_waiter() {
    let (client, backend) = setup();
    let write = tokio::spawn(client.write(vec![Mutation::set(key("rooms/a"), title("hello"))]));
    let waiter = tokio::spawn(client.wait_for_pending_writes());

    let stream = backend.accept(WRITE).await;
    receive(&stream).await;
    send(&stream, json!({ "streamToken": token("token-0") })).await;
    receive(&stream).await;
    stream.fail(permission_denied("missing or insufficient permissions")).await.unwrap();

    let err = within(write).await.unwrap().unwrap_err();
    assert_eq!(err.code, FirestoreErrorCode::PermissionDenied);
    let err = within(waiter).await.unwrap().unwrap_err();
    assert_eq!(err.code, FirestoreErrorCode::PermissionDenied);

    // The rejected batch is gone; the local view falls back to the remote state.
    let cached = client.get_documents_from_local_cache(rooms()).await.unwrap();
    assert!(cached.docs().is_empty());
    client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_write_is_visible_in_local_cache() {
    let (client, _backend) = setup();
    let _write = tokio::spawn(client.write(vec![Mutation::set(key("rooms/a"), title("draft"))]));

    let snapshot = client.get_documents_from_local_cache(rooms()).await.unwrap();
    assert_eq!(keys(&snapshot), vec![key("rooms/a")]);
    assert!(snapshot.has_pending_writes());

    let document = client
        .get_document_from_local_cache(key("rooms/a"))
        .await
        .unwrap()
        .expect("document is in the local view");
    assert!(document.has_local_mutations());
    client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn disabling_network_raises_cached_snapshot_and_resumes_with_token() {
    let (client, backend) = setup();
    let options = ListenOptions::default().with_metadata_changes();
    let (_registration, snapshots) = listen(&client, rooms(), options).await;

    let (_stream, target_id) = serve_initial_results(&backend, &["rooms/a"]).await;
    wait_for(&snapshots, |s| !s.from_cache()).await;

    client.disable_network().await.unwrap();
    assert_eq!(client.online_state(), OnlineState::Offline);
    let snapshot = wait_for(&snapshots, |s| s.from_cache() && s.docs().len() == 1).await;
    assert_eq!(keys(&snapshot), vec![key("rooms/a")]);

    client.enable_network().await.unwrap();
    let stream = backend.accept(LISTEN).await;
    let request = receive(&stream).await;
    assert_eq!(request["addTarget"]["targetId"], json!(target_id));
    assert_eq!(request["addTarget"]["resumeToken"], json!(token("token-1")));
    assert_eq!(request["addTarget"]["expectedCount"], json!(1));

    client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn document_removed_from_target_is_resolved_through_limbo() {
    let (client, backend) = setup();
    let (_registration, snapshots) = listen(&client, rooms(), ListenOptions::default()).await;

    let (stream, target_id) = serve_initial_results(&backend, &["rooms/a", "rooms/b"]).await;
    wait_for(&snapshots, |s| !s.from_cache() && s.docs().len() == 2).await;

    send(
        &stream,
        json!({ "documentRemove": {
            "document": backend.document_name("rooms/b"),
            "removedTargetIds": [target_id],
        } }),
    )
    .await;
    global_snapshot(&stream, "2024-01-01T00:00:03Z").await;

    let request = receive(&stream).await;
    let limbo_target = request["addTarget"]["targetId"].as_i64().unwrap();
    assert_eq!(limbo_target % 2, 1, "limbo targets come from the sync engine's odd id space");
    assert_eq!(
        request["addTarget"]["documents"]["documents"],
        json!([backend.document_name("rooms/b")])
    );

    // The backend has no such document: the target goes current without it.
    target_change(&stream, "ADD", limbo_target, None).await;
    target_change(&stream, "CURRENT", limbo_target, Some("limbo-1")).await;
    global_snapshot(&stream, "2024-01-01T00:00:04Z").await;

    let snapshot = wait_for(&snapshots, |s| !s.from_cache() && s.docs().len() == 1).await;
    assert_eq!(keys(&snapshot), vec![key("rooms/a")]);

    let request = receive(&stream).await;
    assert_eq!(request["removeTarget"], json!(limbo_target));
    assert!(client.sync_engine().active_limbo_documents().is_empty());

    client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_document_listener_gets_cached_then_server_snapshot() {
    let (client, backend) = setup();
    client.disable_network().await.unwrap();

    let (_registration, snapshots) = listen(&client, Query::document(&key("rooms/a")), ListenOptions::default()).await;
    let cached = wait_for(&snapshots, |s| s.from_cache()).await;
    assert!(cached.docs().is_empty());

    client.enable_network().await.unwrap();
    let stream = backend.accept(LISTEN).await;
    let request = receive(&stream).await;
    assert_eq!(
        request["addTarget"]["documents"]["documents"],
        json!([backend.document_name("rooms/a")])
    );
    let target_id = request["addTarget"]["targetId"].as_i64().unwrap();
    target_change(&stream, "ADD", target_id, None).await;
    send(
        &stream,
        json!({ "documentChange": {
            "document": backend.document("rooms/a", "lobby", "2024-01-01T00:00:01Z"),
            "targetIds": [target_id],
        } }),
    )
    .await;
    target_change(&stream, "CURRENT", target_id, Some("token-1")).await;
    global_snapshot(&stream, "2024-01-01T00:00:02Z").await;

    let snapshot = wait_for(&snapshots, |s| !s.from_cache()).await;
    assert_eq!(keys(&snapshot), vec![key("rooms/a")]);
    client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshots_in_sync_listener_fires_on_registration() {
    let (client, _backend) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let id = client
        .add_snapshots_in_sync_listener(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    client.remove_snapshots_in_sync_listener(id).await.unwrap();
    client.terminate().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn operations_fail_after_terminate() {
    let (client, _backend) = setup();
    client.terminate().await.unwrap();
    assert!(client.is_terminated());
    client.terminate().await.unwrap();

    assert!(client.enable_network().await.is_err());
    assert!(client.write(vec![Mutation::delete(key("rooms/a"))]).await.is_err());
}
