//! Client-side synchronization engine for a Firestore-style document database.
//!
//! The engine keeps a local replica of remote documents, applies writes
//! optimistically before the backend confirms them, and reconciles local and
//! remote state over two long-lived streams (`Listen` and `Write`). Listeners
//! receive consistent, deduplicated [`core::ViewSnapshot`]s whether the client
//! is online or not.
//!
//! [`core::FirestoreClient`] is the entry point: it wires the
//! [`util::AsyncQueue`], the [`local::LocalStore`], the [`remote::RemoteStore`],
//! the [`core::SyncEngine`] and the [`core::EventManager`] together.
//!
//! ```no_run
//! use std::sync::Arc;
//! use firestore_sync::core::{FirestoreClient, ListenOptions, Query};
//! use firestore_sync::model::{DatabaseId, ResourcePath};
//! use firestore_sync::remote::stream::{InMemoryTransport, MultiplexedConnection};
//! use firestore_sync::remote::MultiplexedDatastore;
//!
//! # async fn run() -> firestore_sync::error::FirestoreResult<()> {
//! let (client_side, _server_side) = InMemoryTransport::pair();
//! let connection = Arc::new(MultiplexedConnection::new(client_side));
//! let database_id = DatabaseId::new("demo-project", "(default)");
//! let datastore = Arc::new(MultiplexedDatastore::new(connection, database_id.clone()));
//!
//! let client = FirestoreClient::builder(database_id, datastore).build();
//! let query = Query::collection(ResourcePath::from_string("rooms")?);
//! let registration = client
//!     .listen(query, ListenOptions::default(), |snapshot| {
//!         if let Ok(snapshot) = snapshot {
//!             println!("{} documents (from cache: {})", snapshot.docs().len(), snapshot.from_cache());
//!         }
//!     })
//!     .await?;
//! registration.remove();
//! client.terminate().await?;
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod platform;
pub mod remote;
pub mod settings;
pub mod util;
pub mod value;

#[cfg(test)]
pub(crate) mod test_support;
