//! The two RPC streams the client keeps open against the backend.

mod listen;
mod write;

pub use listen::{WatchStream, WatchStreamListener};
pub use write::{WriteStream, WriteStreamListener};

use serde_json::Value as JsonValue;

use crate::error::{internal_error, FirestoreResult};

fn encode_message(message: &JsonValue) -> FirestoreResult<Vec<u8>> {
    serde_json::to_vec(message).map_err(|err| internal_error(format!("failed to encode request: {err}")))
}

fn decode_message(payload: &[u8]) -> FirestoreResult<JsonValue> {
    serde_json::from_slice(payload).map_err(|err| internal_error(format!("malformed response: {err}")))
}
