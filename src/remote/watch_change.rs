use serde_json::Value as JsonValue;

use crate::error::{invalid_argument, FirestoreError, FirestoreResult};
use crate::model::{Document, DocumentKey, SnapshotVersion, TargetId};
use crate::remote::rpc_error::RpcStatus;
use crate::remote::serializer::{decode_bytes, JsonProtoSerializer};

/// One decoded `ListenResponse`.
#[derive(Debug, Clone)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    DocumentChange(DocumentWatchChange),
    ExistenceFilter(ExistenceFilterChange),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTargetChangeState {
    NoChange,
    Add,
    Remove,
    Current,
    Reset,
}

#[derive(Debug, Clone)]
pub struct WatchTargetChange {
    pub state: WatchTargetChangeState,
    /// Empty means every active target.
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    pub read_time: SnapshotVersion,
    pub cause: Option<FirestoreError>,
}

/// A document entered, changed in, or left a set of targets.
///
/// `new_doc` is a found document for `documentChange`, a no-document for
/// `documentDelete`, and `None` for `documentRemove`.
#[derive(Debug, Clone)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    pub new_doc: Option<Document>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilterParams {
    pub bitmap: Vec<u8>,
    pub padding: i32,
    pub hash_count: i32,
}

#[derive(Debug, Clone)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub count: i32,
    pub unchanged_names: Option<BloomFilterParams>,
}

pub fn decode_watch_change(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<Option<WatchChange>> {
    if let Some(target_change) = value.get("targetChange") {
        return decode_target_change(serializer, target_change).map(Some);
    }
    if let Some(document_change) = value.get("documentChange") {
        return decode_document_change(serializer, document_change).map(Some);
    }
    if let Some(document_delete) = value.get("documentDelete") {
        return decode_document_delete(serializer, document_delete).map(Some);
    }
    if let Some(document_remove) = value.get("documentRemove") {
        return decode_document_remove(serializer, document_remove).map(Some);
    }
    if let Some(filter) = value.get("filter") {
        return decode_filter_change(filter).map(Some);
    }
    Ok(None)
}

/// Snapshot version a response establishes.
///
/// Only a global target change (no target ids) carries a consistent read
/// time; everything else reports the minimum version.
pub fn version_from_listen_response(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<SnapshotVersion> {
    let Some(target_change) = value.get("targetChange") else {
        return Ok(SnapshotVersion::min());
    };
    if !numeric_array(target_change.get("targetIds")).is_empty() {
        return Ok(SnapshotVersion::min());
    }
    match target_change.get("readTime").and_then(JsonValue::as_str) {
        Some(read_time) => serializer.decode_version(read_time),
        None => Ok(SnapshotVersion::min()),
    }
}

fn decode_target_change(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let state = value
        .get("targetChangeType")
        .and_then(JsonValue::as_str)
        .map(target_state_from_str)
        .unwrap_or(WatchTargetChangeState::NoChange);
    let read_time = match value.get("readTime").and_then(JsonValue::as_str) {
        Some(read_time) => serializer.decode_version(read_time)?,
        None => SnapshotVersion::min(),
    };
    let cause = value
        .get("cause")
        .map(|cause| serde_json::from_value::<RpcStatus>(cause.clone()))
        .transpose()
        .map_err(|err| invalid_argument(format!("Failed to decode watch cause: {err}")))?
        .and_then(RpcStatus::into_error);

    Ok(WatchChange::TargetChange(WatchTargetChange {
        state,
        target_ids: numeric_array(value.get("targetIds")),
        resume_token: decode_bytes(value.get("resumeToken"))?,
        read_time,
        cause,
    }))
}

fn decode_document_change(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let document = value
        .get("document")
        .ok_or_else(|| invalid_argument("documentChange missing document"))?;
    let document = serializer.decode_document(document)?;
    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids: numeric_array(value.get("targetIds")),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key: document.key().clone(),
        new_doc: Some(document),
    }))
}

fn decode_document_delete(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let key = document_key(serializer, value, "documentDelete")?;
    let read_time = match value.get("readTime").and_then(JsonValue::as_str) {
        Some(read_time) => serializer.decode_version(read_time)?,
        None => SnapshotVersion::min(),
    };
    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        new_doc: Some(Document::new_no_document(key.clone(), read_time)),
        key,
    }))
}

fn decode_document_remove(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let key = document_key(serializer, value, "documentRemove")?;
    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key,
        new_doc: None,
    }))
}

fn decode_filter_change(value: &JsonValue) -> FirestoreResult<WatchChange> {
    let target_id = value
        .get("targetId")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| invalid_argument("filter missing targetId"))? as TargetId;
    let count = value.get("count").and_then(JsonValue::as_i64).unwrap_or(0) as i32;
    let unchanged_names = match value.get("unchangedNames") {
        Some(bloom) => Some(BloomFilterParams {
            bitmap: decode_bytes(bloom.get("bits").and_then(|bits| bits.get("bitmap")))?,
            padding: bloom
                .get("bits")
                .and_then(|bits| bits.get("padding"))
                .and_then(JsonValue::as_i64)
                .unwrap_or(0) as i32,
            hash_count: bloom.get("hashCount").and_then(JsonValue::as_i64).unwrap_or(0) as i32,
        }),
        None => None,
    };
    Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
        target_id,
        count,
        unchanged_names,
    }))
}

fn document_key(serializer: &JsonProtoSerializer, value: &JsonValue, kind: &str) -> FirestoreResult<DocumentKey> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument(format!("{kind} missing document")))?;
    serializer.document_key_from_name(name)
}

fn numeric_array(value: Option<&JsonValue>) -> Vec<TargetId> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|value| value as TargetId))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}

fn target_state_from_str(value: &str) -> WatchTargetChangeState {
    match value {
        "ADD" => WatchTargetChangeState::Add,
        "REMOVE" => WatchTargetChangeState::Remove,
        "CURRENT" => WatchTargetChangeState::Current,
        "RESET" => WatchTargetChangeState::Reset,
        _ => WatchTargetChangeState::NoChange,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FirestoreErrorCode;
    use crate::model::DatabaseId;
    use crate::test_support::{key, version};
    use serde_json::json;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::new("project", "(default)"))
    }

    const ROOT: &str = "projects/project/databases/(default)/documents";

    #[test]
    fn decodes_target_change() {
        let change = json!({
            "targetChange": {
                "targetIds": [1, 2],
                "resumeToken": "AQID",
                "targetChangeType": "CURRENT"
            }
        });
        match decode_watch_change(&serializer(), &change).unwrap().unwrap() {
            WatchChange::TargetChange(change) => {
                assert_eq!(change.target_ids, vec![1, 2]);
                assert_eq!(change.resume_token, vec![1, 2, 3]);
                assert_eq!(change.state, WatchTargetChangeState::Current);
                assert!(change.cause.is_none());
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn decodes_removal_cause() {
        let change = json!({
            "targetChange": {
                "targetIds": [4],
                "targetChangeType": "REMOVE",
                "cause": { "code": 7, "message": "denied" }
            }
        });
        let Some(WatchChange::TargetChange(change)) = decode_watch_change(&serializer(), &change).unwrap() else {
            panic!("expected target change");
        };
        let cause = change.cause.unwrap();
        assert_eq!(cause.code, FirestoreErrorCode::PermissionDenied);
    }

    #[test]
    fn decodes_document_change_delete_and_remove() {
        let s = serializer();
        let change = json!({
            "documentChange": {
                "document": {
                    "name": format!("{ROOT}/rooms/a"),
                    "fields": { "n": { "integerValue": "1" } },
                    "updateTime": "1970-01-01T00:00:03Z"
                },
                "targetIds": [2],
                "removedTargetIds": [4]
            }
        });
        let Some(WatchChange::DocumentChange(change)) = decode_watch_change(&s, &change).unwrap() else {
            panic!("expected document change");
        };
        assert_eq!(change.key, key("rooms/a"));
        assert_eq!(change.updated_target_ids, vec![2]);
        assert_eq!(change.removed_target_ids, vec![4]);
        assert!(change.new_doc.unwrap().is_found_document());

        let delete = json!({
            "documentDelete": {
                "document": format!("{ROOT}/rooms/b"),
                "readTime": "1970-01-01T00:00:05Z",
                "removedTargetIds": [2]
            }
        });
        let Some(WatchChange::DocumentChange(change)) = decode_watch_change(&s, &delete).unwrap() else {
            panic!("expected document delete");
        };
        let deleted = change.new_doc.unwrap();
        assert!(deleted.is_no_document());
        assert_eq!(deleted.version(), version(5));

        let remove = json!({ "documentRemove": { "document": format!("{ROOT}/rooms/c"), "removedTargetIds": [2] } });
        let Some(WatchChange::DocumentChange(change)) = decode_watch_change(&s, &remove).unwrap() else {
            panic!("expected document remove");
        };
        assert!(change.new_doc.is_none());
    }

    #[test]
    fn decodes_existence_filter_with_bloom_filter() {
        let filter = json!({
            "filter": {
                "targetId": 2,
                "count": 3,
                "unchangedNames": { "bits": { "bitmap": "AQI=", "padding": 1 }, "hashCount": 4 }
            }
        });
        let Some(WatchChange::ExistenceFilter(filter)) = decode_watch_change(&serializer(), &filter).unwrap() else {
            panic!("expected existence filter");
        };
        assert_eq!(filter.count, 3);
        assert_eq!(
            filter.unchanged_names,
            Some(BloomFilterParams {
                bitmap: vec![1, 2],
                padding: 1,
                hash_count: 4
            })
        );
    }

    #[test]
    fn only_global_target_changes_carry_versions() {
        let s = serializer();
        let global = json!({ "targetChange": { "readTime": "1970-01-01T00:00:07Z" } });
        assert_eq!(version_from_listen_response(&s, &global).unwrap(), version(7));
        let scoped = json!({ "targetChange": { "targetIds": [1], "readTime": "1970-01-01T00:00:07Z" } });
        assert!(version_from_listen_response(&s, &scoped).unwrap().is_min());
        let unknown = json!({ "somethingElse": {} });
        assert!(decode_watch_change(&s, &unknown).unwrap().is_none());
    }
}
