//! Builders shared by the crate's unit tests.

use std::collections::BTreeMap;

use crate::core::Query;
use crate::model::{
    Document, DocumentKey, FieldMask, FieldPath, Mutation, ResourcePath, SnapshotVersion, Timestamp,
};
use crate::value::{FirestoreValue, MapValue};

pub fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

pub fn path(path: &str) -> ResourcePath {
    ResourcePath::from_string(path).unwrap()
}

pub fn field(path: &str) -> FieldPath {
    FieldPath::from_dot_separated(path).unwrap()
}

/// Snapshot version at `seconds` past the epoch.
pub fn version(seconds: i64) -> SnapshotVersion {
    SnapshotVersion::new(Timestamp::new(seconds, 0))
}

pub fn map(entries: &[(&str, FirestoreValue)]) -> MapValue {
    let fields: BTreeMap<String, FirestoreValue> = entries
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect();
    MapValue::new(fields)
}

pub fn doc(path: &str, seconds: i64, data: MapValue) -> Document {
    Document::new_found_document(key(path), version(seconds), data)
}

pub fn deleted_doc(path: &str, seconds: i64) -> Document {
    Document::new_no_document(key(path), version(seconds))
}

pub fn query(path_str: &str) -> Query {
    Query::collection(path(path_str))
}

pub fn set_mutation(path: &str, data: MapValue) -> Mutation {
    Mutation::set(key(path), data)
}

pub fn patch_mutation(path: &str, data: MapValue, mask: &[&str]) -> Mutation {
    Mutation::patch(key(path), data, FieldMask::new(mask.iter().map(|f| field(f))))
}

pub fn delete_mutation(path: &str) -> Mutation {
    Mutation::delete(key(path))
}
