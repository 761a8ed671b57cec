mod database_id;
mod document;
mod document_key;
mod document_set;
mod field_index;
mod field_path;
mod geo_point;
pub mod mutation;
mod mutation_batch;
mod overlay;
mod resource_path;
mod snapshot_version;
mod timestamp;
mod user;

pub use database_id::{DatabaseId, DEFAULT_DATABASE_ID};
pub use document::{Document, DocumentState, DocumentType};
pub use document_key::DocumentKey;
pub use document_set::DocumentSet;
pub use field_index::{FieldIndex, IndexKind, IndexSegment, UNKNOWN_INDEX_ID};
pub use field_path::{FieldPath, IntoFieldPath};
pub use geo_point::GeoPoint;
pub use mutation::{
    DeleteMutation, FieldMask, FieldTransform, Mutation, MutationResult, PatchMutation, Precondition, SetMutation,
    TransformOperation, VerifyMutation,
};
pub use mutation_batch::{MutationBatch, MutationBatchResult};
pub use overlay::{Overlay, OverlayedDocument};
pub use resource_path::ResourcePath;
pub use snapshot_version::SnapshotVersion;
pub use timestamp::Timestamp;
pub use user::User;

pub type TargetId = i32;
pub type BatchId = i32;
pub type ListenSequenceNumber = i64;

/// Batch id used before any batch has been written.
pub const BATCHID_UNKNOWN: BatchId = -1;
pub const INVALID_SEQUENCE_NUMBER: ListenSequenceNumber = -1;
