use serde::Deserialize;

use crate::error::{FirestoreError, FirestoreErrorCode};

/// `google.rpc.Status` as it appears in stream payloads.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcStatus {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: Option<String>,
}

impl RpcStatus {
    pub fn into_error(self) -> Option<FirestoreError> {
        map_grpc_status(self.code, self.message)
    }
}

/// Maps a numeric gRPC status to an error; `OK` maps to `None`.
pub fn map_grpc_status(code: i32, message: Option<String>) -> Option<FirestoreError> {
    let code = code_from_grpc(code)?;
    let message = message.unwrap_or_else(|| format!("stream failed with {}", code.as_str()));
    Some(FirestoreError::new(code, message))
}

pub fn code_from_grpc(code: i32) -> Option<FirestoreErrorCode> {
    let code = match code {
        0 => return None,
        1 => FirestoreErrorCode::Cancelled,
        2 => FirestoreErrorCode::Unknown,
        3 => FirestoreErrorCode::InvalidArgument,
        4 => FirestoreErrorCode::DeadlineExceeded,
        5 => FirestoreErrorCode::NotFound,
        6 => FirestoreErrorCode::AlreadyExists,
        7 => FirestoreErrorCode::PermissionDenied,
        8 => FirestoreErrorCode::ResourceExhausted,
        9 => FirestoreErrorCode::FailedPrecondition,
        10 => FirestoreErrorCode::Aborted,
        11 => FirestoreErrorCode::OutOfRange,
        12 => FirestoreErrorCode::Unimplemented,
        13 => FirestoreErrorCode::Internal,
        14 => FirestoreErrorCode::Unavailable,
        15 => FirestoreErrorCode::DataLoss,
        16 => FirestoreErrorCode::Unauthenticated,
        _ => FirestoreErrorCode::Unknown,
    };
    Some(code)
}

pub fn code_to_grpc(code: FirestoreErrorCode) -> i32 {
    match code {
        FirestoreErrorCode::Cancelled => 1,
        FirestoreErrorCode::Unknown => 2,
        FirestoreErrorCode::InvalidArgument => 3,
        FirestoreErrorCode::DeadlineExceeded => 4,
        FirestoreErrorCode::NotFound => 5,
        FirestoreErrorCode::AlreadyExists => 6,
        FirestoreErrorCode::PermissionDenied => 7,
        FirestoreErrorCode::ResourceExhausted => 8,
        FirestoreErrorCode::FailedPrecondition => 9,
        FirestoreErrorCode::Aborted => 10,
        FirestoreErrorCode::OutOfRange => 11,
        FirestoreErrorCode::Unimplemented => 12,
        FirestoreErrorCode::Internal => 13,
        FirestoreErrorCode::Unavailable => 14,
        FirestoreErrorCode::DataLoss => 15,
        FirestoreErrorCode::Unauthenticated => 16,
        // Never produced by a server.
        FirestoreErrorCode::StorageTransaction => 2,
    }
}

/// Maps a textual status (`"PERMISSION_DENIED"`) as used by the REST surface.
pub fn code_from_status_name(status: &str) -> FirestoreErrorCode {
    match status {
        "CANCELLED" => FirestoreErrorCode::Cancelled,
        "INVALID_ARGUMENT" => FirestoreErrorCode::InvalidArgument,
        "DEADLINE_EXCEEDED" => FirestoreErrorCode::DeadlineExceeded,
        "NOT_FOUND" => FirestoreErrorCode::NotFound,
        "ALREADY_EXISTS" => FirestoreErrorCode::AlreadyExists,
        "PERMISSION_DENIED" => FirestoreErrorCode::PermissionDenied,
        "RESOURCE_EXHAUSTED" => FirestoreErrorCode::ResourceExhausted,
        "FAILED_PRECONDITION" => FirestoreErrorCode::FailedPrecondition,
        "ABORTED" => FirestoreErrorCode::Aborted,
        "OUT_OF_RANGE" => FirestoreErrorCode::OutOfRange,
        "UNIMPLEMENTED" => FirestoreErrorCode::Unimplemented,
        "INTERNAL" => FirestoreErrorCode::Internal,
        "UNAVAILABLE" => FirestoreErrorCode::Unavailable,
        "DATA_LOSS" => FirestoreErrorCode::DataLoss,
        "UNAUTHENTICATED" => FirestoreErrorCode::Unauthenticated,
        _ => FirestoreErrorCode::Unknown,
    }
}
