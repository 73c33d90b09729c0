use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::firestore::error::{FirestoreError, FirestoreErrorCode};

/// JSON form of `google.rpc.Status`.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RpcStatus {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
    /// Canonical code name, present when the status came from a REST proxy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl RpcStatus {
    pub fn from_error(error: &FirestoreError) -> Self {
        Self {
            code: grpc_code(error.code),
            message: error.message().to_string(),
            status: None,
        }
    }

    pub fn into_error(self) -> FirestoreError {
        let code = match self.status.as_deref() {
            Some(status) if self.code == 0 => map_status_code(status),
            _ => FirestoreErrorCode::from_grpc_code(self.code),
        };
        FirestoreError::new(code, self.message)
    }
}

/// Decodes a status object, tolerating malformed payloads as `Unknown`.
pub fn decode_status(value: &JsonValue) -> FirestoreError {
    match serde_json::from_value::<RpcStatus>(value.clone()) {
        Ok(status) => status.into_error(),
        Err(err) => FirestoreError::new(
            FirestoreErrorCode::Unknown,
            format!("Malformed status payload: {err}"),
        ),
    }
}

pub fn encode_status(error: &FirestoreError) -> JsonValue {
    serde_json::to_value(RpcStatus::from_error(error)).unwrap_or(JsonValue::Null)
}

pub fn map_status_code(status: &str) -> FirestoreErrorCode {
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

pub fn grpc_code(code: FirestoreErrorCode) -> i32 {
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
    }
}
