//! 统一的错误类型：核心上传错误与 API 响应转换。

use axum::Json;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::io;
use thiserror::Error;

use crate::config::BUSY_RETRY_AFTER_SECS;

/// Typed failures produced by ingestion and merge.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("malformed chunk key: {0}")]
    MalformedKey(String),

    #[error("storage failure: {0}")]
    StorageFailure(#[from] io::Error),

    #[error("chunk exceeds {limit} bytes")]
    ChunkTooLarge { limit: u64 },

    #[error("chunk index {index} exceeds limit of {limit} chunks")]
    TooManyChunks { index: u64, limit: u64 },

    #[error("no chunks found for {0}")]
    NoChunksFound(String),

    #[error("upload {key} is incomplete: chunk {missing} is missing")]
    IncompleteUpload { key: String, missing: u64 },

    #[error("chunk {index} has {actual} bytes, expected {expected}")]
    ChunkSizeMismatch {
        index: u64,
        expected: u64,
        actual: u64,
    },

    #[error("merge failed{}: {reason}", describe_index(.index))]
    MergeFailed { index: Option<u64>, reason: String },

    #[error("session {0} is busy")]
    SessionBusy(String),

    #[error("session {0} not found")]
    SessionNotFound(String),
}

fn describe_index(index: &Option<u64>) -> String {
    match index {
        Some(index) => format!(" at chunk {index}"),
        None => String::new(),
    }
}

impl UploadError {
    pub(crate) fn merge_failed(index: Option<u64>, reason: impl ToString) -> Self {
        UploadError::MergeFailed {
            index,
            reason: reason.to_string(),
        }
    }
}

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
    PayloadTooLarge(String),
    Busy(String, u64),
}

#[derive(Serialize)]
struct ErrorBody {
    code: u16,
    message: String,
}

fn error_response(status: StatusCode, headers: HeaderMap, message: String) -> Response {
    let body = ErrorBody {
        code: status.as_u16(),
        message,
    };
    (status, headers, Json(body)).into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => {
                error_response(StatusCode::BAD_REQUEST, HeaderMap::new(), msg)
            }
            ApiError::NotFound(msg) => error_response(StatusCode::NOT_FOUND, HeaderMap::new(), msg),
            ApiError::Internal(msg) => {
                error_response(StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new(), msg)
            }
            ApiError::PayloadTooLarge(msg) => {
                error_response(StatusCode::PAYLOAD_TOO_LARGE, HeaderMap::new(), msg)
            }
            ApiError::Busy(msg, retry_after) => {
                let mut headers = HeaderMap::new();
                if retry_after > 0
                    && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
                {
                    headers.insert(header::RETRY_AFTER, value);
                }
                error_response(StatusCode::CONFLICT, headers, msg)
            }
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(error: UploadError) -> Self {
        let message = error.to_string();
        match error {
            UploadError::MalformedKey(_)
            | UploadError::TooManyChunks { .. }
            | UploadError::IncompleteUpload { .. }
            | UploadError::ChunkSizeMismatch { .. } => ApiError::BadRequest(message),
            UploadError::NoChunksFound(_) | UploadError::SessionNotFound(_) => {
                ApiError::NotFound(message)
            }
            UploadError::ChunkTooLarge { .. } => ApiError::PayloadTooLarge(message),
            UploadError::SessionBusy(_) => ApiError::Busy(message, BUSY_RETRY_AFTER_SECS),
            UploadError::StorageFailure(_) | UploadError::MergeFailed { .. } => {
                ApiError::Internal(message)
            }
        }
    }
}
