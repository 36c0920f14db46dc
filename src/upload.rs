//! 分片上传、合并与放弃的 HTTP 处理器。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Json, Multipart, Path, Query};
use axum::http::StatusCode;
use axum::response::Json as JsonResponse;
use futures_util::TryStreamExt;
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use std::io;
use std::pin::pin;
use std::sync::Arc;
use tokio_util::io::StreamReader;
use tracing::info;

use crate::error::ApiError;
use crate::ingest::{IngestCoordinator, IngestReceipt};
use crate::key::SessionKey;
use crate::merge::MergeEngine;
use crate::session::UploadDeclaration;

const SUCCESS_CODE: u32 = 2000;

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DeclarationQuery {
    chunk_size: Option<u64>,
    total_size: Option<u64>,
}

impl DeclarationQuery {
    fn declaration(&self) -> UploadDeclaration {
        UploadDeclaration {
            chunk_size: self.chunk_size,
            total_size: self.total_size,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ChunkSummary {
    filename: String,
    file_hash: String,
    index: u64,
    size: u64,
}

impl From<IngestReceipt> for ChunkSummary {
    fn from(receipt: IngestReceipt) -> Self {
        Self {
            filename: receipt.session.filename().to_string(),
            file_hash: receipt.session.file_hash().to_string(),
            index: receipt.index,
            size: receipt.bytes,
        }
    }
}

#[derive(Serialize)]
pub(crate) struct UploadResponse {
    code: u32,
    message: &'static str,
    data: Vec<ChunkSummary>,
}

impl UploadResponse {
    fn new(data: Vec<ChunkSummary>) -> Self {
        Self {
            code: SUCCESS_CODE,
            message: "upload successfully",
            data,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MergeRequest {
    filename: String,
    file_hash: String,
    #[serde(default)]
    size: u64,
}

#[derive(Serialize)]
pub(crate) struct MergeData {
    code: u32,
    filename: String,
    size: u64,
}

#[derive(Serialize)]
pub(crate) struct MergeResponse {
    data: MergeData,
    message: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AbortRequest {
    filename: String,
    file_hash: String,
}

/// 接收 multipart 表单中的分片，字段名即分片键。
pub async fn upload_chunks(
    Query(query): Query<DeclarationQuery>,
    Extension(coordinator): Extension<Arc<IngestCoordinator>>,
    mut multipart: Multipart,
) -> Result<JsonResponse<UploadResponse>, ApiError> {
    let declared = query.declaration();
    let mut received = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(err.body_text()))?
    {
        if field.file_name().is_none() {
            continue;
        }
        let raw_key = field
            .name()
            .map(str::to_string)
            .ok_or_else(|| ApiError::BadRequest("chunk field name is required".into()))?;
        let reader = pin!(StreamReader::new(field.map_err(io::Error::other)));
        let receipt = coordinator.ingest(&raw_key, declared, reader).await?;
        received.push(ChunkSummary::from(receipt));
    }

    if received.is_empty() {
        return Err(ApiError::BadRequest("no chunk in request".into()));
    }
    Ok(JsonResponse(UploadResponse::new(received)))
}

/// 以原始请求体上传单个分片，路径参数即分片键。
pub async fn upload_chunk_raw(
    Path(raw_key): Path<String>,
    Query(query): Query<DeclarationQuery>,
    Extension(coordinator): Extension<Arc<IngestCoordinator>>,
    body: AxumBody,
) -> Result<JsonResponse<UploadResponse>, ApiError> {
    let stream = BodyExt::into_data_stream(body).map_err(io::Error::other);
    let reader = pin!(StreamReader::new(stream));
    let receipt = coordinator
        .ingest(&raw_key, query.declaration(), reader)
        .await?;
    Ok(JsonResponse(UploadResponse::new(vec![receipt.into()])))
}

/// 合并分片，返回最终文件名与大小。
pub async fn merge_chunks(
    Extension(engine): Extension<Arc<MergeEngine>>,
    Json(payload): Json<MergeRequest>,
) -> Result<JsonResponse<MergeResponse>, ApiError> {
    let key = SessionKey::new(payload.filename.trim(), payload.file_hash.trim())?;
    let outcome = engine.merge(&key, payload.size).await?;
    info!(
        filename = key.filename(),
        size = outcome.size,
        "merge request served"
    );
    Ok(JsonResponse(MergeResponse {
        data: MergeData {
            code: SUCCESS_CODE,
            filename: key.filename().to_string(),
            size: outcome.size,
        },
        message: "merge chunks successful",
    }))
}

/// 放弃上传并清理分片。
pub async fn abort_upload(
    Extension(coordinator): Extension<Arc<IngestCoordinator>>,
    Json(payload): Json<AbortRequest>,
) -> Result<StatusCode, ApiError> {
    let key = SessionKey::new(payload.filename.trim(), payload.file_hash.trim())?;
    coordinator.abandon(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}
