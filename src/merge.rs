//! 分片合并：按下标升序写入目标文件的确定偏移，成功后清理分片。

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{info, warn};

use crate::error::UploadError;
use crate::key::SessionKey;
use crate::locking::SessionLocks;
use crate::session::{SessionState, SessionTracker};
use crate::storage::ChunkStore;

#[derive(Debug)]
pub struct MergeOutcome {
    pub path: PathBuf,
    pub size: u64,
}

/// Stored chunk scheduled for the merge, with its verified length.
struct PlannedChunk {
    index: u64,
    offset: u64,
    len: u64,
}

pub struct MergeEngine {
    store: Arc<ChunkStore>,
    tracker: Arc<SessionTracker>,
    locks: Arc<SessionLocks>,
}

impl MergeEngine {
    pub fn new(
        store: Arc<ChunkStore>,
        tracker: Arc<SessionTracker>,
        locks: Arc<SessionLocks>,
    ) -> Self {
        Self {
            store,
            tracker,
            locks,
        }
    }

    /// 合并会话的全部分片。任一失败都保留分片以便重试。
    pub async fn merge(
        &self,
        key: &SessionKey,
        declared_chunk_size: u64,
    ) -> Result<MergeOutcome, UploadError> {
        let guard = self.locks.try_exclusive(key).await?;
        let tracked = self.tracker.set_state(key, SessionState::Merging).await;

        let result = self.merge_locked(key, declared_chunk_size).await;
        match &result {
            Ok(outcome) => {
                let entry = self.tracker.remove(key).await;
                info!(
                    session = %key,
                    path = ?outcome.path,
                    size = outcome.size,
                    opened_at = ?entry.as_ref().map(|entry| entry.created_at),
                    chunk_writes = entry.as_ref().map(|entry| entry.chunks_recorded),
                    "merge complete"
                );
            }
            Err(err) => {
                if tracked {
                    self.tracker.set_state(key, SessionState::Open).await;
                }
                warn!(session = %key, error = %err, "merge rejected");
            }
        }

        drop(guard);
        self.locks.prune().await;
        result
    }

    async fn merge_locked(
        &self,
        key: &SessionKey,
        declared_chunk_size: u64,
    ) -> Result<MergeOutcome, UploadError> {
        let tracked = self.tracker.get(key).await.ok();
        let mut indices = self.store.list_indices(key).await?;
        if indices.is_empty() {
            return Err(UploadError::NoChunksFound(key.to_string()));
        }
        indices.sort_unstable();
        if let Some(missing) = first_gap(&indices) {
            return Err(UploadError::IncompleteUpload {
                key: key.to_string(),
                missing,
            });
        }
        let chunk_size = match declared_chunk_size {
            0 => tracked
                .as_ref()
                .and_then(|entry| entry.chunk_size)
                .unwrap_or(0),
            size => size,
        };
        if chunk_size == 0 {
            return Err(UploadError::merge_failed(
                None,
                "declared chunk size must be positive",
            ));
        }

        let plan = self.plan(key, &indices, chunk_size).await?;
        let total: u64 = plan.iter().map(|chunk| chunk.len).sum();
        if let Some(entry) = &tracked
            && let Some(expected) = entry.total_size
            && expected != total
        {
            return Err(UploadError::merge_failed(
                None,
                format!("chunks hold {total} bytes but {expected} were declared"),
            ));
        }

        let target = self.store.output_path(key.filename())?;
        let _output = self.locks.try_output(key.filename()).await?;
        self.write_output(key, &target, &plan).await?;

        self.store
            .purge(key)
            .await
            .map_err(|err| UploadError::merge_failed(None, err))?;
        Ok(MergeOutcome {
            path: target,
            size: total,
        })
    }

    /// 校验每个分片长度：非末尾分片必须等于声明大小，末尾分片不得超过。
    async fn plan(
        &self,
        key: &SessionKey,
        indices: &[u64],
        chunk_size: u64,
    ) -> Result<Vec<PlannedChunk>, UploadError> {
        let last = indices.len() - 1;
        let mut plan = Vec::with_capacity(indices.len());
        for (position, &index) in indices.iter().enumerate() {
            let len = self
                .store
                .chunk_len(key, index)
                .await
                .map_err(|err| UploadError::merge_failed(Some(index), err))?;
            let fits = if position == last {
                len <= chunk_size
            } else {
                len == chunk_size
            };
            if !fits {
                return Err(UploadError::ChunkSizeMismatch {
                    index,
                    expected: chunk_size,
                    actual: len,
                });
            }
            let offset = index.checked_mul(chunk_size).ok_or_else(|| {
                UploadError::merge_failed(Some(index), "chunk offset overflows")
            })?;
            plan.push(PlannedChunk { index, offset, len });
        }
        Ok(plan)
    }

    async fn write_output(
        &self,
        key: &SessionKey,
        target: &Path,
        plan: &[PlannedChunk],
    ) -> Result<(), UploadError> {
        let mut output = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(target)
            .await
            .map_err(|err| UploadError::merge_failed(None, err))?;

        for chunk in plan {
            let failed = |err: std::io::Error| UploadError::merge_failed(Some(chunk.index), err);
            let mut part = self.store.open_chunk(key, chunk.index).await.map_err(failed)?;
            output
                .seek(SeekFrom::Start(chunk.offset))
                .await
                .map_err(failed)?;
            let copied = tokio::io::copy(&mut part, &mut output)
                .await
                .map_err(failed)?;
            if copied != chunk.len {
                return Err(UploadError::merge_failed(
                    Some(chunk.index),
                    format!("copied {copied} bytes, expected {}", chunk.len),
                ));
            }
        }

        output
            .flush()
            .await
            .map_err(|err| UploadError::merge_failed(None, err))?;
        output
            .sync_all()
            .await
            .map_err(|err| UploadError::merge_failed(None, err))?;
        Ok(())
    }
}

/// Returns the first index missing from a sorted index list starting at 0.
fn first_gap(sorted: &[u64]) -> Option<u64> {
    sorted
        .iter()
        .zip(0u64..)
        .find(|(index, expected)| **index != *expected)
        .map(|(_, expected)| expected)
}
