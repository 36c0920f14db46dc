//! 分片接收入口：解析键、写入分片并登记会话。

use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, info};

use crate::error::UploadError;
use crate::key::{SessionKey, parse_chunk_key};
use crate::locking::SessionLocks;
use crate::session::{SessionTracker, UploadDeclaration};
use crate::storage::ChunkStore;

#[derive(Debug)]
pub struct UploadConfig {
    pub max_chunk_size: u64,
    pub max_chunks: u64,
}

/// Result of one successful chunk write.
#[derive(Debug, PartialEq, Eq)]
pub struct IngestReceipt {
    pub session: SessionKey,
    pub index: u64,
    pub bytes: u64,
    pub new_session: bool,
}

pub struct IngestCoordinator {
    store: Arc<ChunkStore>,
    tracker: Arc<SessionTracker>,
    locks: Arc<SessionLocks>,
    config: Arc<UploadConfig>,
}

impl IngestCoordinator {
    pub fn new(
        store: Arc<ChunkStore>,
        tracker: Arc<SessionTracker>,
        locks: Arc<SessionLocks>,
        config: Arc<UploadConfig>,
    ) -> Self {
        Self {
            store,
            tracker,
            locks,
            config,
        }
    }

    /// 接收一个分片。仅在分片落盘后返回成功。
    pub async fn ingest<R>(
        &self,
        raw_key: &str,
        declared: UploadDeclaration,
        reader: R,
    ) -> Result<IngestReceipt, UploadError>
    where
        R: AsyncRead + Unpin,
    {
        let chunk = parse_chunk_key(raw_key)?;
        if self.config.max_chunks > 0 && chunk.index >= self.config.max_chunks {
            return Err(UploadError::TooManyChunks {
                index: chunk.index,
                limit: self.config.max_chunks,
            });
        }

        let _guard = self.locks.try_shared(&chunk.session).await?;
        let bytes = self
            .store
            .save(&chunk.session, chunk.index, reader, self.config.max_chunk_size)
            .await?;
        let new_session = self.tracker.record_chunk(&chunk.session, declared).await;
        debug!(
            session = %chunk.session,
            index = chunk.index,
            bytes,
            "chunk ingested"
        );

        Ok(IngestReceipt {
            session: chunk.session,
            index: chunk.index,
            bytes,
            new_session,
        })
    }

    /// 放弃上传：清理分片与会话登记。
    pub async fn abandon(&self, key: &SessionKey) -> Result<(), UploadError> {
        let guard = self.locks.try_exclusive(key).await?;
        let tracked = self.tracker.remove(key).await.is_some();
        let on_disk = self.store.session_exists(key).await;
        let result = if tracked || on_disk {
            self.store.purge(key).await
        } else {
            Err(UploadError::SessionNotFound(key.to_string()))
        };
        drop(guard);
        self.locks.prune().await;
        result?;

        info!(session = %key, "upload abandoned");
        Ok(())
    }
}
