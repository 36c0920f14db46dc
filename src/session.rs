//! 上传会话登记表：进程内缓存，可从磁盘分片目录重建。

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::UploadError;
use crate::key::SessionKey;
use crate::storage::ChunkStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Merging,
}

/// Sizes a client may declare alongside a chunk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UploadDeclaration {
    pub chunk_size: Option<u64>,
    pub total_size: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct SessionEntry {
    pub filename: String,
    pub file_hash: String,
    pub chunk_size: Option<u64>,
    pub total_size: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub chunks_recorded: u64,
    pub state: SessionState,
}

impl SessionEntry {
    fn new(key: &SessionKey, declared: UploadDeclaration, created_at: DateTime<Utc>) -> Self {
        Self {
            filename: key.filename().to_string(),
            file_hash: key.file_hash().to_string(),
            chunk_size: declared.chunk_size,
            total_size: declared.total_size,
            created_at,
            last_activity: created_at,
            chunks_recorded: 0,
            state: SessionState::Open,
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionTracker {
    sessions: Mutex<HashMap<SessionKey, SessionEntry>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// 记录一次分片写入。首次写入创建会话，之后的尺寸声明被忽略。
    /// Returns true when the entry was created by this call.
    pub async fn record_chunk(&self, key: &SessionKey, declared: UploadDeclaration) -> bool {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().await;
        let created = !sessions.contains_key(key);
        let entry = sessions
            .entry(key.clone())
            .or_insert_with(|| SessionEntry::new(key, declared, now));
        entry.chunks_recorded += 1;
        entry.last_activity = now;
        if created {
            info!(session = %key, "upload session opened");
        }
        created
    }

    pub async fn get(&self, key: &SessionKey) -> Result<SessionEntry, UploadError> {
        self.sessions
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| UploadError::SessionNotFound(key.to_string()))
    }

    pub async fn remove(&self, key: &SessionKey) -> Option<SessionEntry> {
        self.sessions.lock().await.remove(key)
    }

    /// 更新会话状态；会话不存在时返回 false。
    pub async fn set_state(&self, key: &SessionKey, state: SessionState) -> bool {
        match self.sessions.lock().await.get_mut(key) {
            Some(entry) => {
                entry.state = state;
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Keys of open sessions idle for more than `ttl`.
    pub async fn stale_keys(&self, ttl: Duration) -> Vec<SessionKey> {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return Vec::new();
        };
        let cutoff = Utc::now() - ttl;
        self.sessions
            .lock()
            .await
            .iter()
            .filter(|(_, entry)| entry.state == SessionState::Open && entry.last_activity <= cutoff)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// 从磁盘上的分片目录重建会话登记，返回新建条目数。
    pub async fn recover_from(&self, store: &ChunkStore) -> std::io::Result<usize> {
        let stored = store.list_sessions().await?;
        let mut sessions = self.sessions.lock().await;
        let mut recovered = 0;
        for session in stored {
            if sessions.contains_key(&session.key) {
                continue;
            }
            let created_at: DateTime<Utc> = session.modified.into();
            let entry = SessionEntry::new(&session.key, UploadDeclaration::default(), created_at);
            sessions.insert(session.key, entry);
            recovered += 1;
        }
        if recovered > 0 {
            info!(recovered, "recovered upload sessions from disk");
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn key(name: &str) -> SessionKey {
        SessionKey::new(name, "ab12").expect("key")
    }

    #[tokio::test]
    async fn first_declaration_wins() {
        let tracker = SessionTracker::new();
        let key = key("a.bin");
        let first = UploadDeclaration {
            chunk_size: Some(4),
            total_size: Some(10),
        };
        let later = UploadDeclaration {
            chunk_size: Some(8),
            total_size: None,
        };
        assert!(tracker.record_chunk(&key, first).await);
        assert!(!tracker.record_chunk(&key, later).await);

        let entry = tracker.get(&key).await.expect("entry");
        assert_eq!(entry.chunk_size, Some(4));
        assert_eq!(entry.total_size, Some(10));
        assert_eq!(entry.chunks_recorded, 2);
        assert_eq!(entry.state, SessionState::Open);
    }

    #[tokio::test]
    async fn removed_session_is_not_found() {
        let tracker = SessionTracker::new();
        let key = key("a.bin");
        tracker.record_chunk(&key, UploadDeclaration::default()).await;
        assert!(tracker.remove(&key).await.is_some());
        assert!(matches!(
            tracker.get(&key).await,
            Err(UploadError::SessionNotFound(_))
        ));
        assert!(!tracker.set_state(&key, SessionState::Merging).await);
    }

    #[tokio::test]
    async fn concurrent_first_chunks_do_not_race() {
        let tracker = Arc::new(SessionTracker::new());
        let mut handles = Vec::new();
        for file in 0..16 {
            for _ in 0..4 {
                let tracker = tracker.clone();
                handles.push(tokio::spawn(async move {
                    let key = key(&format!("file{file}.bin"));
                    tracker.record_chunk(&key, UploadDeclaration::default()).await
                }));
            }
        }
        let mut created = 0;
        for handle in handles {
            if handle.await.expect("join") {
                created += 1;
            }
        }
        assert_eq!(created, 16);
        assert_eq!(tracker.len().await, 16);
        let entry = tracker.get(&key("file3.bin")).await.expect("entry");
        assert_eq!(entry.chunks_recorded, 4);
    }

    #[tokio::test]
    async fn stale_keys_skip_merging_sessions() {
        let tracker = SessionTracker::new();
        let open = key("open.bin");
        let merging = key("merging.bin");
        tracker.record_chunk(&open, UploadDeclaration::default()).await;
        tracker.record_chunk(&merging, UploadDeclaration::default()).await;
        tracker.set_state(&merging, SessionState::Merging).await;

        assert_eq!(tracker.stale_keys(Duration::ZERO).await, vec![open]);
        assert!(tracker.stale_keys(Duration::from_secs(3600)).await.is_empty());
    }

    #[tokio::test]
    async fn recovers_sessions_from_chunk_directories() {
        let temp = tempdir().expect("tempdir");
        let store = ChunkStore::new(temp.path().to_path_buf());
        let key = key("restart.bin");
        store.save(&key, 0, &b"x"[..], 0).await.expect("save");

        let tracker = SessionTracker::new();
        assert_eq!(tracker.recover_from(&store).await.expect("recover"), 1);
        assert_eq!(tracker.recover_from(&store).await.expect("recover"), 0);
        let entry = tracker.get(&key).await.expect("entry");
        assert_eq!(entry.filename, "restart.bin");
        assert_eq!(entry.chunk_size, None);
    }
}
