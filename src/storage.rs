use std::io::{self, ErrorKind};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tokio::fs::{self, File};
use tokio::io::AsyncRead;
use tracing::debug;

use crate::atomic::AtomicFile;
use crate::config::CHUNK_DIR_NAME;
use crate::error::UploadError;
use crate::key::SessionKey;

/// Filesystem-backed chunk store.
///
/// Layout: merged files live directly under `root`, chunks live under
/// `root/.chunks/<filename>-<fileHash>/<fileHash>-<index>`.
#[derive(Clone, Debug)]
pub struct ChunkStore {
    root: PathBuf,
}

/// A session directory discovered on disk.
#[derive(Debug)]
pub struct StoredSession {
    pub key: SessionKey,
    pub modified: SystemTime,
}

impl ChunkStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(self.chunk_root()).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn chunk_root(&self) -> PathBuf {
        self.root.join(CHUNK_DIR_NAME)
    }

    pub fn session_dir(&self, key: &SessionKey) -> PathBuf {
        self.chunk_root().join(key.dir_name())
    }

    pub fn chunk_path(&self, key: &SessionKey, index: u64) -> PathBuf {
        self.session_dir(key).join(key.chunk_file_name(index))
    }

    /// Final location of a merged file.
    pub fn output_path(&self, filename: &str) -> Result<PathBuf, UploadError> {
        let mut components = Path::new(filename).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(segment)), None) => Ok(self.root.join(segment)),
            _ => Err(UploadError::MalformedKey(format!(
                "filename {filename:?} is not a plain file name"
            ))),
        }
    }

    /// 流式写入单个分片，写完后原子替换同下标的旧分片。
    pub async fn save<R>(
        &self,
        key: &SessionKey,
        index: u64,
        reader: R,
        max_len: u64,
    ) -> Result<u64, UploadError>
    where
        R: AsyncRead + Unpin,
    {
        fs::create_dir_all(self.session_dir(key)).await?;
        let target = self.chunk_path(key, index);
        let mut atomic = AtomicFile::new(&target).await?;
        let written = match atomic.write_from(reader, max_len).await {
            Ok(written) => written,
            Err(err) => {
                atomic.cleanup().await;
                return Err(UploadError::StorageFailure(err));
            }
        };
        if max_len > 0 && written > max_len {
            atomic.cleanup().await;
            return Err(UploadError::ChunkTooLarge { limit: max_len });
        }
        atomic.finalize().await?;
        debug!(session = %key, index, bytes = written, "chunk stored");
        Ok(written)
    }

    /// 列出会话已保存的分片下标（无序）；会话目录不存在时返回空。
    pub async fn list_indices(&self, key: &SessionKey) -> Result<Vec<u64>, UploadError> {
        let mut dir = match fs::read_dir(self.session_dir(key)).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut indices = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            if let Some(index) = key.parse_chunk_file_name(&name.to_string_lossy()) {
                indices.push(index);
            }
        }
        Ok(indices)
    }

    pub async fn chunk_len(&self, key: &SessionKey, index: u64) -> Result<u64, UploadError> {
        Ok(fs::metadata(self.chunk_path(key, index)).await?.len())
    }

    pub async fn open_chunk(&self, key: &SessionKey, index: u64) -> io::Result<File> {
        File::open(self.chunk_path(key, index)).await
    }

    /// 删除会话的全部分片及目录；会话不存在时什么也不做。
    pub async fn purge(&self, key: &SessionKey) -> Result<(), UploadError> {
        match fs::remove_dir_all(self.session_dir(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn session_exists(&self, key: &SessionKey) -> bool {
        fs::metadata(self.session_dir(key))
            .await
            .map(|metadata| metadata.is_dir())
            .unwrap_or(false)
    }

    /// 枚举磁盘上的会话目录，忽略无法识别的条目。
    pub async fn list_sessions(&self) -> io::Result<Vec<StoredSession>> {
        let mut dir = match fs::read_dir(self.chunk_root()).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut sessions = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(key) = SessionKey::from_dir_name(&name.to_string_lossy()) else {
                continue;
            };
            let modified = metadata.modified().unwrap_or_else(|_| SystemTime::now());
            sessions.push(StoredSession { key, modified });
        }
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_store() -> (tempfile::TempDir, ChunkStore) {
        let temp = tempdir().expect("tempdir");
        let store = ChunkStore::new(temp.path().join("resources"));
        (temp, store)
    }

    fn key() -> SessionKey {
        SessionKey::new("movie.mkv", "c0ffee").expect("key")
    }

    #[tokio::test]
    async fn save_creates_session_dir_and_lists_indices() {
        let (_temp, store) = make_store();
        let key = key();
        store.save(&key, 2, &b"cc"[..], 0).await.expect("save 2");
        store.save(&key, 0, &b"aa"[..], 0).await.expect("save 0");

        let mut indices = store.list_indices(&key).await.expect("list");
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 2]);
        assert_eq!(
            fs::read(store.chunk_path(&key, 2)).await.expect("read"),
            b"cc"
        );
        assert!(
            store
                .chunk_path(&key, 2)
                .ends_with(".chunks/movie.mkv-c0ffee/c0ffee-2")
        );
    }

    #[tokio::test]
    async fn resave_overwrites_same_index() {
        let (_temp, store) = make_store();
        let key = key();
        store.save(&key, 1, &b"first"[..], 0).await.expect("save");
        store.save(&key, 1, &b"2nd"[..], 0).await.expect("resave");

        assert_eq!(store.list_indices(&key).await.expect("list"), vec![1]);
        assert_eq!(store.chunk_len(&key, 1).await.expect("len"), 3);
    }

    #[tokio::test]
    async fn list_indices_of_missing_session_is_empty() {
        let (_temp, store) = make_store();
        assert!(store.list_indices(&key()).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn list_indices_skips_foreign_entries() {
        let (_temp, store) = make_store();
        let key = key();
        store.save(&key, 0, &b"a"[..], 0).await.expect("save");
        let dir = store.session_dir(&key);
        fs::write(dir.join(".c0ffee-1.tmp.abc"), b"partial")
            .await
            .expect("write temp");
        fs::write(dir.join("notes.txt"), b"x").await.expect("write");

        assert_eq!(store.list_indices(&key).await.expect("list"), vec![0]);
    }

    #[tokio::test]
    async fn oversized_chunk_is_rejected_without_leftovers() {
        let (_temp, store) = make_store();
        let key = key();
        let result = store.save(&key, 0, &b"0123456789"[..], 4).await;
        assert!(matches!(result, Err(UploadError::ChunkTooLarge { limit: 4 })));
        assert!(store.list_indices(&key).await.expect("list").is_empty());

        let mut dir = fs::read_dir(store.session_dir(&key)).await.expect("dir");
        assert!(dir.next_entry().await.expect("entry").is_none());
    }

    #[tokio::test]
    async fn chunk_at_limit_is_accepted() {
        let (_temp, store) = make_store();
        let written = store.save(&key(), 0, &b"0123"[..], 4).await.expect("save");
        assert_eq!(written, 4);
    }

    #[tokio::test]
    async fn purge_is_idempotent() {
        let (_temp, store) = make_store();
        let key = key();
        store.save(&key, 0, &b"a"[..], 0).await.expect("save");
        store.purge(&key).await.expect("purge");
        store.purge(&key).await.expect("purge again");

        assert!(!store.session_exists(&key).await);
        assert!(store.list_indices(&key).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn sessions_are_rediscovered_from_disk() {
        let (_temp, store) = make_store();
        store.ensure_root().await.expect("root");
        let first = SessionKey::new("a-b.txt", "01").expect("key");
        let second = SessionKey::new("c.txt", "02").expect("key");
        store.save(&first, 0, &b"x"[..], 0).await.expect("save");
        store.save(&second, 0, &b"y"[..], 0).await.expect("save");
        fs::create_dir_all(store.chunk_root().join("garbage"))
            .await
            .expect("mkdir");

        let mut keys: Vec<String> = store
            .list_sessions()
            .await
            .expect("sessions")
            .into_iter()
            .map(|session| session.key.to_string())
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["a-b.txt-01", "c.txt-02"]);
    }

    #[test]
    fn output_path_rejects_nested_names() {
        let store = ChunkStore::new(PathBuf::from("/srv/resources"));
        assert_eq!(
            store.output_path("movie.mkv").expect("path"),
            PathBuf::from("/srv/resources/movie.mkv")
        );
        assert!(store.output_path("../movie.mkv").is_err());
        assert!(store.output_path("a/b").is_err());
    }
}
