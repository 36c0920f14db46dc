//! 会话级读写闸门：分片写入共享，合并与清理独占。

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::error::UploadError;
use crate::key::SessionKey;

/// Per-session gates. Acquisition never waits: a held gate yields
/// `SessionBusy` so unrelated sessions are never blocked.
#[derive(Debug, Default)]
pub struct SessionLocks {
    gates: Mutex<HashMap<SessionKey, Arc<RwLock<()>>>>,
    /// 合并目标文件名 -> 写入闸门；不同哈希的会话可能指向同一输出文件。
    outputs: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    /// 创建新的闸门管理器实例。
    pub fn new() -> Self {
        Self {
            gates: Mutex::new(HashMap::new()),
            outputs: Mutex::new(HashMap::new()),
        }
    }

    async fn gate(&self, key: &SessionKey) -> Arc<RwLock<()>> {
        let mut gates = self.gates.lock().await;
        gates
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Shared guard held while a chunk is written.
    pub async fn try_shared(
        &self,
        key: &SessionKey,
    ) -> Result<OwnedRwLockReadGuard<()>, UploadError> {
        self.gate(key)
            .await
            .try_read_owned()
            .map_err(|_| UploadError::SessionBusy(key.to_string()))
    }

    /// Exclusive guard held by merge and abandon.
    pub async fn try_exclusive(
        &self,
        key: &SessionKey,
    ) -> Result<OwnedRwLockWriteGuard<()>, UploadError> {
        self.gate(key)
            .await
            .try_write_owned()
            .map_err(|_| UploadError::SessionBusy(key.to_string()))
    }

    /// Exclusive guard on a merge output file, held while it is written.
    pub async fn try_output(&self, filename: &str) -> Result<OwnedMutexGuard<()>, UploadError> {
        let gate = self
            .outputs
            .lock()
            .await
            .entry(filename.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        gate.try_lock_owned()
            .map_err(|_| UploadError::SessionBusy(filename.to_string()))
    }

    /// 释放无人持有的闸门条目。
    pub async fn prune(&self) {
        self.gates
            .lock()
            .await
            .retain(|_, gate| Arc::strong_count(gate) > 1);
        self.outputs
            .lock()
            .await
            .retain(|_, gate| Arc::strong_count(gate) > 1);
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.gates.lock().await.len() + self.outputs.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SessionKey {
        SessionKey::new("a.bin", "ff").expect("key")
    }

    #[tokio::test]
    async fn shared_guards_coexist() {
        let locks = SessionLocks::new();
        let first = locks.try_shared(&key()).await.expect("first");
        let second = locks.try_shared(&key()).await.expect("second");
        assert!(matches!(
            locks.try_exclusive(&key()).await,
            Err(UploadError::SessionBusy(_))
        ));
        drop((first, second));
        assert!(locks.try_exclusive(&key()).await.is_ok());
    }

    #[tokio::test]
    async fn exclusive_guard_rejects_everyone_else() {
        let locks = SessionLocks::new();
        let guard = locks.try_exclusive(&key()).await.expect("exclusive");
        assert!(matches!(
            locks.try_shared(&key()).await,
            Err(UploadError::SessionBusy(_))
        ));
        assert!(matches!(
            locks.try_exclusive(&key()).await,
            Err(UploadError::SessionBusy(_))
        ));

        let other = SessionKey::new("b.bin", "ff").expect("key");
        assert!(locks.try_exclusive(&other).await.is_ok());
        drop(guard);
    }

    #[tokio::test]
    async fn output_gate_is_shared_across_hashes() {
        let locks = SessionLocks::new();
        let _first = locks.try_exclusive(&key()).await.expect("first session");
        let second = SessionKey::new("a.bin", "ee").expect("key");
        let _second = locks.try_exclusive(&second).await.expect("second session");

        let output = locks.try_output("a.bin").await.expect("output");
        assert!(matches!(
            locks.try_output("a.bin").await,
            Err(UploadError::SessionBusy(_))
        ));
        assert!(locks.try_output("b.bin").await.is_ok());
        drop(output);
        assert!(locks.try_output("a.bin").await.is_ok());
    }

    #[tokio::test]
    async fn prune_keeps_held_gates_only() {
        let locks = SessionLocks::new();
        let held = locks.try_shared(&key()).await.expect("shared");
        drop(
            locks
                .try_shared(&SessionKey::new("b.bin", "ff").expect("key"))
                .await,
        );
        assert_eq!(locks.len().await, 2);

        locks.prune().await;
        assert_eq!(locks.len().await, 1);
        drop(held);
        locks.prune().await;
        assert_eq!(locks.len().await, 0);
    }
}
