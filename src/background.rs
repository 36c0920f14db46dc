//! 未合并上传的后台清理任务。

use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

use crate::config::UPLOAD_CLEAN_INTERVAL_SECS;
use crate::locking::SessionLocks;
use crate::session::SessionTracker;
use crate::storage::ChunkStore;

/// 启动后台任务（过期上传清理）。
pub fn spawn_background_tasks(
    store: Arc<ChunkStore>,
    tracker: Arc<SessionTracker>,
    locks: Arc<SessionLocks>,
    ttl: Duration,
) {
    if ttl.is_zero() {
        return;
    }

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(UPLOAD_CLEAN_INTERVAL_SECS));
        loop {
            interval.tick().await;
            if let Err(err) = reap_stale_sessions(&store, &tracker, &locks, ttl).await {
                warn!(error = %err, "stale upload cleanup failed");
            }
        }
    });
}

/// Purges sessions whose chunk directory has not changed for `ttl` and that
/// are not currently being written or merged. Returns the number purged.
pub async fn reap_stale_sessions(
    store: &ChunkStore,
    tracker: &SessionTracker,
    locks: &SessionLocks,
    ttl: Duration,
) -> Result<usize, std::io::Error> {
    if ttl.is_zero() {
        return Ok(0);
    }

    let now = SystemTime::now();
    let mut purged = 0;
    for session in store.list_sessions().await? {
        let age = match now.duration_since(session.modified) {
            Ok(value) => value,
            Err(_) => continue,
        };
        if age < ttl {
            continue;
        }
        let Ok(guard) = locks.try_exclusive(&session.key).await else {
            continue;
        };
        match store.purge(&session.key).await {
            Ok(()) => {
                tracker.remove(&session.key).await;
                purged += 1;
                info!(session = %session.key, "removed stale upload");
            }
            Err(err) => {
                warn!(session = %session.key, error = %err, "failed to remove stale upload");
            }
        }
        drop(guard);
    }

    for key in tracker.stale_keys(ttl).await {
        if !store.session_exists(&key).await {
            tracker.remove(&key).await;
        }
    }

    locks.prune().await;
    Ok(purged)
}
