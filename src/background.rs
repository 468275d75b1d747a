//! 暂存目录清理的后台任务。

use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{info, warn};

use crate::config::{SPOOL_CLEAN_INTERVAL_SECS, SPOOL_FILE_PREFIX, UploadConfig};

/// 启动后台任务（清理崩溃遗留的暂存文件）。
pub fn spawn_background_tasks(upload: Arc<UploadConfig>) {
    if upload.spool_ttl.is_zero() {
        return;
    }

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(SPOOL_CLEAN_INTERVAL_SECS));
        loop {
            interval.tick().await;
            if let Err(err) = cleanup_spool(&upload).await {
                warn!(error = %err, "spool cleanup failed");
            }
        }
    });
}

/// 删除超过 ttl 的暂存文件，返回删除数量。
pub async fn cleanup_spool(upload: &UploadConfig) -> io::Result<usize> {
    if upload.spool_ttl.is_zero() {
        return Ok(0);
    }
    if fs::metadata(&upload.spool_dir).await.is_err() {
        return Ok(0);
    }

    let now = SystemTime::now();
    let mut removed = 0;
    let mut dir = fs::read_dir(&upload.spool_dir).await?;
    while let Some(entry) = dir.next_entry().await? {
        if !entry
            .file_name()
            .to_string_lossy()
            .starts_with(SPOOL_FILE_PREFIX)
        {
            continue;
        }
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        let Ok(age) = now.duration_since(modified) else {
            continue;
        };
        if age >= upload.spool_ttl {
            let path = entry.path();
            if let Err(err) = fs::remove_file(&path).await {
                warn!(path = ?path, error = %err, "failed to remove stale spool file");
            } else {
                info!(path = ?path, "removed stale spool file");
                removed += 1;
            }
        }
    }

    Ok(removed)
}
