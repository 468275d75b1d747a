//! 站点存储目录与上传文件落盘。

use chrono::{DateTime, TimeZone};
use std::fmt::Display;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::fs;

use crate::sanitize::sanitize;

/// ISO-8601 时间戳（微秒精度，带 `+hh:mm` 偏移），如 `2024-05-01T13:45:10.123456+02:00`。
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f%:z";

/// 目标名被占用时追加 `-N` 后缀的最大尝试次数。
const MAX_NAME_ATTEMPTS: u32 = 100;

/// 站点的平铺存储目录，目录列表即全部记录。
#[derive(Clone, Debug)]
pub struct SiteStorage {
    dir: PathBuf,
}

impl SiteStorage {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 目录不存在时递归创建（权限 0777，受 umask 影响）。
    pub async fn ensure_dir(&self) -> io::Result<()> {
        if let Ok(metadata) = fs::metadata(&self.dir).await
            && metadata.is_dir()
        {
            return Ok(());
        }

        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o777);
        builder.create(&self.dir).await
    }

    pub fn target_for(&self, stored_name: &str) -> PathBuf {
        self.dir.join(stored_name)
    }

    /// 将暂存文件移动到 `target`，从不覆盖已有文件；返回最终落盘路径。
    pub async fn persist(&self, spool: NamedTempFile, target: &Path) -> io::Result<PathBuf> {
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || persist_blocking(spool, &target))
            .await
            .map_err(|err| io::Error::other(err.to_string()))?
    }
}

/// 生成 `<清洗后文件名>_<party>_<时间戳>`，`party` 需已清洗。
pub fn stored_name<Tz>(original_name: &str, party: &str, at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    format!(
        "{}_{}_{}",
        sanitize(original_name),
        party,
        at.format(TIMESTAMP_FORMAT)
    )
}

fn persist_blocking(mut spool: NamedTempFile, target: &Path) -> io::Result<PathBuf> {
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let candidate = candidate_path(target, attempt);
        match place(spool, &candidate) {
            Ok(()) => return Ok(candidate),
            Err((err, back)) if err.kind() == io::ErrorKind::AlreadyExists => spool = back,
            Err((err, _)) => return Err(err),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free name for {}", target.display()),
    ))
}

fn candidate_path(target: &Path, attempt: u32) -> PathBuf {
    if attempt == 0 {
        return target.to_path_buf();
    }
    let mut name = target.as_os_str().to_os_string();
    name.push(format!("-{attempt}"));
    PathBuf::from(name)
}

/// 失败时交还暂存文件，便于换名重试。
fn place(spool: NamedTempFile, target: &Path) -> Result<(), (io::Error, NamedTempFile)> {
    match spool.persist_noclobber(target) {
        Ok(_) => Ok(()),
        Err(err) if err.error.kind() == io::ErrorKind::CrossesDevices => {
            match copy_noclobber(&err.file, target) {
                Ok(()) => Ok(()),
                Err(copy_err) => Err((copy_err, err.file)),
            }
        }
        Err(err) => Err((err.error, err.file)),
    }
}

fn copy_noclobber(spool: &NamedTempFile, target: &Path) -> io::Result<()> {
    let mut source = spool.reopen()?;
    let mut dest = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(target)?;
    if let Err(err) = io::copy(&mut source, &mut dest).and_then(|_| dest.sync_all()) {
        let _ = std::fs::remove_file(target);
        return Err(err);
    }
    Ok(())
}
