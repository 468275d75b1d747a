//! 请求体适配：将 multipart / urlencoded 表单规整为有序的上传列表。

use axum::extract::{FromRequest, Multipart, Request, multipart::Field};
use axum::extract::Form;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::{SPOOL_FILE_PREFIX, UploadConfig};

pub const UPLOAD_FIELD: &str = "upload";

/// 文件字段未能写入暂存目录的原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    /// 超过单文件大小限制。
    TooLarge,
    /// 请求体在该字段中途结束或出错。
    Partial,
    /// 文件输入框未选择文件。
    NoFile,
    /// 暂存文件无法创建或写入。
    CantWrite,
}

#[derive(Debug)]
pub enum Transfer {
    Spooled(NamedTempFile),
    Failed(TransferStatus),
}

/// 请求中的一个文件字段，按提交顺序排列。
#[derive(Debug)]
pub struct UploadedFile {
    pub original_name: String,
    pub transfer: Transfer,
}

impl UploadedFile {
    pub fn spooled(original_name: impl Into<String>, spool: NamedTempFile) -> Self {
        Self {
            original_name: original_name.into(),
            transfer: Transfer::Spooled(spool),
        }
    }

    pub fn failed(original_name: impl Into<String>, status: TransferStatus) -> Self {
        Self {
            original_name: original_name.into(),
            transfer: Transfer::Failed(status),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.transfer, Transfer::Spooled(_))
    }
}

/// 请求的表单字段与上传文件。单个 `upload` 与 `upload[]` 数组统一为有序列表。
#[derive(Debug, Default)]
pub struct UploadForm {
    pub fields: HashMap<String, String>,
    pub uploads: Vec<UploadedFile>,
}

impl UploadForm {
    pub fn action(&self) -> Option<&str> {
        self.fields.get("action").map(String::as_str)
    }
}

impl<S> FromRequest<S> for UploadForm
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_ascii_lowercase())
            .unwrap_or_default();

        if content_type.starts_with("multipart/form-data") {
            let Some(upload) = req.extensions().get::<Arc<UploadConfig>>().cloned() else {
                warn!("upload config missing from request extensions");
                return Err(StatusCode::INTERNAL_SERVER_ERROR.into_response());
            };
            return match Multipart::from_request(req, state).await {
                Ok(multipart) => Ok(read_multipart(multipart, &upload).await),
                Err(rejection) => {
                    warn!(error = %rejection, "unreadable multipart request");
                    Ok(UploadForm::default())
                }
            };
        }

        if content_type.starts_with("application/x-www-form-urlencoded") {
            return match Form::<HashMap<String, String>>::from_request(req, state).await {
                Ok(Form(fields)) => Ok(UploadForm {
                    fields,
                    uploads: Vec::new(),
                }),
                Err(rejection) => {
                    warn!(error = %rejection, "unreadable form request");
                    Ok(UploadForm::default())
                }
            };
        }

        Ok(UploadForm::default())
    }
}

fn is_upload_field(name: &str) -> bool {
    name == UPLOAD_FIELD
        || name
            .strip_prefix(UPLOAD_FIELD)
            .is_some_and(|rest| rest.starts_with('[') && rest.ends_with(']'))
}

/// 逐个读取 multipart 字段；上传文件写入暂存目录。
pub async fn read_multipart(mut multipart: Multipart, config: &UploadConfig) -> UploadForm {
    let mut form = UploadForm::default();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "malformed multipart body");
                break;
            }
        };
        let name = field.name().unwrap_or_default().to_string();

        match field.file_name().map(str::to_string) {
            Some(file_name) if is_upload_field(&name) => {
                let (entry, intact) = spool_field(field, file_name, config).await;
                form.uploads.push(entry);
                if !intact {
                    break;
                }
            }
            Some(file_name) => {
                debug!(field = name, file_name, "ignoring file part");
            }
            None => match field.bytes().await {
                Ok(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => {
                        form.fields.insert(name, text);
                    }
                    Err(_) => {
                        debug!(field = name, "skipping non utf-8 form field");
                    }
                },
                Err(err) => {
                    warn!(field = name, error = %err, "failed to read form field");
                    break;
                }
            },
        }
    }
    form
}

/// 将一个文件字段流式写入暂存文件；请求体本身损坏、无法继续读取时返回 false。
async fn spool_field(
    mut field: Field<'_>,
    original_name: String,
    config: &UploadConfig,
) -> (UploadedFile, bool) {
    let spool = match create_spool_file(&config.spool_dir) {
        Ok(spool) => spool,
        Err(err) => {
            warn!(error = %err, spool_dir = ?config.spool_dir, "failed to create spool file");
            return (
                UploadedFile::failed(original_name, TransferStatus::CantWrite),
                true,
            );
        }
    };
    let mut out = match spool.as_file().try_clone() {
        Ok(file) => tokio::fs::File::from_std(file),
        Err(err) => {
            warn!(error = %err, "failed to open spool file");
            return (
                UploadedFile::failed(original_name, TransferStatus::CantWrite),
                true,
            );
        }
    };

    let mut written: u64 = 0;
    loop {
        match field.chunk().await {
            Ok(Some(chunk)) => {
                written += chunk.len() as u64;
                if config.max_file_size > 0 && written > config.max_file_size {
                    warn!(
                        name = original_name,
                        limit = config.max_file_size,
                        "upload exceeds file size limit"
                    );
                    return (
                        UploadedFile::failed(original_name, TransferStatus::TooLarge),
                        true,
                    );
                }
                if let Err(err) = out.write_all(&chunk).await {
                    warn!(name = original_name, error = %err, "failed to write spool file");
                    return (
                        UploadedFile::failed(original_name, TransferStatus::CantWrite),
                        true,
                    );
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(name = original_name, error = %err, "upload interrupted");
                return (
                    UploadedFile::failed(original_name, TransferStatus::Partial),
                    false,
                );
            }
        }
    }
    if let Err(err) = out.flush().await {
        warn!(name = original_name, error = %err, "failed to flush spool file");
        return (
            UploadedFile::failed(original_name, TransferStatus::CantWrite),
            true,
        );
    }

    if original_name.is_empty() && written == 0 {
        return (
            UploadedFile::failed(original_name, TransferStatus::NoFile),
            true,
        );
    }

    debug!(name = original_name, bytes = written, "upload spooled");
    (UploadedFile::spooled(original_name, spool), true)
}

fn create_spool_file(dir: &Path) -> io::Result<NamedTempFile> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(SPOOL_FILE_PREFIX);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(std::fs::Permissions::from_mode(0o644));
    }
    builder.tempfile_in(dir)
}
