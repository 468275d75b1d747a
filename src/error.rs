//! 统一的错误类型与 JSON 应答。

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};
use thiserror::Error;
use tracing::error;

/// 每个请求的 JSON 应答体。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<u8>,
    pub message: String,
}

impl Reply {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            error: Some(0),
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(1),
            message: message.into(),
        }
    }

    /// 仅包含 message 字段的应答（未登录时使用）。
    pub fn message_only(message: impl Into<String>) -> Self {
        Self {
            error: None,
            message: message.into(),
        }
    }

    /// 以四空格缩进序列化。
    pub fn to_pretty_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut out = Vec::with_capacity(64);
        let formatter = PrettyFormatter::with_indent(b"    ");
        let mut serializer = Serializer::with_formatter(&mut out, formatter);
        self.serialize(&mut serializer)?;
        Ok(out)
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        match self.to_pretty_json() {
            Ok(body) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
                body,
            )
                .into_response(),
            Err(err) => {
                error!(error = %err, "failed to encode reply");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

/// 请求可能的失败结果，`Display` 即返回给客户端的消息。
#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("Error: no user logged in")]
    NoUser,
    #[error("Error: no files attached to upload")]
    NoFiles,
    #[error("Error: Failed to create site directory for storage")]
    SiteDirectory(#[source] std::io::Error),
    #[error("Error: upload error")]
    UploadError,
    #[error("Error: failed storing file {path}")]
    StoreFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Error: no file was stored.")]
    NothingStored,
    #[error("Error: unknown action")]
    UnknownAction,
}

impl From<ReceiverError> for Reply {
    fn from(err: ReceiverError) -> Self {
        match err {
            ReceiverError::NoUser => Reply::message_only(err.to_string()),
            other => Reply::error(other.to_string()),
        }
    }
}

impl IntoResponse for ReceiverError {
    fn into_response(self) -> Response {
        Reply::from(self).into_response()
    }
}
