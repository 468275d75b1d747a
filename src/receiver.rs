//! 上传端点：身份检查、动作分派与文件落盘。

use axum::extract::Extension;
use chrono::Local;
use std::error::Error as _;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::auth::{Caller, CallerIdentity};
use crate::config::Deployment;
use crate::error::{ReceiverError, Reply};
use crate::form::{Transfer, UploadForm, UploadedFile};
use crate::http::RemoteAddr;
use crate::sanitize::sanitize_party;
use crate::storage::{SiteStorage, stored_name};

/// 请求动作，取自表单字段 `action`。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Test,
    Store,
    Unknown(String),
}

impl Action {
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            None | Some("test") => Action::Test,
            Some("store") => Action::Store,
            Some(other) => Action::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Test => f.write_str("test"),
            Action::Store => f.write_str("store"),
            Action::Unknown(value) => write!(f, "unknown({value})"),
        }
    }
}

/// 上传端点处理器，任何结果都以 JSON 应答返回。
pub async fn receive(
    Extension(deployment): Extension<Arc<Deployment>>,
    Caller(caller): Caller,
    RemoteAddr(remote_addr): RemoteAddr,
    form: UploadForm,
) -> Reply {
    match handle_request(&deployment, caller.as_ref(), &remote_addr, form).await {
        Ok(reply) => reply,
        Err(err) => {
            warn!(
                site = deployment.site,
                remote_addr,
                error = %err,
                cause = err.source().map(tracing::field::display),
                "request failed"
            );
            err.into()
        }
    }
}

pub async fn handle_request(
    deployment: &Deployment,
    caller: Option<&CallerIdentity>,
    remote_addr: &str,
    form: UploadForm,
) -> Result<Reply, ReceiverError> {
    let Some(CallerIdentity(user)) = caller else {
        return Err(ReceiverError::NoUser);
    };

    let action = Action::parse(form.action());
    let party = sanitize_party(remote_addr);
    info!(
        user,
        site = deployment.site,
        party,
        %action,
        files = form.uploads.len(),
        failed = form.uploads.iter().filter(|upload| !upload.is_ok()).count(),
        "handling request"
    );

    match action {
        Action::Test => Ok(Reply::ok("ok")),
        Action::Store => store_uploads(deployment, &party, form.uploads).await,
        Action::Unknown(_) => Err(ReceiverError::UnknownAction),
    }
}

/// 按提交顺序落盘；首个失败即结束请求，之前已保存的文件保留。
async fn store_uploads(
    deployment: &Deployment,
    party: &str,
    uploads: Vec<UploadedFile>,
) -> Result<Reply, ReceiverError> {
    if uploads.is_empty() {
        return Err(ReceiverError::NoFiles);
    }

    let storage = SiteStorage::new(deployment.site_dir());
    storage
        .ensure_dir()
        .await
        .map_err(ReceiverError::SiteDirectory)?;
    debug!(site_dir = ?storage.dir(), "site directory ready");

    let mut count: usize = 0;
    for upload in uploads {
        let spool = match upload.transfer {
            Transfer::Spooled(spool) => spool,
            Transfer::Failed(status) => {
                warn!(name = upload.original_name, ?status, "upload transfer failed");
                return Err(ReceiverError::UploadError);
            }
        };

        let name = stored_name(&upload.original_name, party, &Local::now());
        let target = storage.target_for(&name);
        let stored = storage
            .persist(spool, &target)
            .await
            .map_err(|source| ReceiverError::StoreFailed {
                path: target.display().to_string(),
                source,
            })?;
        info!(path = %stored.display(), "file stored");
        count += 1;
    }

    if count > 0 {
        let plural = if count > 1 { "s" } else { "" };
        Ok(Reply::ok(format!("Info: {count} file{plural} stored")))
    } else {
        Err(ReceiverError::NothingStored)
    }
}
