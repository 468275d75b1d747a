//! 调用方身份：解析 Basic 认证并可选校验凭据。

use axum::extract::{Extension, FromRequestParts};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::{body::Body as AxumBody, middleware};
use axum_extra::extract::TypedHeader;
use axum_extra::typed_header::TypedHeaderRejection;
use axum_extra::headers::{Authorization, authorization::Basic};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::warn;

use crate::config::AUTH_REALM;

/// 进程内凭据校验配置；未配置时信任前置代理，只读取用户名。
#[derive(Debug, Default)]
pub struct AuthConfig {
    pub credentials: Option<(String, String)>,
}

impl AuthConfig {
    pub fn new(username: Option<String>, password: Option<String>) -> Self {
        Self {
            credentials: username.zip(password),
        }
    }
}

/// 已认证的调用方，由 [`auth_middleware`] 写入请求扩展。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallerIdentity(pub String);

/// 可选的调用方身份提取器，从不拒绝请求。
#[derive(Clone, Debug, Default)]
pub struct Caller(pub Option<CallerIdentity>);

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Caller(parts.extensions.get::<CallerIdentity>().cloned()))
    }
}

/// 认证中间件：提取 Basic 认证用户名，配置了凭据时校验。
/// 非 Basic 或格式错误的 Authorization 头视为未认证。
pub async fn auth_middleware(
    Extension(auth): Extension<Arc<AuthConfig>>,
    auth_header: Result<TypedHeader<Authorization<Basic>>, TypedHeaderRejection>,
    mut req: Request<AxumBody>,
    next: middleware::Next,
) -> Response {
    match (&auth.credentials, auth_header.ok()) {
        (Some((username, password)), Some(TypedHeader(header)))
            if header.username() == username.as_str()
                && header.password() == password.as_str() =>
        {
            req.extensions_mut()
                .insert(CallerIdentity(header.username().to_string()));
        }
        (Some(_), header) => {
            warn!(
                user = ?header.as_ref().map(|TypedHeader(h)| h.username()),
                "rejected basic auth"
            );
            return unauthorized();
        }
        (None, Some(TypedHeader(header))) if !header.username().is_empty() => {
            req.extensions_mut()
                .insert(CallerIdentity(header.username().to_string()));
        }
        (None, _) => {}
    }
    next.run(req).await
}

fn unauthorized() -> Response {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&format!(r#"Basic realm="{AUTH_REALM}""#)) {
        headers.insert(header::WWW_AUTHENTICATE, value);
    }
    (StatusCode::UNAUTHORIZED, headers, "unauthorized").into_response()
}
