//! HTTP 辅助工具：客户端地址识别与安全头。

use axum::body::Body as AxumBody;
use axum::extract::{FromRequestParts, connect_info::ConnectInfo};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::{middleware, response::Response};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};

/// 客户端地址的来源。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddrSource {
    Peer,
    Forwarded,
}

impl AddrSource {
    pub fn from_flag(trust_forwarded_for: bool) -> Self {
        if trust_forwarded_for {
            AddrSource::Forwarded
        } else {
            AddrSource::Peer
        }
    }
}

/// 从 `x-forwarded-for` 解析客户端 IP。
pub fn extract_forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse::<IpAddr>().ok())
}

/// 综合转发头与连接信息计算客户端 IP。
pub fn resolve_client_ip(
    headers: &HeaderMap,
    connect_ip: Option<IpAddr>,
    source: AddrSource,
) -> Option<IpAddr> {
    match source {
        AddrSource::Forwarded => extract_forwarded_ip(headers).or(connect_ip),
        AddrSource::Peer => connect_ip,
    }
}

/// 调用方远端地址，未知时为空串。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteAddr(pub String);

impl<S> FromRequestParts<S> for RemoteAddr
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let source = parts
            .extensions
            .get::<AddrSource>()
            .copied()
            .unwrap_or(AddrSource::Peer);
        let connect_ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let ip = resolve_client_ip(&parts.headers, connect_ip, source);
        Ok(RemoteAddr(ip.map(|ip| ip.to_string()).unwrap_or_default()))
    }
}

/// 添加基础安全响应头。
pub async fn add_security_headers(
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, StatusCode> {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        axum::http::header::X_FRAME_OPTIONS,
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        axum::http::header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    Ok(response)
}
