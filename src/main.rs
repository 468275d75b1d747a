//! Site upload receiver binary.
//!
//! Serves a single upload endpoint for one site. The site name comes from the
//! deployment directory, files land under `<storage-root>/<site>/`, and every
//! request is answered with a small JSON object.

mod auth;
mod background;
mod config;
mod error;
mod form;
mod http;
mod logging;
mod receiver;
mod sanitize;
mod storage;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::any;
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info, info_span};

use crate::auth::AuthConfig;
use crate::background::spawn_background_tasks;
use crate::config::{Args, Deployment, UploadConfig};
use crate::http::AddrSource;

shadow!(build);

/// Starts the receiver and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let deployment = config::deploy_dir(&args)
        .and_then(|dir| Deployment::resolve(&dir, args.storage_root.clone()))
        .map_err(|err| {
            error!(error = %err, "invalid deployment");
            std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string())
        })?;
    let deployment = Arc::new(deployment);
    let upload_config = Arc::new(UploadConfig::from_args(&args, &deployment));
    let auth_config = Arc::new(AuthConfig::new(
        args.auth_user.clone(),
        args.auth_pass.clone(),
    ));
    tokio::fs::create_dir_all(&upload_config.spool_dir).await?;

    let auth_mode = if auth_config.credentials.is_some() {
        "in-process"
    } else {
        "proxy"
    };
    info!(
        site = deployment.site,
        storage_root = ?deployment.storage_root,
        spool_dir = ?upload_config.spool_dir,
        endpoint = args.endpoint,
        auth = auth_mode,
        "deployment resolved"
    );

    let app = build_app(
        &args.endpoint,
        body_limit(args.max_request_size),
        deployment,
        auth_config,
        upload_config.clone(),
        AddrSource::from_flag(args.trust_forwarded_for),
    );

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!("Starting HTTP server at {}", addr);

    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    spawn_background_tasks(upload_config);
    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

fn body_limit(max_request_size: u64) -> DefaultBodyLimit {
    match usize::try_from(max_request_size) {
        Ok(0) => DefaultBodyLimit::disable(),
        Ok(limit) => DefaultBodyLimit::max(limit),
        Err(_) => DefaultBodyLimit::disable(),
    }
}

/// Builds the router with its middleware stack and shared configuration.
fn build_app(
    endpoint: &str,
    body_limit: DefaultBodyLimit,
    deployment: Arc<Deployment>,
    auth_config: Arc<AuthConfig>,
    upload_config: Arc<UploadConfig>,
    addr_source: AddrSource,
) -> Router {
    Router::new()
        .route(endpoint, any(receiver::receive))
        .layer(body_limit)
        .layer(middleware::from_fn(auth::auth_middleware))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(move |request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip =
                        http::resolve_client_ip(request.headers(), connect_ip, addr_source)
                            .map(|ip| ip.to_string())
                            .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(deployment))
        .layer(Extension(auth_config))
        .layer(Extension(upload_config))
        .layer(Extension(addr_source))
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form::tests::{BOUNDARY, multipart_body};
    use axum::body::Body as AxumBody;
    use axum::http::{StatusCode, header};
    use http_body_util::BodyExt;
    use std::path::Path;
    use tempfile::{TempDir, tempdir};
    use tower::ServiceExt;

    const BASIC_SITE_A: &str = "Basic c2l0ZUE6c2VjcmV0"; // siteA:secret
    const BASIC_WRONG: &str = "Basic c2l0ZUE6d3Jvbmc="; // siteA:wrong

    struct TestApp {
        temp: TempDir,
        router: Router,
    }

    impl TestApp {
        fn new(credentials: Option<(&str, &str)>) -> Self {
            let temp = tempdir().expect("tempdir");
            let deployment =
                Deployment::resolve(&temp.path().join("d").join("sA"), None).expect("deployment");
            let spool_dir = temp.path().join("spool");
            std::fs::create_dir_all(&spool_dir).expect("spool dir");
            let upload = UploadConfig {
                spool_dir,
                max_file_size: 0,
                spool_ttl: Duration::from_secs(60),
            };
            let auth = AuthConfig::new(
                credentials.map(|(user, _)| user.to_string()),
                credentials.map(|(_, pass)| pass.to_string()),
            );
            let router = build_app(
                "/r.php",
                body_limit(1024 * 1024),
                Arc::new(deployment),
                Arc::new(auth),
                Arc::new(upload),
                AddrSource::Forwarded,
            );
            Self { temp, router }
        }

        fn site_dir(&self) -> std::path::PathBuf {
            self.temp.path().join("d").join("sA")
        }

        async fn send(&self, authorization: Option<&str>, body: Vec<u8>) -> (StatusCode, String) {
            let mut builder = Request::builder()
                .method("POST")
                .uri("/r.php")
                .header("x-forwarded-for", "1.2.3.4")
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={BOUNDARY}"),
                );
            if let Some(value) = authorization {
                builder = builder.header(header::AUTHORIZATION, value);
            }
            let request = builder.body(AxumBody::from(body)).expect("request");
            let response = self.router.clone().oneshot(request).await.expect("response");
            let status = response.status();
            let bytes = response
                .into_body()
                .collect()
                .await
                .expect("body")
                .to_bytes();
            (status, String::from_utf8(bytes.to_vec()).expect("utf8"))
        }
    }

    fn json(body: &str) -> serde_json::Value {
        serde_json::from_str(body).expect("json body")
    }

    fn file_count(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_action_over_http() {
        let app = TestApp::new(None);
        let (status, body) = app
            .send(Some(BASIC_SITE_A), multipart_body(&[("action", None, b"test")]))
            .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body), serde_json::json!({ "error": 0, "message": "ok" }));
    }

    #[tokio::test]
    async fn no_identity_without_auth_header() {
        let app = TestApp::new(None);
        let (status, body) = app
            .send(None, multipart_body(&[("action", None, b"store")]))
            .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json(&body),
            serde_json::json!({ "message": "Error: no user logged in" })
        );
    }

    #[tokio::test]
    async fn store_two_files_over_http() {
        let app = TestApp::new(None);
        let body = multipart_body(&[
            ("action", None, b"store"),
            ("upload[]", Some("test.csv"), b"1,2,3,4"),
            ("upload[]", Some("test2.csv"), b"1,2,3,4,5"),
        ]);
        let (_, body) = app.send(Some(BASIC_SITE_A), body).await;

        assert_eq!(
            json(&body),
            serde_json::json!({ "error": 0, "message": "Info: 2 files stored" })
        );
        assert_eq!(file_count(&app.site_dir()), 2);
    }

    #[tokio::test]
    async fn empty_file_input_is_an_upload_error() {
        let app = TestApp::new(None);
        let body = multipart_body(&[("action", None, b"store"), ("upload", Some(""), b"")]);
        let (_, body) = app.send(Some(BASIC_SITE_A), body).await;

        assert_eq!(
            json(&body),
            serde_json::json!({ "error": 1, "message": "Error: upload error" })
        );
        assert_eq!(file_count(&app.site_dir()), 0);
    }

    #[tokio::test]
    async fn configured_credentials_are_enforced() {
        let app = TestApp::new(Some(("siteA", "secret")));
        let body = || multipart_body(&[("action", None, b"test")]);

        let (status, _) = app.send(None, body()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = app.send(Some(BASIC_WRONG), body()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = app.send(Some(BASIC_SITE_A), body()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body), serde_json::json!({ "error": 0, "message": "ok" }));
    }

    #[tokio::test]
    async fn non_basic_authorization_is_no_identity() {
        let app = TestApp::new(None);
        for value in ["Bearer abc", "Basic not-base64!"] {
            let (status, body) = app
                .send(Some(value), multipart_body(&[("action", None, b"test")]))
                .await;

            assert_eq!(status, StatusCode::OK, "{value}");
            assert_eq!(
                json(&body),
                serde_json::json!({ "message": "Error: no user logged in" })
            );
        }
    }

    #[tokio::test]
    async fn non_basic_authorization_is_unauthorized_with_credentials() {
        let app = TestApp::new(Some(("siteA", "secret")));
        let (status, _) = app
            .send(Some("Bearer abc"), multipart_body(&[("action", None, b"test")]))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn multipart_without_boundary_still_answers_json() {
        let app = TestApp::new(None);
        let request = Request::builder()
            .method("POST")
            .uri("/r.php")
            .header(header::AUTHORIZATION, BASIC_SITE_A)
            .header(header::CONTENT_TYPE, "multipart/form-data")
            .body(AxumBody::from("garbage"))
            .expect("request");
        let response = app.router.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        let body = String::from_utf8(bytes.to_vec()).expect("utf8");
        assert_eq!(json(&body), serde_json::json!({ "error": 0, "message": "ok" }));
    }

    #[tokio::test]
    async fn responses_carry_security_headers() {
        let app = TestApp::new(None);
        let request = Request::builder()
            .uri("/r.php")
            .header(header::AUTHORIZATION, BASIC_SITE_A)
            .body(AxumBody::empty())
            .expect("request");
        let response = app.router.clone().oneshot(request).await.expect("response");

        assert_eq!(response.headers()[header::X_FRAME_OPTIONS], "DENY");
        assert_eq!(response.headers()[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
    }
}
