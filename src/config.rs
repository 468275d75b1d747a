//! CLI arguments, defaults and deployment path validation.

use clap::Parser;
use shadow_rs::formatcp;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const SPOOL_DIR_NAME: &str = ".upload_spool";
pub const SPOOL_FILE_PREFIX: &str = ".upload-";
pub const AUTH_REALM: &str = "Site Upload";
pub const DEFAULT_ENDPOINT: &str = "/r.php";
pub const DEFAULT_MAX_REQUEST_SIZE: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 512 * 1024 * 1024;
pub const DEFAULT_SPOOL_TTL_SECS: u64 = 24 * 60 * 60;
pub const SPOOL_CLEAN_INTERVAL_SECS: u64 = 900;

/// CLI arguments and environment configuration for the receiver.
#[derive(Parser, Debug)]
#[command(name = "site-receiver", version = VERSION_INFO, about = "Per-site upload receiver")]
pub struct Args {
    #[arg(
        short = 'd',
        long,
        env = "RECEIVER_DEPLOY_DIR",
        help = "Deployment directory, its last segment names the site (defaults to the current directory)"
    )]
    pub deploy_dir: Option<PathBuf>,
    #[arg(
        short = 's',
        long,
        env = "RECEIVER_STORAGE_ROOT",
        help = "Storage root holding one directory per site (defaults to the parent of the deployment directory)"
    )]
    pub storage_root: Option<PathBuf>,
    #[arg(
        long,
        env = "RECEIVER_SPOOL_DIR",
        help = "Directory for in-flight upload files (defaults to <storage-root>/.upload_spool)"
    )]
    pub spool_dir: Option<PathBuf>,
    #[arg(
        short = 'b',
        long = "bind",
        env = "RECEIVER_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "RECEIVER_PORT",
        default_value_t = 5080,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "RECEIVER_ENDPOINT",
        default_value = DEFAULT_ENDPOINT,
        help = "Route served by the upload handler"
    )]
    pub endpoint: String,
    #[arg(
        long,
        env = "RECEIVER_AUTH_USER",
        requires = "auth_pass",
        help = "Basic auth username checked in-process (unset: trust the fronting proxy)"
    )]
    pub auth_user: Option<String>,
    #[arg(
        long,
        env = "RECEIVER_AUTH_PASS",
        requires = "auth_user",
        help = "Basic auth password checked in-process"
    )]
    pub auth_pass: Option<String>,
    #[arg(
        long,
        env = "RECEIVER_TRUST_FORWARDED_FOR",
        help = "Take the client address from x-forwarded-for"
    )]
    pub trust_forwarded_for: bool,
    #[arg(
        long,
        env = "RECEIVER_MAX_REQUEST_SIZE",
        default_value_t = DEFAULT_MAX_REQUEST_SIZE,
        help = "Max request body size in bytes (0 to disable)"
    )]
    pub max_request_size: u64,
    #[arg(
        long,
        env = "RECEIVER_MAX_FILE_SIZE",
        default_value_t = DEFAULT_MAX_FILE_SIZE,
        help = "Max size of a single uploaded file in bytes (0 to disable)"
    )]
    pub max_file_size: u64,
    #[arg(
        long,
        env = "RECEIVER_SPOOL_TTL_SECS",
        default_value_t = DEFAULT_SPOOL_TTL_SECS,
        help = "Orphaned spool file cleanup threshold in seconds (0 to disable)"
    )]
    pub spool_ttl_secs: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("deployment path {0:?} is too shallow to name a site")]
    ShallowDeployPath(PathBuf),
    #[error("deployment path {0:?} has no parent to use as storage root")]
    NoStorageRoot(PathBuf),
    #[error("cannot determine current directory: {0}")]
    CurrentDir(#[source] std::io::Error),
}

/// Site name and storage root, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub site: String,
    pub storage_root: PathBuf,
}

impl Deployment {
    /// Takes the site from the last path segment; fewer than three segments is a config error.
    pub fn resolve(
        deploy_dir: &Path,
        storage_root: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let raw = deploy_dir.to_string_lossy();
        let trimmed = raw.trim_end_matches('/');
        let segments: Vec<&str> = trimmed.split('/').collect();
        let site = match segments.last() {
            Some(last) if segments.len() > 2 && !last.is_empty() => (*last).to_string(),
            _ => return Err(ConfigError::ShallowDeployPath(deploy_dir.to_path_buf())),
        };

        let storage_root = match storage_root {
            Some(root) => root,
            None => Path::new(trimmed)
                .parent()
                .map(Path::to_path_buf)
                .ok_or_else(|| ConfigError::NoStorageRoot(deploy_dir.to_path_buf()))?,
        };

        Ok(Self { site, storage_root })
    }

    /// Storage directory of this site.
    pub fn site_dir(&self) -> PathBuf {
        self.storage_root.join(&self.site)
    }
}

#[derive(Debug)]
pub struct UploadConfig {
    pub spool_dir: PathBuf,
    pub max_file_size: u64,
    pub spool_ttl: Duration,
}

impl UploadConfig {
    pub fn from_args(args: &Args, deployment: &Deployment) -> Self {
        Self {
            spool_dir: args
                .spool_dir
                .clone()
                .unwrap_or_else(|| deployment.storage_root.join(SPOOL_DIR_NAME)),
            max_file_size: args.max_file_size,
            spool_ttl: Duration::from_secs(args.spool_ttl_secs),
        }
    }
}

/// Resolves the deployment directory, falling back to the working directory.
pub fn deploy_dir(args: &Args) -> Result<PathBuf, ConfigError> {
    match &args.deploy_dir {
        Some(dir) => Ok(dir.clone()),
        None => std::env::current_dir().map_err(ConfigError::CurrentDir),
    }
}
