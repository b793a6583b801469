//! Worker configuration.
//!
//! Sources, lowest precedence first: built-in defaults, an optional
//! `worker.toml` next to the binary's working directory, then environment
//! variables prefixed with `WORKER_` (`WORKER_REDIS_URL`,
//! `WORKER_APP_SECRET`, `WORKER_CONCURRENCY`, ...).

use chrono_tz::Tz;
use config::{Config, Environment, File};
use reqwest::Method;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::queue::DEFAULT_QUEUE_KEY;
use crate::storage::S3Settings;

const CONFIG_BASENAME: &str = "worker";
const ENV_PREFIX: &str = "WORKER";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    #[serde(default = "default_redis_url")]
    redis_url: String,
    #[serde(default = "default_queue_key")]
    queue_key: String,
    #[serde(default = "default_concurrency")]
    concurrency: usize,
    app_secret: String,
    #[serde(default = "default_template_dir")]
    template_dir: PathBuf,
    #[serde(default = "default_scratch_dir")]
    scratch_dir: PathBuf,
    #[serde(default = "default_asset_base_url")]
    asset_base_url: String,
    #[serde(default = "default_time_zone")]
    time_zone: String,
    #[serde(default = "default_chrome_bin")]
    chrome_bin: PathBuf,
    #[serde(default = "default_render_timeout_secs")]
    render_timeout_secs: u64,
    #[serde(default = "default_notify_timeout_secs")]
    notify_timeout_secs: u64,
    #[serde(default = "default_callback_method")]
    callback_method: String,
    #[serde(default = "default_storage_backend")]
    storage_backend: String,
    #[serde(default)]
    storage_endpoint: Option<String>,
    #[serde(default)]
    storage_bucket: Option<String>,
    #[serde(default = "default_storage_region")]
    storage_region: String,
    #[serde(default)]
    storage_access_key: Option<String>,
    #[serde(default)]
    storage_secret_key: Option<String>,
    #[serde(default = "default_storage_local_dir")]
    storage_local_dir: PathBuf,
    storage_public_url: String,
    #[serde(default = "default_log_format")]
    log_format: String,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1/".to_string()
}
fn default_queue_key() -> String {
    DEFAULT_QUEUE_KEY.to_string()
}
fn default_concurrency() -> usize {
    4
}
fn default_template_dir() -> PathBuf {
    PathBuf::from("./templates")
}
fn default_scratch_dir() -> PathBuf {
    PathBuf::from("./certification")
}
fn default_asset_base_url() -> String {
    "http://localhost:8000/".to_string()
}
fn default_time_zone() -> String {
    "Asia/Kolkata".to_string()
}
fn default_chrome_bin() -> PathBuf {
    PathBuf::from("chromium")
}
fn default_render_timeout_secs() -> u64 {
    60
}
fn default_notify_timeout_secs() -> u64 {
    30
}
fn default_callback_method() -> String {
    "PATCH".to_string()
}
fn default_storage_backend() -> String {
    "s3".to_string()
}
fn default_storage_region() -> String {
    "us-east-1".to_string()
}
fn default_storage_local_dir() -> PathBuf {
    PathBuf::from("./artifacts")
}
fn default_log_format() -> String {
    "pretty".to_string()
}

/// Where finished certificates are uploaded.
#[derive(Debug, Clone)]
pub enum StorageBackend {
    S3(S3Settings),
    Local(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Validated worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub redis_url: String,
    pub queue_key: String,
    pub concurrency: usize,
    pub app_secret: String,
    pub template_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub asset_base_url: Url,
    pub time_zone: Tz,
    pub chrome_bin: PathBuf,
    pub render_timeout: Duration,
    pub notify_timeout: Duration,
    pub callback_method: Method,
    pub storage: StorageBackend,
    pub storage_public_url: Url,
    pub log_format: LogFormat,
}

impl WorkerConfig {
    /// Loads `worker.toml` (if present) and `WORKER_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let raw: RawConfig = Config::builder()
            .add_source(File::with_name(CONFIG_BASENAME).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;
        Self::from_raw(raw)
    }

    /// Builds configuration from a TOML document, bypassing files and env.
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = Config::builder()
            .add_source(File::from_str(source, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        if raw.concurrency == 0 {
            return Err(ConfigError::invalid("concurrency", "must be at least 1"));
        }
        if raw.app_secret.trim().is_empty() {
            return Err(ConfigError::invalid("app_secret", "must not be empty"));
        }

        let time_zone: Tz = raw
            .time_zone
            .parse()
            .map_err(|e| ConfigError::invalid("time_zone", format!("{e}")))?;
        let asset_base_url = Url::parse(&raw.asset_base_url)
            .map_err(|e| ConfigError::invalid("asset_base_url", e.to_string()))?;
        let storage_public_url = Url::parse(&raw.storage_public_url)
            .map_err(|e| ConfigError::invalid("storage_public_url", e.to_string()))?;
        if storage_public_url.cannot_be_a_base() {
            return Err(ConfigError::invalid(
                "storage_public_url",
                "must be a hierarchical URL",
            ));
        }
        let callback_method = Method::from_bytes(raw.callback_method.to_ascii_uppercase().as_bytes())
            .map_err(|e| ConfigError::invalid("callback_method", e.to_string()))?;

        let storage = match raw.storage_backend.as_str() {
            "s3" => StorageBackend::S3(S3Settings {
                endpoint: required(raw.storage_endpoint, "storage_endpoint")?,
                bucket: required(raw.storage_bucket, "storage_bucket")?,
                region: raw.storage_region,
                access_key: required(raw.storage_access_key, "storage_access_key")?,
                secret_key: required(raw.storage_secret_key, "storage_secret_key")?,
            }),
            "local" => StorageBackend::Local(raw.storage_local_dir),
            other => {
                return Err(ConfigError::invalid(
                    "storage_backend",
                    format!("unknown backend {other:?} (expected \"s3\" or \"local\")"),
                ))
            }
        };

        let log_format = match raw.log_format.as_str() {
            "pretty" => LogFormat::Pretty,
            "json" => LogFormat::Json,
            other => {
                return Err(ConfigError::invalid(
                    "log_format",
                    format!("unknown format {other:?}"),
                ))
            }
        };

        Ok(Self {
            redis_url: raw.redis_url,
            queue_key: raw.queue_key,
            concurrency: raw.concurrency,
            app_secret: raw.app_secret,
            template_dir: raw.template_dir,
            scratch_dir: raw.scratch_dir,
            asset_base_url,
            time_zone,
            chrome_bin: raw.chrome_bin,
            render_timeout: Duration::from_secs(raw.render_timeout_secs),
            notify_timeout: Duration::from_secs(raw.notify_timeout_secs),
            callback_method,
            storage,
            storage_public_url,
            log_format,
        })
    }
}

fn required(value: Option<String>, key: &'static str) -> Result<String, ConfigError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::invalid(key, "required for the s3 backend"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MINIMAL: &str = r#"
        app_secret = "s3cr3t"
        storage_backend = "local"
        storage_public_url = "https://files.example.com/certificates/"
    "#;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::from_toml(MINIMAL).unwrap();

        assert_eq!(config.redis_url, "redis://127.0.0.1/");
        assert_eq!(config.queue_key, DEFAULT_QUEUE_KEY);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.time_zone, chrono_tz::Asia::Kolkata);
        assert_eq!(config.asset_base_url.as_str(), "http://localhost:8000/");
        assert_eq!(config.callback_method, Method::PATCH);
        assert_eq!(config.render_timeout, Duration::from_secs(60));
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert!(matches!(config.storage, StorageBackend::Local(ref p) if p == &PathBuf::from("./artifacts")));
    }

    #[test]
    fn test_s3_backend_requires_credentials() {
        let source = r#"
            app_secret = "s3cr3t"
            storage_public_url = "https://files.example.com/certificates/"
            storage_endpoint = "http://minio:9000"
            storage_bucket = "certificates"
        "#;

        let err = WorkerConfig::from_toml(source).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "storage_access_key", .. }));
    }

    #[test]
    fn test_s3_backend() {
        let source = r#"
            app_secret = "s3cr3t"
            storage_public_url = "http://minio:9000/certificates"
            storage_endpoint = "http://minio:9000"
            storage_bucket = "certificates"
            storage_access_key = "minio"
            storage_secret_key = "minio123"
            callback_method = "post"
            time_zone = "UTC"
        "#;

        let config = WorkerConfig::from_toml(source).unwrap();
        assert_eq!(config.callback_method, Method::POST);
        assert_eq!(config.time_zone, chrono_tz::UTC);
        match config.storage {
            StorageBackend::S3(s3) => {
                assert_eq!(s3.bucket, "certificates");
                assert_eq!(s3.region, "us-east-1");
            }
            other => panic!("unexpected backend: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_invalid_values() {
        let bad_zone = format!("{MINIMAL}\ntime_zone = \"Mars/Olympus\"");
        assert!(matches!(
            WorkerConfig::from_toml(&bad_zone).unwrap_err(),
            ConfigError::Invalid { key: "time_zone", .. }
        ));

        let zero = format!("{MINIMAL}\nconcurrency = 0");
        assert!(matches!(
            WorkerConfig::from_toml(&zero).unwrap_err(),
            ConfigError::Invalid { key: "concurrency", .. }
        ));

        let backend = r#"
            app_secret = "s3cr3t"
            storage_backend = "ftp"
            storage_public_url = "https://files.example.com/"
        "#;
        assert!(matches!(
            WorkerConfig::from_toml(backend).unwrap_err(),
            ConfigError::Invalid { key: "storage_backend", .. }
        ));
    }

    #[test]
    fn test_missing_secret() {
        let source = r#"
            storage_backend = "local"
            storage_public_url = "https://files.example.com/"
        "#;
        assert!(matches!(
            WorkerConfig::from_toml(source).unwrap_err(),
            ConfigError::Build(_)
        ));
    }
}
