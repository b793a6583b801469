//! Artifact upload to S3-compatible object storage (MinIO in production).

use async_trait::async_trait;
use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as StorePath;
use object_store::{ClientOptions, ObjectStore, PutPayload};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use url::Url;
use uuid::Uuid;

const PDF_CONTENT_TYPE: &str = "application/pdf";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("failed to read artifact {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("object store rejected upload: {0}")]
    Store(#[from] object_store::Error),
    #[error("cannot build durable link: {0}")]
    Link(String),
}

/// Stores a local artifact under a key and returns a durable link to it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn upload(&self, local_path: &Path, key: &str) -> Result<String, UploadError>;
}

/// Derives a collision-free destination key from a display name.
///
/// Whitespace is dropped and anything outside alphanumerics, `-`, `_` and
/// `.` becomes `-`, then a fresh UUID is appended.
pub fn destination_key(name: &str) -> String {
    let stem: String = name
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("{}_{}", stem, Uuid::new_v4())
}

/// Durable link for `key` under a public base URL.
pub fn link_for_key(public_base: &Url, key: &str) -> Result<String, UploadError> {
    let mut link = public_base.clone();
    link.path_segments_mut()
        .map_err(|()| UploadError::Link(format!("{public_base} cannot be a base URL")))?
        .pop_if_empty()
        .push(key);
    Ok(link.to_string())
}

/// [`ArtifactStore`] over any `object_store` backend.
pub struct ObjectArtifactStore {
    inner: Arc<dyn ObjectStore>,
    public_base: Url,
}

/// Connection settings for an S3-compatible bucket.
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
}

impl ObjectArtifactStore {
    pub fn new(inner: Arc<dyn ObjectStore>, public_base: Url) -> Self {
        Self { inner, public_base }
    }

    pub fn s3(settings: &S3Settings, public_base: Url) -> Result<Self, UploadError> {
        let store = AmazonS3Builder::new()
            .with_endpoint(&settings.endpoint)
            .with_bucket_name(&settings.bucket)
            .with_region(&settings.region)
            .with_access_key_id(&settings.access_key)
            .with_secret_access_key(&settings.secret_key)
            .with_allow_http(settings.endpoint.starts_with("http://"))
            .with_client_options(ClientOptions::new().with_default_content_type(PDF_CONTENT_TYPE))
            .build()?;
        Ok(Self::new(Arc::new(store), public_base))
    }

    pub fn local(root: impl AsRef<Path>, public_base: Url) -> Result<Self, UploadError> {
        let root = root.as_ref();
        std::fs::create_dir_all(root).map_err(|source| UploadError::Read {
            path: root.to_path_buf(),
            source,
        })?;
        let store = LocalFileSystem::new_with_prefix(root)?;
        Ok(Self::new(Arc::new(store), public_base))
    }
}

#[async_trait]
impl ArtifactStore for ObjectArtifactStore {
    async fn upload(&self, local_path: &Path, key: &str) -> Result<String, UploadError> {
        let data = tokio::fs::read(local_path)
            .await
            .map_err(|source| UploadError::Read {
                path: local_path.to_path_buf(),
                source,
            })?;
        let size = data.len();

        self.inner
            .put(&StorePath::from(key), PutPayload::from(Bytes::from(data)))
            .await?;

        let link = link_for_key(&self.public_base, key)?;
        info!(key, bytes = size, link = %link, "Artifact uploaded");
        Ok(link)
    }
}
