//! Blob access for `File.path`
//!
//! Paths of the form `s3://<key>` are downloaded from the configured MinIO/S3
//! bucket; anything else is read from the local filesystem.

use std::path::{Path, PathBuf};

use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::config::BlobConfig;
use crate::error::StagingError;

const S3_SCHEME: &str = "s3://";

/// One bucket on an S3-compatible server
#[derive(Clone)]
pub struct S3Blobs {
    client: Client,
    bucket: String,
}

impl S3Blobs {
    /// `None` when no endpoint is configured
    pub fn new(config: &BlobConfig) -> Option<Self> {
        let endpoint_url = config.endpoint_url()?;
        info!("Fetching s3:// files from {} (bucket {})", endpoint_url, config.bucket);

        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "grader-config",
        );
        let sdk_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(endpoint_url)
            .credentials_provider(credentials)
            // MinIO serves buckets as path segments, not subdomains
            .force_path_style(true)
            .build();

        Some(Self {
            client: Client::from_conf(sdk_config),
            bucket: config.bucket.clone(),
        })
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, String> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| format!("{} ({})", e, self.bucket))?;
        let body = object.body.collect().await.map_err(|e| e.to_string())?;
        Ok(body.into_bytes().to_vec())
    }
}

/// Resolves `File.path` to bytes
#[derive(Clone, Default)]
pub struct BlobStore {
    /// Base for relative local paths
    local_root: Option<PathBuf>,
    s3: Option<S3Blobs>,
}

impl BlobStore {
    pub fn local() -> Self {
        Self::default()
    }

    pub fn from_config(config: &BlobConfig) -> Self {
        Self {
            local_root: config.local_root.clone(),
            s3: S3Blobs::new(config),
        }
    }

    pub fn with_local_root(mut self, root: impl AsRef<Path>) -> Self {
        self.local_root = Some(root.as_ref().to_path_buf());
        self
    }

    pub async fn fetch(&self, path: &str) -> Result<Vec<u8>, StagingError> {
        if let Some(key) = path.strip_prefix(S3_SCHEME) {
            let s3 = self.s3.as_ref().ok_or_else(|| StagingError::Fetch {
                path: path.to_string(),
                reason: "no S3 bucket configured".into(),
            })?;
            debug!("Downloading blob {} from S3", key);
            return s3.get(key).await.map_err(|reason| StagingError::Fetch {
                path: path.to_string(),
                reason,
            });
        }

        let local = match &self.local_root {
            Some(root) if Path::new(path).is_relative() => root.join(path),
            _ => PathBuf::from(path),
        };
        tokio::fs::read(&local)
            .await
            .map_err(|e| StagingError::Fetch {
                path: path.to_string(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_local_relative_to_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blob.txt"), b"payload").unwrap();

        let blobs = BlobStore::local().with_local_root(dir.path());
        assert_eq!(blobs.fetch("blob.txt").await.unwrap(), b"payload");

        let absolute = dir.path().join("blob.txt");
        let blobs = BlobStore::local();
        assert_eq!(blobs.fetch(absolute.to_str().unwrap()).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_from_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blob.txt"), b"payload").unwrap();
        let config = BlobConfig {
            local_root: Some(dir.path().to_path_buf()),
            ..BlobConfig::default()
        };

        let blobs = BlobStore::from_config(&config);
        assert!(blobs.s3.is_none());
        assert_eq!(blobs.fetch("blob.txt").await.unwrap(), b"payload");

        let with_endpoint = BlobConfig {
            endpoint: Some("localhost".into()),
            ..BlobConfig::default()
        };
        assert!(BlobStore::from_config(&with_endpoint).s3.is_some());
    }

    #[tokio::test]
    async fn test_fetch_errors() {
        let blobs = BlobStore::local();
        assert!(matches!(
            blobs.fetch("/no/such/blob").await,
            Err(StagingError::Fetch { .. })
        ));
        assert!(matches!(
            blobs.fetch("s3://bucket/key").await,
            Err(StagingError::Fetch { .. })
        ));
    }
}
