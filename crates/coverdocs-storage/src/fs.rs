//! Filesystem blob store.
//!
//! Stores objects under a base directory keyed by their storage key, with
//! atomic tmp+rename writes and 0644 permissions. Presigned URLs are
//! HMAC-signed against a configured public base URL; a fronting file server
//! is expected to verify them with [`crate::sign::verify`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use coverdocs_core::{
    sha256_hex, BlobInfo, BlobStore, Error, PresignOp, PresignedUrl, Result,
};

use crate::sign;

/// Filesystem implementation of the BlobStore capability.
pub struct FsBlobStore {
    base_path: PathBuf,
    public_base_url: String,
    signing_key: Vec<u8>,
}

impl FsBlobStore {
    pub fn new(
        base_path: impl Into<PathBuf>,
        public_base_url: impl Into<String>,
        signing_key: Vec<u8>,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            public_base_url: public_base_url.into(),
            signing_key,
        }
    }

    fn full_path(&self, key: &str) -> Result<PathBuf> {
        // Storage keys are internal, but refuse traversal outright.
        if key.split('/').any(|seg| seg == "..") || key.starts_with('/') {
            return Err(Error::Validation(format!("invalid storage key: {key}")));
        }
        Ok(self.base_path.join(key))
    }

    /// Validate that the backend can write, read, and delete files.
    ///
    /// A full round-trip at startup catches permission errors and missing
    /// mounts before the first upload does.
    pub async fn validate(&self) -> Result<()> {
        let test_dir = self.base_path.join(".health-check");
        let test_file = test_dir.join("probe.bin");

        fs::create_dir_all(&test_dir).await?;
        let data = b"storage-health-check";
        fs::write(&test_file, data).await?;
        let read_back = fs::read(&test_file).await?;
        if read_back != data {
            return Err(Error::Internal("storage probe read-back mismatch".into()));
        }
        fs::remove_file(&test_file).await?;
        let _ = fs::remove_dir(&test_dir).await;
        Ok(())
    }

    async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                warn!(parent = %parent.display(), error = %e, "blobstore: create_dir_all failed");
                Error::Io(e)
            })?;
        }

        // Atomic write: temp file + rename.
        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, path).await?;

        // 0644: readable, never executable.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, data: &[u8], _content_type: &str) -> Result<String> {
        let path = self.full_path(key)?;
        debug!(
            subsystem = "storage",
            component = "blobstore",
            op = "put",
            storage_key = %key,
            file_size = data.len(),
            "Writing blob"
        );
        Self::write_atomic(&path, data).await?;
        Ok(sha256_hex(data))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.full_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("blob {key}")))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn presign(&self, key: &str, op: PresignOp, ttl: Duration) -> Result<PresignedUrl> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).map_err(|e| Error::Config(e.to_string()))?;
        let signature = sign::sign(&self.signing_key, op, key, expires_at)?;
        Ok(PresignedUrl {
            url: sign::presigned_url(&self.public_base_url, key, op, expires_at, &signature),
            expires_at,
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.full_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            // Idempotent: deleting a missing blob is fine.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn head(&self, key: &str) -> Result<Option<BlobInfo>> {
        let path = self.full_path(key)?;
        match fs::metadata(&path).await {
            Ok(meta) => {
                let data = fs::read(&path).await?;
                Ok(Some(BlobInfo {
                    size: meta.len() as i64,
                    etag: sha256_hex(&data),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }
}
