//! Storage service: durable, content-addressed file storage.
//!
//! Sits between the document service and the blob store: computes content
//! hashes, derives storage keys, deduplicates identical content, and issues
//! TTL-clamped presigned URLs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Datelike;
use tracing::{debug, info, warn};

use coverdocs_core::{
    extension_of, sha256_hex, BlobStore, Clock, DocumentStore, Error, PresignOp, PresignedUrl,
    Result, StorageConfig, StoredFile,
};

/// Map an upstream blob failure to a typed, retryable storage error.
fn blob_err(e: Error) -> Error {
    match e {
        Error::Upstream { .. } | Error::NotFound(_) | Error::Validation(_) => e,
        Error::Io(io) => Error::Upstream {
            service: "blobstore",
            message: io.to_string(),
            retryable: true,
        },
        other => Error::Upstream {
            service: "blobstore",
            message: other.to_string(),
            retryable: true,
        },
    }
}

/// Storage orchestration over a [`BlobStore`] capability.
pub struct StorageService {
    blob: Arc<dyn BlobStore>,
    config: StorageConfig,
    clock: Arc<dyn Clock>,
}

impl StorageService {
    pub fn new(blob: Arc<dyn BlobStore>, config: StorageConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            blob,
            config,
            clock,
        }
    }

    /// Derive the content-addressed storage key:
    /// `documents/{owner_id}/{yyyy}/{hash}.{ext}`.
    pub fn storage_key(&self, owner_id: &str, filename: &str, mime_type: &str, hash: &str) -> String {
        let year = self.clock.utc_now().year();
        let ext = extension_of(filename).unwrap_or_else(|| extension_for_mime(mime_type));
        format!("documents/{owner_id}/{year}/{hash}.{ext}")
    }

    /// Make content durable and return its descriptor.
    ///
    /// Idempotent: when the blob store already holds the key with the same
    /// size, the upload is skipped and the existing descriptor returned.
    pub async fn store(
        &self,
        owner_id: &str,
        filename: &str,
        data: &[u8],
        mime_type: &str,
    ) -> Result<StoredFile> {
        if data.is_empty() {
            return Err(Error::Validation("file is empty".to_string()));
        }
        let size = data.len() as i64;
        if size > self.config.max_file_size {
            return Err(Error::Validation(format!(
                "file size {} exceeds limit {}",
                size, self.config.max_file_size
            )));
        }
        if let Some(ext) = extension_of(filename) {
            let limit = coverdocs_core::defaults::size_limit_for(&ext);
            if size > limit {
                return Err(Error::Validation(format!(
                    "file size {} exceeds {} limit of {}",
                    size, ext, limit
                )));
            }
        }

        let hash = sha256_hex(data);
        let key = self.storage_key(owner_id, filename, mime_type, &hash);

        // Content-addressed dedup: identical content lands on the same key.
        match self.blob.head(&key).await.map_err(blob_err)? {
            Some(info) if info.size == size => {
                debug!(
                    subsystem = "storage",
                    component = "service",
                    op = "store",
                    storage_key = %key,
                    "Blob already present, skipping upload"
                );
            }
            _ => {
                self.blob
                    .put(&key, data, mime_type)
                    .await
                    .map_err(blob_err)?;
                info!(
                    subsystem = "storage",
                    component = "service",
                    op = "store",
                    storage_key = %key,
                    file_size = size,
                    owner_id = %owner_id,
                    "Stored blob"
                );
            }
        }

        Ok(StoredFile {
            bucket: self.config.bucket.clone(),
            key,
            hash,
            size,
            mime_type: mime_type.to_string(),
        })
    }

    /// Issue a presigned URL, clamping the TTL to the configured maximum.
    /// Indefinite URLs are never issued.
    pub async fn presign(
        &self,
        storage_key: &str,
        op: PresignOp,
        ttl: Duration,
    ) -> Result<PresignedUrl> {
        let ttl = ttl.min(self.config.presign_ttl_max);
        let ttl = if ttl.is_zero() {
            self.config.presign_ttl_max
        } else {
            ttl
        };
        self.blob.presign(storage_key, op, ttl).await.map_err(blob_err)
    }

    /// Fetch blob content.
    pub async fn fetch(&self, storage_key: &str) -> Result<Vec<u8>> {
        self.blob.get(storage_key).await.map_err(blob_err)
    }

    /// Unconditional, idempotent delete.
    pub async fn delete(&self, storage_key: &str) -> Result<()> {
        self.blob.delete(storage_key).await.map_err(blob_err)
    }

    /// Delete candidate blobs no longer referenced by any document row.
    ///
    /// Candidates come from the operator's listing of the blob backend; keys
    /// still referenced (including by soft-deleted documents) are kept.
    /// Returns the number of blobs removed.
    pub async fn sweep_orphans(
        &self,
        documents: &dyn DocumentStore,
        candidate_keys: &[String],
    ) -> Result<u64> {
        let mut removed = 0;
        for key in candidate_keys {
            if documents.storage_key_exists(key).await? {
                continue;
            }
            match self.blob.delete(key).await.map_err(blob_err) {
                Ok(()) => removed += 1,
                Err(e) => {
                    // The sweeper retries on its next pass.
                    warn!(
                        subsystem = "storage",
                        component = "sweeper",
                        storage_key = %key,
                        error = %e,
                        "Failed to delete orphan blob"
                    );
                }
            }
        }
        if removed > 0 {
            info!(
                subsystem = "storage",
                component = "sweeper",
                affected = removed,
                "Removed orphan blobs"
            );
        }
        Ok(removed)
    }
}

fn extension_for_mime(mime: &str) -> String {
    match mime {
        "application/pdf" => "pdf",
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/tiff" => "tif",
        _ => "bin",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBlobStore;
    use coverdocs_core::SystemClock;

    fn service(blob: Arc<MemoryBlobStore>) -> StorageService {
        StorageService::new(blob, StorageConfig::default(), Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn test_store_shapes_descriptor() {
        let blob = Arc::new(MemoryBlobStore::new());
        let svc = service(blob.clone());

        let stored = svc
            .store("u1", "inv.pdf", b"%PDF-1.7 body", "application/pdf")
            .await
            .unwrap();

        assert_eq!(stored.hash, sha256_hex(b"%PDF-1.7 body"));
        assert_eq!(stored.size, 13);
        let year = chrono::Utc::now().year();
        assert_eq!(
            stored.key,
            format!("documents/u1/{year}/{}.pdf", stored.hash)
        );
        assert!(blob.contains(&stored.key).await);
    }

    #[tokio::test]
    async fn test_store_rejects_empty() {
        let svc = service(Arc::new(MemoryBlobStore::new()));
        let err = svc.store("u1", "a.pdf", b"", "application/pdf").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_store_enforces_per_type_limit() {
        let svc = service(Arc::new(MemoryBlobStore::new()));
        // jpeg limit is 20 MiB, below the 50 MiB global ceiling.
        let big = vec![0xFFu8; 20 * 1024 * 1024 + 1];
        let err = svc
            .store("u1", "scan.jpeg", &big, "image/jpeg")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_store_dedups_identical_content() {
        let blob = Arc::new(MemoryBlobStore::new());
        let svc = service(blob.clone());

        let first = svc
            .store("u1", "inv.pdf", b"same bytes", "application/pdf")
            .await
            .unwrap();
        let second = svc
            .store("u1", "renamed.pdf", b"same bytes", "application/pdf")
            .await
            .unwrap();

        assert_eq!(first.key, second.key);
        assert_eq!(blob.object_count().await, 1);
    }

    #[tokio::test]
    async fn test_store_upstream_failure_is_retryable() {
        let blob = Arc::new(MemoryBlobStore::new());
        blob.fail_next_puts(1).await;
        let svc = service(blob);

        let err = svc
            .store("u1", "inv.pdf", b"bytes", "application/pdf")
            .await
            .unwrap_err();
        assert!(err.retryable());
    }

    #[tokio::test]
    async fn test_presign_clamps_ttl() {
        let svc = service(Arc::new(MemoryBlobStore::new()));
        let presigned = svc
            .presign("k", PresignOp::Get, Duration::from_secs(86_400))
            .await
            .unwrap();
        let lifetime = presigned.expires_at - chrono::Utc::now();
        assert!(lifetime.num_seconds() <= 3600 + 1);
        assert!(lifetime.num_seconds() > 3500);
    }

    #[tokio::test]
    async fn test_presign_zero_ttl_gets_default() {
        let svc = service(Arc::new(MemoryBlobStore::new()));
        let presigned = svc.presign("k", PresignOp::Get, Duration::ZERO).await.unwrap();
        assert!(presigned.expires_at > chrono::Utc::now());
    }

    #[tokio::test]
    async fn test_delete_idempotent() {
        let blob = Arc::new(MemoryBlobStore::new());
        let svc = service(blob.clone());
        let stored = svc
            .store("u1", "a.pdf", b"x1", "application/pdf")
            .await
            .unwrap();
        svc.delete(&stored.key).await.unwrap();
        svc.delete(&stored.key).await.unwrap();
        assert_eq!(blob.object_count().await, 0);
    }

    #[tokio::test]
    async fn test_key_extension_falls_back_to_mime() {
        let svc = service(Arc::new(MemoryBlobStore::new()));
        let key = svc.storage_key("u1", "no-extension", "image/png", "deadbeef");
        assert!(key.ends_with("deadbeef.png"));
    }
}
