//! In-memory blob store for tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use coverdocs_core::{
    sha256_hex, BlobInfo, BlobStore, Error, PresignOp, PresignedUrl, Result,
};

use crate::sign;

/// HashMap-backed BlobStore with the same presign scheme as the
/// filesystem store.
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    signing_key: Vec<u8>,
    /// Remaining puts to reject, for upstream-failure tests.
    put_failures: Mutex<u32>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            signing_key: b"memory-blobstore-key".to_vec(),
            put_failures: Mutex::new(0),
        }
    }

    /// Make the next `n` puts fail with a retryable upstream error.
    pub async fn fail_next_puts(&self, n: u32) {
        *self.put_failures.lock().await = n;
    }

    pub async fn object_count(&self) -> usize {
        self.objects.lock().await.len()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.objects.lock().await.contains_key(key)
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: &[u8], _content_type: &str) -> Result<String> {
        {
            let mut failures = self.put_failures.lock().await;
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::upstream("blobstore", "injected put failure"));
            }
        }
        self.objects
            .lock()
            .await
            .insert(key.to_string(), data.to_vec());
        Ok(sha256_hex(data))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("blob {key}")))
    }

    async fn presign(&self, key: &str, op: PresignOp, ttl: Duration) -> Result<PresignedUrl> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).map_err(|e| Error::Config(e.to_string()))?;
        let signature = sign::sign(&self.signing_key, op, key, expires_at)?;
        Ok(PresignedUrl {
            url: sign::presigned_url("memory://blobs", key, op, expires_at, &signature),
            expires_at,
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().await.remove(key);
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<Option<BlobInfo>> {
        Ok(self.objects.lock().await.get(key).map(|data| BlobInfo {
            size: data.len() as i64,
            etag: sha256_hex(data),
        }))
    }
}
