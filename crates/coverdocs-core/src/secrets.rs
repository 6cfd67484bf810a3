//! Secrets capability with TTL caching.
//!
//! All credentials (blob store signing keys, OCR engine API keys, database
//! URLs) flow through a [`SecretsProvider`]. The [`CachedSecrets`] decorator
//! bounds how often the underlying provider is consulted.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};

use crate::error::{Error, Result};

/// An opaque secret payload.
#[derive(Clone)]
pub struct SecretValue(Vec<u8>);

impl SecretValue {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.0)
            .map_err(|_| Error::Config("secret is not valid UTF-8".to_string()))
    }

    pub fn as_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.0)?)
    }
}

// Debug never prints the payload.
impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretValue(<{} bytes>)", self.0.len())
    }
}

/// Source of named secrets.
#[async_trait]
pub trait SecretsProvider: Send + Sync {
    async fn fetch(&self, name: &str) -> Result<SecretValue>;
}

/// Reads secrets from environment variables, uppercasing the name.
#[derive(Debug, Default)]
pub struct EnvSecretsProvider {
    prefix: String,
}

impl EnvSecretsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl SecretsProvider for EnvSecretsProvider {
    async fn fetch(&self, name: &str) -> Result<SecretValue> {
        let var = format!("{}{}", self.prefix, name.to_uppercase().replace('-', "_"));
        std::env::var(&var)
            .map(|v| SecretValue::new(v.into_bytes()))
            .map_err(|_| Error::Config(format!("secret {} not found in environment", name)))
    }
}

/// TTL cache over any provider.
pub struct CachedSecrets<P> {
    inner: P,
    ttl: Duration,
    cache: RwLock<HashMap<String, (Instant, SecretValue)>>,
}

impl<P: SecretsProvider> CachedSecrets<P> {
    pub fn new(inner: P) -> Self {
        Self::with_ttl(
            inner,
            Duration::from_secs(crate::defaults::SECRETS_CACHE_TTL_SECS),
        )
    }

    pub fn with_ttl(inner: P, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Drop all cached values (e.g. after a rotation event).
    pub async fn invalidate(&self) {
        self.cache.write().await.clear();
    }
}

#[async_trait]
impl<P: SecretsProvider> SecretsProvider for CachedSecrets<P> {
    async fn fetch(&self, name: &str) -> Result<SecretValue> {
        let now = Instant::now();
        {
            let cache = self.cache.read().await;
            if let Some((fetched_at, value)) = cache.get(name) {
                if now.duration_since(*fetched_at) < self.ttl {
                    return Ok(value.clone());
                }
            }
        }

        let value = self.inner.fetch(name).await?;
        self.cache
            .write()
            .await
            .insert(name.to_string(), (now, value.clone()));
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SecretsProvider for CountingProvider {
        async fn fetch(&self, name: &str) -> Result<SecretValue> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(SecretValue::new(format!("{}:{}", name, n).into_bytes()))
        }
    }

    #[tokio::test]
    async fn test_cache_hit_within_ttl() {
        let cached = CachedSecrets::with_ttl(
            CountingProvider {
                calls: AtomicUsize::new(0),
            },
            Duration::from_secs(60),
        );

        let a = cached.fetch("api-key").await.unwrap();
        let b = cached.fetch("api-key").await.unwrap();
        assert_eq!(a.as_str().unwrap(), b.as_str().unwrap());
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expires_after_ttl() {
        let cached = CachedSecrets::with_ttl(
            CountingProvider {
                calls: AtomicUsize::new(0),
            },
            Duration::from_secs(60),
        );

        cached.fetch("api-key").await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        cached.fetch("api-key").await.unwrap();
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_clears_cache() {
        let cached = CachedSecrets::with_ttl(
            CountingProvider {
                calls: AtomicUsize::new(0),
            },
            Duration::from_secs(60),
        );

        cached.fetch("signing-key").await.unwrap();
        cached.invalidate().await;
        cached.fetch("signing-key").await.unwrap();
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_distinct_names_cached_separately() {
        let cached = CachedSecrets::with_ttl(
            CountingProvider {
                calls: AtomicUsize::new(0),
            },
            Duration::from_secs(60),
        );

        cached.fetch("a").await.unwrap();
        cached.fetch("b").await.unwrap();
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_env_provider_missing() {
        let provider = EnvSecretsProvider::new();
        let err = provider.fetch("definitely-not-set-xyz").await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_secret_debug_redacts() {
        let secret = SecretValue::new(b"hunter2".to_vec());
        let dbg = format!("{:?}", secret);
        assert!(!dbg.contains("hunter2"));
    }

    #[test]
    fn test_secret_as_json() {
        let secret = SecretValue::new(br#"{"key":"k","region":"ap-east-1"}"#.to_vec());
        let json = secret.as_json().unwrap();
        assert_eq!(json["region"], "ap-east-1");
    }
}
