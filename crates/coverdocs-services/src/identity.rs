//! Identity provider decorators.
//!
//! The real identity service lives outside the core; this module provides
//! the TTL token cache wrapped around any provider, and a static provider
//! for tests and embedded use.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};

use coverdocs_core::{defaults, Error, IdentityProvider, Principal, Result};

/// TTL cache over token validation.
///
/// Successful validations are cached; failures are not, so a revoked token
/// stays revoked and a transient identity-service error is retried on the
/// next call.
pub struct CachedIdentity<P> {
    inner: P,
    ttl: Duration,
    cache: RwLock<HashMap<String, (Instant, Principal)>>,
}

impl<P: IdentityProvider> CachedIdentity<P> {
    pub fn new(inner: P) -> Self {
        Self::with_ttl(
            inner,
            Duration::from_secs(defaults::AUTH_TOKEN_CACHE_TTL_SECS),
        )
    }

    pub fn with_ttl(inner: P, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<P: IdentityProvider> IdentityProvider for CachedIdentity<P> {
    async fn validate(&self, token: &str) -> Result<Principal> {
        let now = Instant::now();
        {
            let cache = self.cache.read().await;
            if let Some((validated_at, principal)) = cache.get(token) {
                if now.duration_since(*validated_at) < self.ttl {
                    return Ok(principal.clone());
                }
            }
        }

        let principal = self.inner.validate(token).await?;
        self.cache
            .write()
            .await
            .insert(token.to_string(), (now, principal.clone()));
        Ok(principal)
    }
}

/// Fixed token table for tests and embedded deployments.
#[derive(Default)]
pub struct StaticIdentity {
    tokens: HashMap<String, Principal>,
}

impl StaticIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, principal: Principal) -> Self {
        self.tokens.insert(token.into(), principal);
        self
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn validate(&self, token: &str) -> Result<Principal> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| Error::Unauthenticated("unknown token".to_string()))
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
    impl IdentityProvider for CountingProvider {
        async fn validate(&self, token: &str) -> Result<Principal> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if token == "bad" {
                return Err(Error::Unauthenticated("bad token".to_string()));
            }
            Ok(Principal::user(token))
        }
    }

    #[tokio::test]
    async fn test_cache_hit_skips_provider() {
        let cached = CachedIdentity::with_ttl(
            CountingProvider {
                calls: AtomicUsize::new(0),
            },
            Duration::from_secs(300),
        );
        cached.validate("tok-1").await.unwrap();
        let principal = cached.validate("tok-1").await.unwrap();
        assert_eq!(principal.user_id, "tok-1");
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expires() {
        let cached = CachedIdentity::with_ttl(
            CountingProvider {
                calls: AtomicUsize::new(0),
            },
            Duration::from_secs(300),
        );
        cached.validate("tok-1").await.unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;
        cached.validate("tok-1").await.unwrap();
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failures_not_cached() {
        let cached = CachedIdentity::with_ttl(
            CountingProvider {
                calls: AtomicUsize::new(0),
            },
            Duration::from_secs(300),
        );
        assert!(cached.validate("bad").await.is_err());
        assert!(cached.validate("bad").await.is_err());
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_static_identity() {
        let provider = StaticIdentity::new().with_token("alpha", Principal::admin("ops"));
        let principal = provider.validate("alpha").await.unwrap();
        assert_eq!(principal.user_id, "ops");
        assert!(matches!(
            provider.validate("beta").await,
            Err(Error::Unauthenticated(_))
        ));
    }
}
