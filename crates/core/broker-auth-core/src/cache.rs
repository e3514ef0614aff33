use crate::{AuthOutcome, Clock, SystemClock, TokenAuthenticator};
use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::trace;

/// A memoized authentication outcome. Never modified after insertion.
#[derive(Debug, Clone)]
struct CacheRecord {
    created: Instant,
    outcome: AuthOutcome,
}

impl CacheRecord {
    fn is_live(&self, now: Instant, ttl: Duration) -> bool {
        self.created + ttl > now
    }
}

/// Decorates a token authenticator with bounded, time-limited memoization.
///
/// Records are keyed by the raw token. Successes, "no opinion" answers and
/// authentication-class errors are remembered for `ttl`; every other error is
/// passed through uncached so that a backend outage is retried on the next
/// request. Least recently used records are evicted once `capacity` is reached.
pub struct CachingTokenAuthenticator {
    inner: Arc<dyn TokenAuthenticator>,
    ttl: Duration,
    cache: Mutex<LruCache<String, CacheRecord>>,
    clock: Arc<dyn Clock>,
}

impl CachingTokenAuthenticator {
    pub fn new(inner: Arc<dyn TokenAuthenticator>, ttl: Duration, capacity: NonZeroUsize) -> Self {
        Self::with_clock(inner, ttl, capacity, Arc::new(SystemClock))
    }

    pub fn with_clock(
        inner: Arc<dyn TokenAuthenticator>,
        ttl: Duration,
        capacity: NonZeroUsize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner,
            ttl,
            cache: Mutex::new(LruCache::new(capacity)),
            clock,
        }
    }

    /// Number of records currently held, live or not.
    pub async fn len(&self) -> usize {
        self.cache.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.lock().await.is_empty()
    }

    async fn lookup(&self, token: &str) -> Option<AuthOutcome> {
        let now = self.clock.now();
        let mut cache = self.cache.lock().await;

        let record = cache.get(token)?;
        if record.is_live(now, self.ttl) {
            return Some(record.outcome.clone());
        }

        cache.pop(token);
        None
    }

    async fn remember(&self, token: &str, outcome: &AuthOutcome) {
        let record = CacheRecord {
            created: self.clock.now(),
            outcome: outcome.clone(),
        };
        self.cache.lock().await.put(token.to_string(), record);
    }
}

fn is_cacheable(outcome: &AuthOutcome) -> bool {
    match outcome {
        Ok(_) => true,
        Err(err) => err.is_auth_class(),
    }
}

#[async_trait]
impl TokenAuthenticator for CachingTokenAuthenticator {
    async fn authenticate_token(&self, token: &str) -> AuthOutcome {
        if let Some(outcome) = self.lookup(token).await {
            trace!("token cache hit");
            return outcome;
        }

        // The lock is released while the backend is consulted, so two
        // concurrent misses for one token may both reach the backend.
        let outcome = self.inner.authenticate_token(token).await;

        if is_cacheable(&outcome) {
            self.remember(token, &outcome).await;
        } else {
            trace!("token outcome not cacheable");
        }
        outcome
    }
}

/// Wraps `inner` in a cache when both `ttl` and `capacity` are positive,
/// otherwise returns `inner` unchanged.
pub fn new_caching_authenticator(
    inner: Arc<dyn TokenAuthenticator>,
    ttl: Duration,
    capacity: usize,
) -> Arc<dyn TokenAuthenticator> {
    match NonZeroUsize::new(capacity) {
        Some(capacity) if !ttl.is_zero() => {
            Arc::new(CachingTokenAuthenticator::new(inner, ttl, capacity))
        }
        _ => inner,
    }
}
