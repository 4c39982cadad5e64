pub mod memory;
pub mod redis_store;

use crate::error::GatewayError;
use memory::MemoryStore;
use redis_store::RedisStore;
use std::time::Duration;

/// Result of an atomic increment-with-TTL operation: the post-increment
/// count and the store's own clock at the time of the operation (used by
/// the sliding-window limiter to avoid depending on gateway wall-clock,
/// which can skew across instances).
#[derive(Debug, Clone, Copy)]
pub struct IncrResult {
    pub count: u64,
    pub now_secs: u64,
}

/// Result of a token-bucket read-modify-write.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucketResult {
    pub tokens_remaining: f64,
    pub allowed: bool,
}

/// Adapter over the external shared key-value store: atomic counters, TTLs,
/// and scripted compare-and-set. Modeled as an enum rather than a trait
/// object — there are exactly two backends and the call sites are hot.
pub enum SharedStore {
    Redis(RedisStore),
    Memory(MemoryStore),
}

impl SharedStore {
    pub fn memory() -> Self {
        Self::Memory(MemoryStore::new())
    }

    pub async fn connect_redis(url: &str) -> Result<Self, GatewayError> {
        Ok(Self::Redis(RedisStore::connect(url).await?))
    }

    /// Atomically increments the counter at `key`, setting `ttl` on first
    /// insert. Used by the sliding-window limiter.
    pub async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<IncrResult, GatewayError> {
        match self {
            Self::Redis(s) => s.incr_with_ttl(key, ttl).await,
            Self::Memory(s) => s.incr_with_ttl(key, ttl).await,
        }
    }

    /// Atomic token-bucket refill-and-consume, scripted server-side where
    /// the backend supports it (Redis: a Lua script; in-memory: a mutex).
    pub async fn token_bucket_consume(
        &self,
        key: &str,
        capacity: f64,
        refill_per_second: f64,
        cost: f64,
        ttl: Duration,
    ) -> Result<TokenBucketResult, GatewayError> {
        match self {
            Self::Redis(s) => {
                s.token_bucket_consume(key, capacity, refill_per_second, cost, ttl)
                    .await
            }
            Self::Memory(s) => {
                s.token_bucket_consume(key, capacity, refill_per_second, cost, ttl)
                    .await
            }
        }
    }

    /// Reads a small JSON-serializable record. Used for circuit breaker
    /// state. Returns `None` if absent.
    pub async fn get_json(&self, key: &str) -> Result<Option<String>, GatewayError> {
        match self {
            Self::Redis(s) => s.get_json(key).await,
            Self::Memory(s) => s.get_json(key).await,
        }
    }

    /// Compare-and-set: writes `new_value` under `key` only if the current
    /// value equals `expected` (or the key is absent and `expected` is
    /// `None`). Returns whether the swap succeeded.
    pub async fn compare_and_set_json(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
    ) -> Result<bool, GatewayError> {
        match self {
            Self::Redis(s) => s.compare_and_set_json(key, expected, new_value).await,
            Self::Memory(s) => s.compare_and_set_json(key, expected, new_value).await,
        }
    }

    /// Best-effort liveness probe, used by `/health/detailed`.
    pub async fn ping(&self) -> bool {
        match self {
            Self::Redis(s) => s.ping().await,
            Self::Memory(_) => true,
        }
    }
}
