use crate::store::SharedStore;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketCheck {
    pub allowed: bool,
    pub remaining: f64,
}

/// Continuously refilling token bucket, atomic within the store via a
/// scripted read-modify-write.
pub struct TokenBucketLimiter {
    store: Arc<SharedStore>,
}

impl TokenBucketLimiter {
    pub fn new(store: Arc<SharedStore>) -> Self {
        Self { store }
    }

    pub async fn consume(
        &self,
        identity: &str,
        capacity: f64,
        refill_per_second: f64,
        cost: f64,
    ) -> Result<TokenBucketCheck, crate::error::GatewayError> {
        let ttl_secs = if refill_per_second > 0.0 {
            ((capacity / refill_per_second) * 2.0).ceil().max(1.0) as u64
        } else {
            3600
        };
        let key = format!("ratelimit:tb:{identity}");
        let result = self
            .store
            .token_bucket_consume(
                &key,
                capacity,
                refill_per_second,
                cost,
                Duration::from_secs(ttl_secs),
            )
            .await?;
        Ok(TokenBucketCheck {
            allowed: result.allowed,
            remaining: result.tokens_remaining,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_burst_up_to_capacity_then_denies() {
        let store = Arc::new(SharedStore::memory());
        let limiter = TokenBucketLimiter::new(store);

        for _ in 0..5 {
            let check = limiter.consume("user-a", 5.0, 1.0, 1.0).await.unwrap();
            assert!(check.allowed);
        }
        let denied = limiter.consume("user-a", 5.0, 1.0, 1.0).await.unwrap();
        assert!(!denied.allowed);
    }

    #[tokio::test]
    async fn distinct_identities_have_independent_buckets() {
        let store = Arc::new(SharedStore::memory());
        let limiter = TokenBucketLimiter::new(store);

        for _ in 0..3 {
            assert!(limiter.consume("a", 3.0, 1.0, 1.0).await.unwrap().allowed);
        }
        assert!(!limiter.consume("a", 3.0, 1.0, 1.0).await.unwrap().allowed);
        assert!(limiter.consume("b", 3.0, 1.0, 1.0).await.unwrap().allowed);
    }
}
