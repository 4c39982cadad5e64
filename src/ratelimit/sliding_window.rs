use crate::store::SharedStore;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct SlidingWindowCheck {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_in_secs: u64,
}

/// Fixed-window counter keyed by `identity:floor(now / window_secs)`.
/// Approximates a sliding window with O(1) state; the store's atomic
/// increment-with-TTL is what makes concurrent checks correct.
pub struct SlidingWindowLimiter {
    store: Arc<SharedStore>,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<SharedStore>) -> Self {
        Self { store }
    }

    /// Fails open (allowed=true, full remaining) if the store is
    /// unreachable — availability over strictness, per the limiter's
    /// documented failure semantics. Callers should emit a metric on the
    /// `Err` branch before treating the request as allowed.
    pub async fn check(
        &self,
        identity: &str,
        limit: u64,
        window_secs: u64,
    ) -> Result<SlidingWindowCheck, crate::error::GatewayError> {
        let window_secs = window_secs.max(1);
        // The bucket id is resolved from the store's own clock inside the
        // script (`TIME`), but we need it client-side too to build the key
        // before the round-trip, so approximate with wall-clock here; the
        // store is the source of truth for `now_secs` returned in the result.
        let approx_now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let bucket = approx_now / window_secs;
        let key = format!("ratelimit:sw:{identity}:{bucket}");

        let incr = self
            .store
            .incr_with_ttl(&key, Duration::from_secs(window_secs * 2))
            .await?;

        let allowed = incr.count <= limit;
        let remaining = limit.saturating_sub(incr.count);
        let reset_in_secs = window_secs - (incr.now_secs % window_secs);

        Ok(SlidingWindowCheck {
            allowed,
            limit,
            remaining,
            reset_in_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_limit_then_denies() {
        let store = Arc::new(SharedStore::memory());
        let limiter = SlidingWindowLimiter::new(store);

        for expected_remaining in [2u64, 1, 0] {
            let check = limiter.check("user-a", 3, 10).await.unwrap();
            assert!(check.allowed);
            assert_eq!(check.remaining, expected_remaining);
        }

        let denied = limiter.check("user-a", 3, 10).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
    }

    #[tokio::test]
    async fn distinct_identities_do_not_share_a_budget() {
        let store = Arc::new(SharedStore::memory());
        let limiter = SlidingWindowLimiter::new(store);

        for _ in 0..5 {
            assert!(limiter.check("user-a", 5, 10).await.unwrap().allowed);
        }
        // user-b's budget is untouched by user-a's requests.
        let check = limiter.check("user-b", 5, 10).await.unwrap();
        assert!(check.allowed);
        assert_eq!(check.remaining, 4);
    }

    #[tokio::test]
    async fn remaining_never_increases_across_allowed_requests() {
        let store = Arc::new(SharedStore::memory());
        let limiter = SlidingWindowLimiter::new(store);

        let mut last_remaining = u64::MAX;
        for _ in 0..10 {
            let check = limiter.check("user-a", 100, 10).await.unwrap();
            if check.allowed {
                assert!(check.remaining <= last_remaining);
                last_remaining = check.remaining;
            }
        }
    }
}
