use super::{IncrResult, TokenBucketResult};
use crate::error::GatewayError;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

struct CounterEntry {
    count: u64,
    expires_at: u64,
}

struct BucketEntry {
    tokens: f64,
    last_refill_secs: f64,
}

/// In-process stand-in for the shared store, used when no store URL is
/// configured and by tests. Single-instance only — it does not provide the
/// cross-gateway convergence a real Redis-backed store gives, but it honors
/// the same atomicity contract for a single process.
pub struct MemoryStore {
    counters: DashMap<String, CounterEntry>,
    buckets: Arc<DashMap<String, Mutex<BucketEntry>>>,
    json: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            buckets: Arc::new(DashMap::new()),
            json: DashMap::new(),
        }
    }

    pub async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<IncrResult, GatewayError> {
        let now = now_secs();
        let mut entry = self.counters.entry(key.to_string()).or_insert(CounterEntry {
            count: 0,
            expires_at: now + ttl.as_secs().max(1),
        });
        if entry.expires_at <= now {
            entry.count = 0;
            entry.expires_at = now + ttl.as_secs().max(1);
        }
        entry.count += 1;
        Ok(IncrResult {
            count: entry.count,
            now_secs: now,
        })
    }

    pub async fn token_bucket_consume(
        &self,
        key: &str,
        capacity: f64,
        refill_per_second: f64,
        cost: f64,
        _ttl: Duration,
    ) -> Result<TokenBucketResult, GatewayError> {
        let entry = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                Mutex::new(BucketEntry {
                    tokens: capacity,
                    last_refill_secs: now_secs() as f64,
                })
            });
        let mut b = entry.lock().await;
        let now = now_secs() as f64;
        let elapsed = (now - b.last_refill_secs).max(0.0);
        let refilled = (b.tokens + elapsed * refill_per_second).min(capacity);
        let (tokens_after, allowed) = if refilled >= cost {
            (refilled - cost, true)
        } else {
            (refilled, false)
        };
        b.tokens = tokens_after;
        b.last_refill_secs = now;
        Ok(TokenBucketResult {
            tokens_remaining: tokens_after,
            allowed,
        })
    }

    pub async fn get_json(&self, key: &str) -> Result<Option<String>, GatewayError> {
        Ok(self.json.get(key).map(|v| v.clone()))
    }

    pub async fn compare_and_set_json(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
    ) -> Result<bool, GatewayError> {
        let matches = match self.json.get(key) {
            Some(current) => expected == Some(current.as_str()),
            None => expected.is_none(),
        };
        if matches {
            self.json.insert(key.to_string(), new_value.to_string());
        }
        Ok(matches)
    }
}
