use super::{IncrResult, TokenBucketResult};
use crate::error::GatewayError;
use deadpool_redis::{Config, Pool, Runtime};
use redis::Script;
use std::time::Duration;

/// Atomically increments `KEYS[1]` and, only on the first write, sets its
/// TTL to `ARGV[1]` seconds. Returns `{count, now_secs}` so the caller never
/// has to trust its own wall clock for window bookkeeping.
const INCR_WITH_TTL: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
local now = redis.call('TIME')
return {count, now[1]}
"#;

/// Refill-then-consume token bucket. `ARGV`: capacity, refill_per_second,
/// cost, ttl_secs. Stores `tokens|last_refill_secs` as a single string so
/// the read-modify-write stays inside one script invocation.
const TOKEN_BUCKET: &str = r#"
local raw = redis.call('GET', KEYS[1])
local tokens
local last_refill
if raw then
    local sep = string.find(raw, '|')
    tokens = tonumber(string.sub(raw, 1, sep - 1))
    last_refill = tonumber(string.sub(raw, sep + 1))
else
    tokens = tonumber(ARGV[1])
    last_refill = tonumber(redis.call('TIME')[1])
end
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
local now = tonumber(redis.call('TIME')[1])
local elapsed = now - last_refill
if elapsed < 0 then elapsed = 0 end
local refilled = math.min(capacity, tokens + elapsed * refill_rate)
local allowed
local remaining
if refilled >= cost then
    remaining = refilled - cost
    allowed = 1
else
    remaining = refilled
    allowed = 0
end
redis.call('SET', KEYS[1], tostring(remaining) .. '|' .. tostring(now), 'EX', ttl)
return {tostring(remaining), allowed}
"#;

/// Compare-and-set on a plain string value: writes `ARGV[2]` only if the
/// current value equals `ARGV[1]` (empty string standing for "absent").
const CAS: &str = r#"
local current = redis.call('GET', KEYS[1])
local expected = ARGV[1]
local matches
if current == false then
    matches = (expected == '')
else
    matches = (current == expected)
end
if matches == true then
    redis.call('SET', KEYS[1], ARGV[2])
    return 1
else
    return 0
end
"#;

/// Thin adapter over Redis, used as the production shared store. Atomicity
/// for multi-step operations (increment+expire, refill+consume, CAS) is
/// pushed server-side via Lua scripts rather than client-side retry loops.
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, GatewayError> {
        let cfg = Config::from_url(url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| GatewayError::Store(format!("building redis pool: {e}")))?;
        // Fail fast at startup if the store is unreachable.
        let mut conn = pool
            .get()
            .await
            .map_err(|e| GatewayError::Store(format!("connecting to redis: {e}")))?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| GatewayError::Store(format!("redis ping failed: {e}")))?;
        Ok(Self { pool })
    }

    pub async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<IncrResult, GatewayError> {
        let mut conn = self.conn().await?;
        let (count, now_secs): (u64, u64) = Script::new(INCR_WITH_TTL)
            .key(key)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| GatewayError::Store(format!("incr_with_ttl: {e}")))?;
        Ok(IncrResult { count, now_secs })
    }

    pub async fn token_bucket_consume(
        &self,
        key: &str,
        capacity: f64,
        refill_per_second: f64,
        cost: f64,
        ttl: Duration,
    ) -> Result<TokenBucketResult, GatewayError> {
        let mut conn = self.conn().await?;
        let (remaining, allowed): (String, i64) = Script::new(TOKEN_BUCKET)
            .key(key)
            .arg(capacity)
            .arg(refill_per_second)
            .arg(cost)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| GatewayError::Store(format!("token_bucket_consume: {e}")))?;
        Ok(TokenBucketResult {
            tokens_remaining: remaining.parse().unwrap_or(0.0),
            allowed: allowed == 1,
        })
    }

    pub async fn get_json(&self, key: &str) -> Result<Option<String>, GatewayError> {
        let mut conn = self.conn().await?;
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| GatewayError::Store(format!("get_json: {e}")))
    }

    pub async fn compare_and_set_json(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
    ) -> Result<bool, GatewayError> {
        let mut conn = self.conn().await?;
        let result: i64 = Script::new(CAS)
            .key(key)
            .arg(expected.unwrap_or(""))
            .arg(new_value)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| GatewayError::Store(format!("compare_and_set_json: {e}")))?;
        Ok(result == 1)
    }

    pub async fn ping(&self) -> bool {
        let Ok(mut conn) = self.conn().await else {
            return false;
        };
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok()
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, GatewayError> {
        self.pool
            .get()
            .await
            .map_err(|e| GatewayError::Store(format!("redis pool exhausted: {e}")))
    }
}
