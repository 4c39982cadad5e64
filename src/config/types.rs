use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;

/// Deserialize a `T` that implements `Default` — treats JSON/TOML `null` the
/// same as a missing field (returns `T::default()`). Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
#[allow(dead_code)]
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One entry of the routes file: a service name, its upstream, and the
/// auth/timeout policy applied to requests under `/api/<name>/...`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub name: String,
    pub upstream_base_url: String,
    #[serde(default = "default_route_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub required_scopes: HashSet<String>,
}

fn default_route_timeout_secs() -> u64 {
    5
}

/// Static route table file, loaded once at startup (TOML or JSON).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutesFile {
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests: u64,
    pub window_secs: u64,
    pub token_bucket_capacity: f64,
    pub token_bucket_refill_rate: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests: 100,
            window_secs: 60,
            token_bucket_capacity: 50.0,
            token_bucket_refill_rate: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_duration_secs: u64,
    pub half_open_probe_budget: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration_secs: 30,
            half_open_probe_budget: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Token signing secret. Required — no default. Startup fails if unset.
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    /// Clock-skew tolerance applied to `exp`/`nbf` checks when verifying a
    /// token, to absorb drift between the issuing and verifying instances.
    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_secs: u64,
}

fn default_token_ttl_secs() -> u64 {
    3600
}

fn default_clock_skew_secs() -> u64 {
    5
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            token_ttl_secs: default_token_ttl_secs(),
            clock_skew_secs: default_clock_skew_secs(),
        }
    }
}

/// Infrastructure settings: listeners, the shared store, graceful shutdown,
/// logging. Mirrors the env-override pattern used for connection settings
/// elsewhere in this codebase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_proxy_bind")]
    pub proxy_bind: String,

    #[serde(default = "default_admin_bind")]
    pub admin_bind: String,

    /// Shared-store connection URL. Empty means "no store configured" and
    /// the in-process `MemoryStore` is used instead — convenient for local
    /// development, but it does not provide cross-instance convergence.
    #[serde(default)]
    pub store_url: String,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Path to the routes file (TOML/JSON); defaults to "routes.toml" in
    /// the working directory.
    #[serde(default = "default_routes_path")]
    pub routes_path: String,

    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

fn default_proxy_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_admin_bind() -> String {
    "0.0.0.0:8081".to_string()
}

fn default_routes_path() -> String {
    "routes.toml".to_string()
}

fn default_drain_timeout_secs() -> u64 {
    30
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            proxy_bind: default_proxy_bind(),
            admin_bind: default_admin_bind(),
            store_url: String::new(),
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            routes_path: default_routes_path(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_config_defaults_are_sane() {
        let json = r#"{"name": "users", "upstream_base_url": "http://users.internal"}"#;
        let route: RouteConfig = serde_json::from_str(json).unwrap();
        assert_eq!(route.timeout_secs, 5);
        assert!(!route.public);
        assert!(route.required_scopes.is_empty());
    }

    #[test]
    fn routes_file_parses_toml() {
        let toml = r#"
            [[routes]]
            name = "users"
            upstream_base_url = "http://users.internal"
            public = true

            [[routes]]
            name = "orders"
            upstream_base_url = "http://orders.internal"
            required_scopes = ["orders:read"]
        "#;
        let file: RoutesFile = toml::from_str(toml).unwrap();
        assert_eq!(file.routes.len(), 2);
        assert!(file.routes[0].public);
        assert!(file.routes[1].required_scopes.contains("orders:read"));
    }

    #[test]
    fn gateway_config_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.rate_limit.requests, 100);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.half_open_probe_budget, 1);
    }
}
