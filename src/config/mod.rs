pub mod types;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used — allowing the gateway to start with zero configuration for
    /// local development (falling back to the in-memory store).
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, using defaults",
                path.display()
            );
            GatewayConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!("loaded gateway configuration");
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("GATEWAY_PROXY_BIND") {
            self.proxy_bind = v;
        }
        if let Ok(v) = std::env::var("GATEWAY_ADMIN_BIND") {
            self.admin_bind = v;
        }
        if let Ok(v) = std::env::var("GATEWAY_STORE_URL") {
            self.store_url = v;
        }
        if let Ok(v) = std::env::var("GATEWAY_AUTH_SECRET") {
            self.auth.secret = v;
        }
        if let Ok(v) = std::env::var("GATEWAY_ROUTES_PATH") {
            self.routes_path = v;
        }
        if let Ok(v) = std::env::var("GATEWAY_AUTH_CLOCK_SKEW_SECONDS") {
            if let Ok(n) = v.parse() {
                self.auth.clock_skew_secs = n;
            }
        }
        if let Ok(v) = std::env::var("RATE_LIMIT_REQUESTS") {
            if let Ok(n) = v.parse() {
                self.rate_limit.requests = n;
            }
        }
        if let Ok(v) = std::env::var("RATE_LIMIT_WINDOW_SECONDS") {
            if let Ok(n) = v.parse() {
                self.rate_limit.window_secs = n;
            }
        }
        if let Ok(v) = std::env::var("TOKEN_BUCKET_CAPACITY") {
            if let Ok(n) = v.parse() {
                self.rate_limit.token_bucket_capacity = n;
            }
        }
        if let Ok(v) = std::env::var("TOKEN_BUCKET_REFILL_RATE") {
            if let Ok(n) = v.parse() {
                self.rate_limit.token_bucket_refill_rate = n;
            }
        }
        if let Ok(v) = std::env::var("CIRCUIT_FAILURE_THRESHOLD") {
            if let Ok(n) = v.parse() {
                self.circuit_breaker.failure_threshold = n;
            }
        }
        if let Ok(v) = std::env::var("CIRCUIT_RECOVERY_TIMEOUT") {
            if let Ok(n) = v.parse() {
                self.circuit_breaker.open_duration_secs = n;
            }
        }
        if let Ok(v) = std::env::var("CIRCUIT_SUCCESS_THRESHOLD") {
            if let Ok(n) = v.parse() {
                self.circuit_breaker.success_threshold = n;
            }
        }
        if let Ok(v) = std::env::var("CIRCUIT_HALF_OPEN_PROBE_BUDGET") {
            if let Ok(n) = v.parse() {
                self.circuit_breaker.half_open_probe_budget = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.auth.secret.is_empty() {
            anyhow::bail!("GATEWAY_AUTH_SECRET must be set — no default signing secret");
        }
        if self.rate_limit.window_secs == 0 {
            anyhow::bail!("RATE_LIMIT_WINDOW_SECONDS must be greater than zero");
        }
        Ok(())
    }
}

/// Loads the static route table from `path` (TOML or JSON), matching the
/// format used by `GatewayConfig::load`.
pub fn load_routes_file(path: &Path) -> Result<RoutesFile> {
    if !path.exists() {
        tracing::warn!("routes file not found at {}, starting with no routes", path.display());
        return Ok(RoutesFile::default());
    }
    let content = std::fs::read_to_string(path)?;
    let file = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&content)?,
        Some("json") => serde_json::from_str(&content)?,
        Some(ext) => anyhow::bail!("unsupported routes format: .{ext}, use .toml or .json"),
        None => anyhow::bail!("routes file has no extension, use .toml or .json"),
    };
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_requires_a_signing_secret() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_passes_with_a_secret() {
        let mut config = GatewayConfig::default();
        config.auth.secret = "s3cr3t".to_string();
        assert!(config.validate().is_ok());
    }
}
