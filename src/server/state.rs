use crate::auth::{CredentialStore, TokenCodec};
use crate::circuit::CircuitBreakerRegistry;
use crate::config::{GatewayConfig, RoutesFile};
use crate::metrics::MetricsRegistry;
use crate::proxy::{self, ProxyClient};
use crate::ratelimit::{SlidingWindowLimiter, TokenBucketLimiter};
use crate::routing::{RouteTable, ServiceRoute};
use crate::store::SharedStore;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Shared gateway state, cheaply cloneable. Routes and configuration are
/// immutable after startup — there is no hot-reload path, so every field is
/// a plain `Arc` rather than a swappable pointer.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub store: Arc<SharedStore>,
    pub sliding_window: Arc<SlidingWindowLimiter>,
    pub token_bucket: Arc<TokenBucketLimiter>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub routes: Arc<RouteTable>,
    pub token_codec: Arc<TokenCodec>,
    pub credentials: Arc<CredentialStore>,
    pub metrics: Arc<MetricsRegistry>,
    pub http_client: ProxyClient,
}

impl GatewayState {
    pub async fn new(config: GatewayConfig, routes_file: RoutesFile) -> Result<Self> {
        let store = if config.store_url.is_empty() {
            info!("store: no store_url configured, using in-process memory store");
            SharedStore::memory()
        } else {
            SharedStore::connect_redis(&config.store_url).await?
        };
        let store = Arc::new(store);

        let routes: Vec<ServiceRoute> = routes_file
            .routes
            .into_iter()
            .map(|r| ServiceRoute {
                name: r.name,
                upstream_base_url: r.upstream_base_url,
                timeout: Duration::from_secs(r.timeout_secs),
                public: r.public,
                required_scopes: r.required_scopes,
            })
            .collect();

        let breakers = Arc::new(CircuitBreakerRegistry::new(store.clone()));
        for route in &routes {
            breakers.register_service(&route.name, config.circuit_breaker.clone());
            breakers.converge_with_store(&route.name).await;
        }
        info!("routing: loaded {} service route(s)", routes.len());

        Ok(Self {
            sliding_window: Arc::new(SlidingWindowLimiter::new(store.clone())),
            token_bucket: Arc::new(TokenBucketLimiter::new(store.clone())),
            breakers,
            routes: Arc::new(RouteTable::new(routes)),
            token_codec: Arc::new(TokenCodec::new(
                config.auth.secret.clone().into_bytes(),
                Duration::from_secs(config.auth.token_ttl_secs),
                Duration::from_secs(config.auth.clock_skew_secs),
            )),
            credentials: Arc::new(CredentialStore::new()),
            metrics: Arc::new(MetricsRegistry::install()),
            http_client: proxy::build_proxy_client(),
            store,
            config: Arc::new(config),
        })
    }
}
