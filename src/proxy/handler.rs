use super::context::{empty_body, full_body, BoxBody, RequestContext};
use crate::auth::{self, Principal, RegisterOutcome};
use crate::circuit::{BreakerCheck, CircuitBreakerRegistry};
use crate::error::{AuthError, GatewayError};
use crate::ratelimit::{identity_key, SlidingWindowCheck, TokenBucketCheck};
use crate::routing::ServiceRoute;
use crate::server::GatewayState;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, RETRY_AFTER};
use hyper::{Method, Request, Response, StatusCode};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

/// Shared outbound HTTP client used to forward requests to upstreams.
pub type ProxyClient = Client<HttpsConnector<HttpConnector>, BoxBody>;

/// Builds the single shared client used for every upstream call, regardless
/// of which route is being dispatched — this build has one upstream per
/// route, not a pool of clusters to balance across.
pub fn build_proxy_client() -> ProxyClient {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(std::time::Duration::from_secs(90)));
    http.set_connect_timeout(Some(std::time::Duration::from_secs(5)));
    http.enforce_http(false);

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .pool_max_idle_per_host(32)
        .build(https)
}

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

fn remove_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

fn inject_forwarded_headers(headers: &mut HeaderMap, client_ip: IpAddr, request_id: &str) {
    let ip = client_ip.to_string();
    let forwarded_for = HeaderName::from_static("x-forwarded-for");
    match headers
        .get(&forwarded_for)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    {
        Some(existing) => {
            if let Ok(v) = HeaderValue::from_str(&format!("{existing}, {ip}")) {
                headers.insert(forwarded_for, v);
            }
        }
        None => {
            if let Ok(v) = HeaderValue::from_str(&ip) {
                headers.insert(forwarded_for, v);
            }
        }
    }

    let forwarded_proto = HeaderName::from_static("x-forwarded-proto");
    if !headers.contains_key(&forwarded_proto) {
        headers.insert(forwarded_proto, HeaderValue::from_static("http"));
    }

    let request_id_header = HeaderName::from_static("x-request-id");
    if !headers.contains_key(&request_id_header) {
        if let Ok(v) = HeaderValue::from_str(request_id) {
            headers.insert(request_id_header, v);
        }
    }
}

fn generate_request_id() -> String {
    use rand::Rng;
    let bytes: [u8; 8] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn header_u64(n: u64) -> HeaderValue {
    let mut buf = itoa::Buffer::new();
    HeaderValue::from_str(buf.format(n)).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

fn json_ok(value: &serde_json::Value) -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(full_body(value.to_string()))
        .expect("static response parts are valid")
}

fn json_status(status: StatusCode, value: &serde_json::Value) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(value.to_string()))
        .expect("static response parts are valid")
}

/// Entry point for every connection on the main proxy listener. Assigns a
/// request id and timer, routes to the matching handler, and logs the
/// outcome once a response is ready.
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(generate_request_id);
    let method = req.method().as_str().to_string();
    let uri_path = req.uri().path().to_string();

    let mut ctx = RequestContext::new(request_id, method, uri_path, peer_addr.ip());
    let response = route_request(req, &state, &mut ctx).await;

    tracing::info!(
        request_id = %ctx.request_id,
        method = %ctx.method,
        path = %ctx.uri_path,
        route = %ctx.route_name,
        status = response.status().as_u16(),
        latency_ms = ctx.start.elapsed().as_millis() as u64,
        "access"
    );

    Ok(response)
}

async fn route_request(
    req: Request<Incoming>,
    state: &GatewayState,
    ctx: &mut RequestContext,
) -> Response<BoxBody> {
    let method = req.method().clone();
    let path = ctx.uri_path.clone();

    match (&method, path.as_str()) {
        (&Method::GET, "/health") => json_ok(&serde_json::json!({"status": "ok"})),
        (&Method::GET, "/health/detailed") => health_detailed(state).await,
        (&Method::GET, "/metrics") => json_ok(&state.metrics.snapshot()),
        (&Method::GET, "/metrics/prometheus") => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(full_body(state.metrics.render_prometheus()))
            .expect("static response parts are valid"),
        (&Method::POST, "/api/auth/login") => auth_login(req, state, ctx).await,
        (&Method::POST, "/api/auth/register") => auth_register(req, state, ctx).await,
        (&Method::GET, "/api/services") => {
            match authenticate_headers(req.headers(), state, &HashSet::new()) {
                Ok(_) => list_services(state),
                Err(e) => ctx.error_response(status_for_auth_error(&e), &e.to_string()),
            }
        }
        (&Method::GET, "/api/circuits") => {
            match authenticate_headers(req.headers(), state, &HashSet::new()) {
                Ok(_) => list_circuits(state),
                Err(e) => ctx.error_response(status_for_auth_error(&e), &e.to_string()),
            }
        }
        (&Method::POST, p) if p.starts_with("/api/circuits/") && p.ends_with("/reset") => {
            match authenticate_headers(req.headers(), state, &HashSet::new()) {
                Ok(_) => reset_circuit(state, p),
                Err(e) => ctx.error_response(status_for_auth_error(&e), &e.to_string()),
            }
        }
        _ if path.starts_with("/api/") => proxy_request(req, state, ctx).await,
        _ => ctx.error_response(StatusCode::NOT_FOUND, "not found"),
    }
}

fn status_for_auth_error(e: &AuthError) -> StatusCode {
    StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::UNAUTHORIZED)
}

fn authenticate_headers(
    headers: &HeaderMap,
    state: &GatewayState,
    required_scopes: &HashSet<String>,
) -> Result<Principal, AuthError> {
    let header = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    auth::authenticate(&state.token_codec, header, required_scopes)
}

async fn read_json_body<T: serde::de::DeserializeOwned>(
    req: Request<Incoming>,
) -> Result<T, Response<BoxBody>> {
    let bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|_| {
            json_status(
                StatusCode::BAD_REQUEST,
                &serde_json::json!({"error": "failed to read request body"}),
            )
        })?
        .to_bytes();
    serde_json::from_slice(&bytes).map_err(|_| {
        json_status(
            StatusCode::BAD_REQUEST,
            &serde_json::json!({"error": "malformed request body"}),
        )
    })
}

#[derive(serde::Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(serde::Deserialize)]
struct RegisterRequest {
    username: String,
    password: String,
}

async fn auth_login(
    req: Request<Incoming>,
    state: &GatewayState,
    ctx: &RequestContext,
) -> Response<BoxBody> {
    let body: LoginRequest = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    match state.credentials.authenticate(&body.username, &body.password) {
        Some(record) => {
            let (token, exp) = state
                .token_codec
                .issue(&record.username, &record.roles, &record.scopes);
            let expires_in = exp.saturating_sub(now_secs());
            json_ok(&serde_json::json!({
                "access_token": token,
                "token_type": "bearer",
                "expires_in": expires_in,
            }))
        }
        None => ctx.error_response(StatusCode::UNAUTHORIZED, "invalid username or password"),
    }
}

async fn auth_register(
    req: Request<Incoming>,
    state: &GatewayState,
    ctx: &RequestContext,
) -> Response<BoxBody> {
    let body: RegisterRequest = match read_json_body(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    match state.credentials.register(&body.username, &body.password) {
        RegisterOutcome::Created(_) => {
            json_status(StatusCode::CREATED, &serde_json::json!({"status": "created"}))
        }
        RegisterOutcome::AlreadyExists => {
            ctx.error_response(StatusCode::CONFLICT, "username already exists")
        }
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn list_services(state: &GatewayState) -> Response<BoxBody> {
    let services: Vec<_> = state
        .routes
        .all()
        .map(|r| {
            serde_json::json!({
                "name": r.name,
                "upstream_base_url": r.upstream_base_url,
                "public": r.public,
                "required_scopes": r.required_scopes,
                "timeout_secs": r.timeout.as_secs(),
            })
        })
        .collect();
    json_ok(&serde_json::json!({ "services": services }))
}

fn list_circuits(state: &GatewayState) -> Response<BoxBody> {
    let circuits: Vec<_> = state
        .breakers
        .snapshots()
        .into_iter()
        .filter_map(|c| serde_json::to_value(&c).ok())
        .collect();
    json_ok(&serde_json::json!({ "circuits": circuits }))
}

fn reset_circuit(state: &GatewayState, path: &str) -> Response<BoxBody> {
    let service = path
        .trim_start_matches("/api/circuits/")
        .trim_end_matches("/reset")
        .trim_end_matches('/');
    state.breakers.reset(service);
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(empty_body())
        .expect("static response parts are valid")
}

async fn health_detailed(state: &GatewayState) -> Response<BoxBody> {
    let store_up = state.store.ping().await;
    let circuits: Vec<_> = state
        .breakers
        .snapshots()
        .into_iter()
        .map(|c| {
            let available = !matches!(c.state, crate::circuit::CircuitState::Open);
            serde_json::json!({
                "service": c.service,
                "state": c.state,
                "available": available,
            })
        })
        .collect();
    json_ok(&serde_json::json!({
        "status": "ok",
        "circuits": circuits,
        "store": if store_up { "up" } else { "down" },
    }))
}

fn apply_rate_limit_headers(
    headers: &mut HeaderMap,
    sw: &SlidingWindowCheck,
    window_secs: u64,
    tb: Option<&TokenBucketCheck>,
) {
    headers.insert(
        HeaderName::from_static("x-ratelimit-limit"),
        header_u64(sw.limit),
    );
    headers.insert(
        HeaderName::from_static("x-ratelimit-remaining"),
        header_u64(sw.remaining),
    );
    headers.insert(
        HeaderName::from_static("x-ratelimit-window"),
        header_u64(window_secs),
    );
    if let Some(tb) = tb {
        if let Ok(v) = HeaderValue::from_str(&format!("{:.2}", tb.remaining)) {
            headers.insert(HeaderName::from_static("x-tokenbucket-remaining"), v);
        }
    }
}

/// Renders a `GatewayError` through its own `status_code`/`retry_after_secs`,
/// attaching `Retry-After` when the error carries one.
fn gateway_error_response(ctx: &RequestContext, err: GatewayError) -> Response<BoxBody> {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let retry_after = err.retry_after_secs();
    let mut resp = ctx.error_response(status, &err.to_string());
    if let Some(secs) = retry_after {
        resp.headers_mut().insert(RETRY_AFTER, header_u64(secs));
    }
    resp
}

/// The request fell through to the proxied `/api/<service>/<rest...>`
/// surface: resolve the route, run the middleware chain, and dispatch.
async fn proxy_request(
    req: Request<Incoming>,
    state: &GatewayState,
    ctx: &mut RequestContext,
) -> Response<BoxBody> {
    let Some((route, rest)) = state.routes.resolve(&ctx.uri_path) else {
        return gateway_error_response(ctx, GatewayError::NoRouteMatch);
    };
    let rest = rest.to_string();
    let route = route.clone();
    ctx.route_name = route.name.clone();

    let principal = if route.public {
        None
    } else {
        match authenticate_headers(req.headers(), state, &route.required_scopes) {
            Ok(p) => Some(p),
            Err(e) => return ctx.error_response(status_for_auth_error(&e), &e.to_string()),
        }
    };

    let identity = identity_key(
        principal.as_ref().map(|p| p.subject.as_str()),
        &ctx.client_ip.to_string(),
    );

    let rl = &state.config.rate_limit;
    let sw = match state.sliding_window.check(&identity, rl.requests, rl.window_secs).await {
        Ok(check) => check,
        Err(e) => {
            tracing::warn!("ratelimit: sliding-window store unreachable, failing open, error={e}");
            state.metrics.record_store_fail_open("sliding_window");
            SlidingWindowCheck {
                allowed: true,
                limit: rl.requests,
                remaining: rl.requests,
                reset_in_secs: rl.window_secs,
            }
        }
    };

    if !sw.allowed {
        state.metrics.record_rate_limited(&route.name);
        let mut resp = gateway_error_response(
            ctx,
            GatewayError::RateLimited {
                retry_after_secs: sw.reset_in_secs,
            },
        );
        apply_rate_limit_headers(resp.headers_mut(), &sw, rl.window_secs, None);
        state
            .metrics
            .record_request(&route.name, resp.status().as_u16(), ctx.start.elapsed());
        return resp;
    }

    let tb = match state
        .token_bucket
        .consume(&identity, rl.token_bucket_capacity, rl.token_bucket_refill_rate, 1.0)
        .await
    {
        Ok(check) => check,
        Err(e) => {
            tracing::warn!("ratelimit: token-bucket store unreachable, failing open, error={e}");
            state.metrics.record_store_fail_open("token_bucket");
            TokenBucketCheck {
                allowed: true,
                remaining: rl.token_bucket_capacity,
            }
        }
    };

    if !tb.allowed {
        state.metrics.record_rate_limited(&route.name);
        let retry = (1.0 / rl.token_bucket_refill_rate.max(0.0001)).ceil().max(1.0) as u64;
        let mut resp = gateway_error_response(
            ctx,
            GatewayError::RateLimited {
                retry_after_secs: retry,
            },
        );
        apply_rate_limit_headers(resp.headers_mut(), &sw, rl.window_secs, Some(&tb));
        state
            .metrics
            .record_request(&route.name, resp.status().as_u16(), ctx.start.elapsed());
        return resp;
    }

    let probe_guard = match state.breakers.check(&route.name) {
        BreakerCheck::Rejected { retry_after_secs } => {
            state.metrics.record_circuit_rejected(&route.name);
            let mut resp = gateway_error_response(
                ctx,
                GatewayError::CircuitOpen {
                    service: route.name.clone(),
                    retry_after_secs,
                },
            );
            apply_rate_limit_headers(resp.headers_mut(), &sw, rl.window_secs, Some(&tb));
            state
                .metrics
                .record_request(&route.name, resp.status().as_u16(), ctx.start.elapsed());
            return resp;
        }
        BreakerCheck::Allowed => None,
        BreakerCheck::Probe => Some(ProbeGuard::new(state.breakers.clone(), route.name.clone())),
    };

    let mut response = match dispatch(req, state, &route, &rest, ctx).await {
        DispatchOutcome::Response(status, resp) => {
            if let Some(mut guard) = probe_guard {
                guard.disarm();
            }
            if status >= 500 {
                state.breakers.record_failure(&route.name);
            } else {
                state.breakers.record_success(&route.name);
            }
            resp
        }
        DispatchOutcome::Timeout => {
            if let Some(mut guard) = probe_guard {
                guard.disarm();
            }
            state.breakers.record_failure(&route.name);
            gateway_error_response(ctx, GatewayError::UpstreamTimeout)
        }
        DispatchOutcome::Unreachable(msg) => {
            if let Some(mut guard) = probe_guard {
                guard.disarm();
            }
            state.breakers.record_failure(&route.name);
            gateway_error_response(ctx, GatewayError::UpstreamUnreachable(msg))
        }
    };

    apply_rate_limit_headers(response.headers_mut(), &sw, rl.window_secs, Some(&tb));
    state
        .metrics
        .record_request(&route.name, response.status().as_u16(), ctx.start.elapsed());
    response
}

/// Holds a half-open probe slot for the duration of an upstream call. If the
/// enclosing future is dropped before `disarm` runs — a client disconnect
/// aborting `dispatch(...).await` mid-poll — `Drop` releases the slot so the
/// breaker doesn't wedge in Half-Open forever.
struct ProbeGuard {
    breakers: Arc<CircuitBreakerRegistry>,
    service: String,
    disarmed: bool,
}

impl ProbeGuard {
    fn new(breakers: Arc<CircuitBreakerRegistry>, service: String) -> Self {
        Self {
            breakers,
            service,
            disarmed: false,
        }
    }

    /// Call once the probe's outcome has already been recorded via
    /// `record_success`/`record_failure`, so `Drop` becomes a no-op.
    fn disarm(&mut self) {
        self.disarmed = true;
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        if !self.disarmed {
            self.breakers.release_probe(&self.service);
        }
    }
}

enum DispatchOutcome {
    Response(u16, Response<BoxBody>),
    Timeout,
    Unreachable(String),
}

async fn dispatch(
    req: Request<Incoming>,
    state: &GatewayState,
    route: &ServiceRoute,
    rest: &str,
    ctx: &mut RequestContext,
) -> DispatchOutcome {
    let (parts, body) = req.into_parts();
    let query = parts.uri.query().map(|q| format!("?{q}")).unwrap_or_default();
    let upstream_uri = format!(
        "{}/{}{}",
        route.upstream_base_url.trim_end_matches('/'),
        rest,
        query
    );

    let mut headers = parts.headers;
    remove_hop_headers(&mut headers);
    inject_forwarded_headers(&mut headers, ctx.client_ip, &ctx.request_id);

    let mut builder = Request::builder().method(parts.method.clone()).uri(&upstream_uri);
    if let Some(h) = builder.headers_mut() {
        *h = headers;
    }
    let upstream_req = match builder.body(body.boxed()) {
        Ok(r) => r,
        Err(e) => return DispatchOutcome::Unreachable(e.to_string()),
    };

    ctx.upstream_start = Some(Instant::now());
    let result = tokio::time::timeout(route.timeout, state.http_client.request(upstream_req)).await;

    match result {
        Ok(Ok(resp)) => {
            let status = resp.status().as_u16();
            let (mut parts, body) = resp.into_parts();
            remove_hop_headers(&mut parts.headers);
            let response = Response::from_parts(parts, body.boxed());
            DispatchOutcome::Response(status, response)
        }
        Ok(Err(e)) => {
            tracing::warn!("proxy: upstream unreachable, service={}, error={}", route.name, e);
            DispatchOutcome::Unreachable(e.to_string())
        }
        Err(_) => {
            tracing::warn!(
                "proxy: upstream timeout, service={}, timeout={:?}",
                route.name,
                route.timeout
            );
            DispatchOutcome::Timeout
        }
    }
}
