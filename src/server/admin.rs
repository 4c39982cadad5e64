use super::GatewayState;
use crate::proxy::BoxBody;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Lightweight surface served on the admin listener, separate from the main
/// proxy listener so health/metrics scraping keeps working even if the
/// proxy listener itself is saturated.
pub async fn handle_admin(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => Ok(Response::builder()
            .status(200)
            .header("content-type", "application/json")
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap()),

        "/health/detailed" | "/ready" | "/readyz" => {
            let store_up = state.store.ping().await;
            let circuits: Vec<serde_json::Value> = state
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
            let body = serde_json::json!({
                "status": "ok",
                "routes": state.routes.all().count(),
                "store": if store_up { "up" } else { "down" },
                "circuits": circuits,
            });
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body.to_string()))
                .unwrap())
        }

        "/metrics" => Ok(Response::builder()
            .status(200)
            .header("content-type", "application/json")
            .body(full_body(state.metrics.snapshot().to_string()))
            .unwrap()),

        "/metrics/prometheus" => Ok(Response::builder()
            .status(200)
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(full_body(state.metrics.render_prometheus()))
            .unwrap()),

        _ => Ok(Response::builder()
            .status(404)
            .header("content-type", "application/json")
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}
