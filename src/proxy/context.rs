use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use std::net::IpAddr;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    full_body(Bytes::new())
}

/// Per-request bookkeeping threaded through the middleware chain. `route_name`
/// starts empty and is filled in once the route resolver matches a service,
/// so error responses produced before resolution carry no route label.
pub struct RequestContext {
    pub request_id: String,
    pub method: String,
    pub uri_path: String,
    pub client_ip: IpAddr,
    pub route_name: String,
    pub start: Instant,
    pub upstream_start: Option<Instant>,
}

impl RequestContext {
    pub fn new(request_id: String, method: String, uri_path: String, client_ip: IpAddr) -> Self {
        Self {
            request_id,
            method,
            uri_path,
            client_ip,
            route_name: String::new(),
            start: Instant::now(),
            upstream_start: None,
        }
    }

    pub fn error_response(&self, status: StatusCode, msg: &str) -> hyper::Response<BoxBody> {
        hyper::Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .header("x-request-id", self.request_id.clone())
            .body(full_body(format!(r#"{{"error":"{msg}"}}"#)))
            .expect("static response parts are valid")
    }
}
