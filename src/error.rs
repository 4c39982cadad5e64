use std::fmt;

/// Errors surfaced while verifying a bearer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    Malformed,
    InvalidSignature,
    Expired,
    NotYetValid,
    MissingClaim,
    Forbidden,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Malformed => write!(f, "malformed token"),
            AuthError::InvalidSignature => write!(f, "invalid signature"),
            AuthError::Expired => write!(f, "token expired"),
            AuthError::NotYetValid => write!(f, "token not yet valid"),
            AuthError::MissingClaim => write!(f, "missing required claim"),
            AuthError::Forbidden => write!(f, "insufficient scope"),
        }
    }
}

impl AuthError {
    pub fn status_code(&self) -> u16 {
        match self {
            AuthError::Forbidden => 403,
            _ => 401,
        }
    }
}

/// Top-level gateway error, covering every stage of the request pipeline.
#[derive(Debug)]
#[allow(dead_code)]
pub enum GatewayError {
    NoRouteMatch,
    RateLimited { retry_after_secs: u64 },
    CircuitOpen { service: String, retry_after_secs: u64 },
    Auth(AuthError),
    UpstreamTimeout,
    UpstreamUnreachable(String),
    Store(String),
    Config(String),
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::NoRouteMatch => write!(f, "no route matched"),
            GatewayError::RateLimited { .. } => write!(f, "rate limited"),
            GatewayError::CircuitOpen { service, .. } => {
                write!(f, "circuit open for service {service}")
            }
            GatewayError::Auth(e) => write!(f, "auth error: {e}"),
            GatewayError::UpstreamTimeout => write!(f, "upstream timeout"),
            GatewayError::UpstreamUnreachable(msg) => write!(f, "upstream unreachable: {msg}"),
            GatewayError::Store(msg) => write!(f, "shared store error: {msg}"),
            GatewayError::Config(msg) => write!(f, "config error: {msg}"),
            GatewayError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl GatewayError {
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::NoRouteMatch => 404,
            GatewayError::RateLimited { .. } => 429,
            GatewayError::CircuitOpen { .. } => 503,
            GatewayError::Auth(e) => e.status_code(),
            GatewayError::UpstreamTimeout => 504,
            GatewayError::UpstreamUnreachable(_) => 502,
            GatewayError::Store(_) => 500,
            GatewayError::Config(_) => 500,
            GatewayError::Internal(_) => 500,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            GatewayError::CircuitOpen { retry_after_secs, .. } => Some(*retry_after_secs),
            _ => None,
        }
    }
}
