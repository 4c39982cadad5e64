pub mod sliding_window;
pub mod token_bucket;

pub use sliding_window::{SlidingWindowCheck, SlidingWindowLimiter};
pub use token_bucket::{TokenBucketCheck, TokenBucketLimiter};

/// Identity a rate-limit check is keyed on: the authenticated principal's
/// subject if present, otherwise the client's network address.
pub fn identity_key(principal_subject: Option<&str>, client_addr: &str) -> String {
    match principal_subject {
        Some(sub) => format!("sub:{sub}"),
        None => format!("addr:{client_addr}"),
    }
}
