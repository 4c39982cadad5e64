pub mod credentials;
pub mod token;

pub use credentials::{CredentialRecord, CredentialStore, RegisterOutcome};
pub use token::{Principal, TokenCodec};

use crate::error::AuthError;
use std::collections::HashSet;

/// Verifies the `Authorization: Bearer <token>` header and checks the
/// resulting principal against a route's required scopes. Returns
/// `AuthError::Malformed` if the header is absent or not a bearer token —
/// the distilled "AuthMissing" kind is folded into `Malformed` since both
/// map to 401 and carry the same remediation (present a valid token).
pub fn authenticate(
    codec: &TokenCodec,
    authorization_header: Option<&str>,
    required_scopes: &HashSet<String>,
) -> Result<Principal, AuthError> {
    let token = authorization_header
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(AuthError::Malformed)?;
    let principal = codec.verify(token)?;
    if !principal.has_scopes(required_scopes) {
        return Err(AuthError::Forbidden);
    }
    Ok(principal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn missing_header_is_malformed() {
        let codec = TokenCodec::new(b"s".to_vec(), Duration::from_secs(60), Duration::from_secs(5));
        let result = authenticate(&codec, None, &HashSet::new());
        assert!(matches!(result, Err(AuthError::Malformed)));
    }

    #[test]
    fn valid_token_with_required_scope_succeeds() {
        let codec = TokenCodec::new(b"s".to_vec(), Duration::from_secs(60), Duration::from_secs(5));
        let (token, _) = codec.issue("alice", &[], &["read".to_string()]);
        let header = format!("Bearer {token}");
        let required: HashSet<String> = ["read".to_string()].into_iter().collect();
        let principal = authenticate(&codec, Some(&header), &required).unwrap();
        assert_eq!(principal.subject, "alice");
    }

    #[test]
    fn missing_scope_is_forbidden() {
        let codec = TokenCodec::new(b"s".to_vec(), Duration::from_secs(60), Duration::from_secs(5));
        let (token, _) = codec.issue("alice", &[], &[]);
        let header = format!("Bearer {token}");
        let required: HashSet<String> = ["admin".to_string()].into_iter().collect();
        let result = authenticate(&codec, Some(&header), &required);
        assert!(matches!(result, Err(AuthError::Forbidden)));
    }
}
