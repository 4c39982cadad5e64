use crate::error::AuthError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    scopes: Vec<String>,
    exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nbf: Option<u64>,
    iat: u64,
}

/// The authenticated identity attached to a request after token verification.
#[derive(Debug, Clone)]
pub struct Principal {
    pub subject: String,
    pub roles: HashSet<String>,
    pub scopes: HashSet<String>,
    pub expires_at: u64,
}

impl Principal {
    pub fn has_scopes(&self, required: &HashSet<String>) -> bool {
        required.is_subset(&self.scopes)
    }
}

/// Validates signed bearer tokens and mints new ones. Stateless — the only
/// secret is the HMAC signing key, shared by every gateway instance via
/// configuration.
pub struct TokenCodec {
    secret: Vec<u8>,
    ttl: Duration,
    clock_skew: Duration,
}

impl TokenCodec {
    pub fn new(secret: impl Into<Vec<u8>>, ttl: Duration, clock_skew: Duration) -> Self {
        Self {
            secret: secret.into(),
            ttl,
            clock_skew,
        }
    }

    /// Mints a signed token for `subject` carrying `roles`/`scopes`. Returns
    /// the token string and its expiry (epoch seconds), matching the
    /// `/api/auth/login` response contract.
    pub fn issue(&self, subject: &str, roles: &[String], scopes: &[String]) -> (String, u64) {
        let now = now_secs();
        let exp = now + self.ttl.as_secs();
        let header = Header {
            alg: "HS256".to_string(),
            typ: "JWT".to_string(),
        };
        let claims = Claims {
            sub: subject.to_string(),
            roles: roles.to_vec(),
            scopes: scopes.to_vec(),
            exp,
            nbf: None,
            iat: now,
        };
        let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).expect("header serializes"));
        let payload_b64 =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).expect("claims serialize"));
        let signature_b64 = self.sign(&header_b64, &payload_b64);
        (format!("{header_b64}.{payload_b64}.{signature_b64}"), exp)
    }

    /// Verifies a `header.payload.signature` bearer token per the five-step
    /// algorithm: parse, confirm alg, recompute signature, check exp/nbf,
    /// extract claims. Each step is fatal on mismatch.
    pub fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let mut parts = token.split('.');
        let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::Malformed);
        };

        let header_bytes = URL_SAFE_NO_PAD
            .decode(header_b64)
            .map_err(|_| AuthError::Malformed)?;
        let header: Header = serde_json::from_slice(&header_bytes).map_err(|_| AuthError::Malformed)?;
        if header.alg != "HS256" {
            return Err(AuthError::Malformed);
        }

        let expected_signature = self.sign(header_b64, payload_b64);
        if expected_signature.as_bytes().ct_eq(signature_b64.as_bytes()).unwrap_u8() != 1 {
            return Err(AuthError::InvalidSignature);
        }

        let payload_bytes = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| AuthError::Malformed)?;
        let claims: Claims =
            serde_json::from_slice(&payload_bytes).map_err(|_| AuthError::MissingClaim)?;

        let now = now_secs();
        let skew = self.clock_skew.as_secs();
        if claims.exp + skew <= now {
            return Err(AuthError::Expired);
        }
        if let Some(nbf) = claims.nbf {
            if nbf > now + skew {
                return Err(AuthError::NotYetValid);
            }
        }

        Ok(Principal {
            subject: claims.sub,
            roles: claims.roles.into_iter().collect(),
            scopes: claims.scopes.into_iter().collect(),
            expires_at: claims.exp,
        })
    }

    fn sign(&self, header_b64: &str, payload_b64: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length");
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(payload_b64.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> TokenCodec {
        TokenCodec::new(b"test-secret".to_vec(), Duration::from_secs(3600), Duration::from_secs(5))
    }

    #[test]
    fn round_trips_a_freshly_issued_token() {
        let codec = codec();
        let (token, _exp) = codec.issue("alice", &["admin".into()], &["read".into(), "write".into()]);
        let principal = codec.verify(&token).unwrap();
        assert_eq!(principal.subject, "alice");
        assert!(principal.roles.contains("admin"));
        assert!(principal.scopes.contains("read"));
    }

    #[test]
    fn rejects_a_flipped_signature_byte() {
        let codec = codec();
        let (token, _) = codec.issue("alice", &[], &[]);
        let mut parts: Vec<&str> = token.split('.').collect();
        let mut sig = parts[2].to_string();
        // Flip the first character deterministically.
        let first = sig.chars().next().unwrap();
        let replacement = if first == 'a' { 'b' } else { 'a' };
        sig.replace_range(0..1, &replacement.to_string());
        parts[2] = &sig;
        let tampered = parts.join(".");
        assert!(matches!(codec.verify(&tampered), Err(AuthError::InvalidSignature)));
    }

    #[test]
    fn rejects_a_tampered_payload() {
        let codec = codec();
        let (token, _) = codec.issue("alice", &[], &[]);
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged_claims = Claims {
            sub: "mallory".to_string(),
            roles: vec![],
            scopes: vec![],
            exp: now_secs() + 3600,
            nbf: None,
            iat: now_secs(),
        };
        let forged_payload =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged_claims).unwrap());
        parts[1] = &forged_payload;
        let tampered = parts.join(".");
        assert!(matches!(codec.verify(&tampered), Err(AuthError::InvalidSignature)));
    }

    #[test]
    fn rejects_expired_tokens() {
        let codec = TokenCodec::new(b"s".to_vec(), Duration::from_secs(0), Duration::from_secs(5));
        let (token, _) = codec.issue("alice", &[], &[]);
        std::thread::sleep(Duration::from_secs(6));
        assert!(matches!(codec.verify(&token), Err(AuthError::Expired)));
    }

    #[test]
    fn rejects_malformed_tokens() {
        let codec = codec();
        assert!(matches!(codec.verify("not-a-token"), Err(AuthError::Malformed)));
        assert!(matches!(codec.verify("a.b"), Err(AuthError::Malformed)));
    }

    #[test]
    fn scope_check_requires_every_required_scope() {
        let principal = Principal {
            subject: "alice".into(),
            roles: HashSet::new(),
            scopes: ["read".to_string(), "write".to_string()].into_iter().collect(),
            expires_at: now_secs() + 100,
        };
        let required: HashSet<String> = ["read".to_string()].into_iter().collect();
        assert!(principal.has_scopes(&required));

        let required_missing: HashSet<String> = ["admin".to_string()].into_iter().collect();
        assert!(!principal.has_scopes(&required_missing));
    }
}
