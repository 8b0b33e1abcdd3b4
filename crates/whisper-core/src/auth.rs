//! Bearer token verification.
//!
//! Credentials are HS256 JSON Web Tokens issued by the external identity
//! service. Verification is self-contained: signature, algorithm and expiry are
//! checked against the shared secret, with no storage lookup.

use crate::identity::{Claims, Identity};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// The only accepted signing algorithm.
const ALGORITHM: &str = "HS256";

/// Why a presented token was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRejection {
    /// Not a well-formed token, or no identity claim.
    Malformed,
    /// Signed with something other than HS256.
    UnsupportedAlgorithm,
    /// Signature does not match the shared secret.
    BadSignature,
    /// Current time is at or past the expiry.
    Expired,
}

impl TokenRejection {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenRejection::Malformed => "malformed",
            TokenRejection::UnsupportedAlgorithm => "unsupported_algorithm",
            TokenRejection::BadSignature => "bad_signature",
            TokenRejection::Expired => "expired",
        }
    }
}

impl fmt::Display for TokenRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authentication errors raised while a connection is being established.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No credential was supplied.
    #[error("Authentication token is required")]
    MissingCredential,

    /// The credential could not be verified.
    #[error("Invalid or expired token")]
    InvalidOrExpired(TokenRejection),
}

impl AuthError {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::MissingCredential => "missing",
            AuthError::InvalidOrExpired(rejection) => rejection.as_str(),
        }
    }
}

/// Errors raised while signing a token.
#[derive(Debug, Error)]
pub enum IssueError {
    /// Claims could not be serialized.
    #[error("Failed to encode claims: {0}")]
    Encode(#[from] serde_json::Error),

    /// The signing key was rejected.
    #[error("Invalid signing key")]
    Key,
}

/// Verifies credentials presented at connection time.
///
/// This is the seam to the identity service: the relay never sees account
/// records, only the claims a verifier vouches for.
pub trait TokenVerifier: Send + Sync {
    /// Verify the raw `authorization` value and extract its claims.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MissingCredential`] if `credential` is absent or
    /// blank, and [`AuthError::InvalidOrExpired`] for any other failure.
    fn verify(&self, credential: Option<&str>) -> Result<Claims, AuthError>;
}

#[derive(Deserialize)]
struct Header {
    alg: String,
}

#[derive(Deserialize)]
struct RawClaims {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    sub: Option<serde_json::Value>,
    #[serde(default, rename = "firstName")]
    first_name: Option<String>,
    #[serde(default)]
    exp: Option<u64>,
}

#[derive(Serialize)]
struct OutHeader<'a> {
    alg: &'a str,
    typ: &'a str,
}

#[derive(Serialize)]
struct OutClaims<'a> {
    id: &'a str,
    #[serde(rename = "firstName", skip_serializing_if = "Option::is_none")]
    first_name: Option<&'a str>,
    iat: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    exp: Option<u64>,
}

/// HS256 JWT verifier bound to a shared secret.
#[derive(Clone)]
pub struct JwtVerifier {
    secret: Vec<u8>,
    leeway_secs: u64,
}

impl fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("secret", &"<redacted>")
            .field("leeway_secs", &self.leeway_secs)
            .finish()
    }
}

impl JwtVerifier {
    /// Create a verifier for the given shared secret.
    #[must_use]
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            leeway_secs: 0,
        }
    }

    /// Tolerate clock skew of up to `secs` past the expiry.
    #[must_use]
    pub fn with_leeway(mut self, secs: u64) -> Self {
        self.leeway_secs = secs;
        self
    }

    /// Verify a bare token against an explicit clock.
    ///
    /// # Errors
    ///
    /// Returns the reason the token was refused.
    pub fn verify_at(&self, token: &str, now: u64) -> Result<Claims, TokenRejection> {
        let (signing_input, signature) =
            token.rsplit_once('.').ok_or(TokenRejection::Malformed)?;
        let (header, payload) = signing_input
            .split_once('.')
            .ok_or(TokenRejection::Malformed)?;
        if payload.contains('.') {
            return Err(TokenRejection::Malformed);
        }

        let header: Header = decode_segment(header)?;
        if header.alg != ALGORITHM {
            return Err(TokenRejection::UnsupportedAlgorithm);
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature.trim_end_matches('='))
            .map_err(|_| TokenRejection::Malformed)?;
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| TokenRejection::BadSignature)?;
        mac.update(signing_input.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenRejection::BadSignature)?;

        let raw: RawClaims = decode_segment(payload)?;
        if let Some(exp) = raw.exp {
            if now >= exp.saturating_add(self.leeway_secs) {
                return Err(TokenRejection::Expired);
            }
        }

        let identity = raw
            .id
            .as_ref()
            .and_then(identity_from_claim)
            .or_else(|| raw.sub.as_ref().and_then(identity_from_claim))
            .ok_or(TokenRejection::Malformed)?;

        Ok(Claims {
            identity,
            display_name: raw.first_name,
            expires_at: raw.exp,
        })
    }

    /// Sign a token carrying `claims`.
    ///
    /// # Errors
    ///
    /// Returns an error if the claims cannot be encoded.
    pub fn issue(&self, claims: &Claims) -> Result<String, IssueError> {
        let header = serde_json::to_vec(&OutHeader {
            alg: ALGORITHM,
            typ: "JWT",
        })?;
        let payload = serde_json::to_vec(&OutClaims {
            id: claims.identity.as_str(),
            first_name: claims.display_name.as_deref(),
            iat: unix_now(),
            exp: claims.expires_at,
        })?;

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header),
            URL_SAFE_NO_PAD.encode(payload)
        );
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|_| IssueError::Key)?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{signing_input}.{signature}"))
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, credential: Option<&str>) -> Result<Claims, AuthError> {
        let token = credential
            .and_then(extract_token)
            .ok_or(AuthError::MissingCredential)?;

        self.verify_at(token, unix_now()).map_err(|rejection| {
            debug!(reason = %rejection, "Token rejected");
            AuthError::InvalidOrExpired(rejection)
        })
    }
}

/// Strip an optional `Bearer` scheme and surrounding whitespace.
fn extract_token(credential: &str) -> Option<&str> {
    let value = credential.trim();
    let token = match value.get(..6) {
        Some(scheme)
            if scheme.eq_ignore_ascii_case("bearer")
                && value[6..].chars().next().map_or(true, char::is_whitespace) =>
        {
            value[6..].trim_start()
        }
        _ => value,
    };
    (!token.is_empty()).then_some(token)
}

fn decode_segment<T: DeserializeOwned>(segment: &str) -> Result<T, TokenRejection> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|_| TokenRejection::Malformed)?;
    serde_json::from_slice(&bytes).map_err(|_| TokenRejection::Malformed)
}

fn identity_from_claim(value: &serde_json::Value) -> Option<Identity> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(Identity::new(s.clone())),
        serde_json::Value::Number(n) => Some(Identity::new(n.to_string())),
        _ => None,
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-secret";

    fn verifier() -> JwtVerifier {
        JwtVerifier::new(SECRET)
    }

    fn raw_token(header: &str, payload: &str, secret: &[u8]) -> String {
        let input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header),
            URL_SAFE_NO_PAD.encode(payload)
        );
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(input.as_bytes());
        format!(
            "{input}.{}",
            URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
        )
    }

    #[test]
    fn test_issue_then_verify() {
        let token = verifier()
            .issue(&Claims::new("alice").with_display_name("Alice"))
            .unwrap();

        let claims = verifier().verify(Some(token.as_str())).unwrap();
        assert_eq!(claims.identity, Identity::new("alice"));
        assert_eq!(claims.display_name.as_deref(), Some("Alice"));
        assert_eq!(claims.expires_at, None);
    }

    #[test]
    fn test_bearer_prefix_accepted() {
        let token = verifier().issue(&Claims::new("alice")).unwrap();
        let claims = verifier().verify(Some(format!("Bearer {token}").as_str())).unwrap();
        assert_eq!(claims.identity.as_str(), "alice");

        let claims = verifier().verify(Some(format!("bearer   {token}").as_str())).unwrap();
        assert_eq!(claims.identity.as_str(), "alice");
    }

    #[test]
    fn test_missing_credential() {
        assert_eq!(verifier().verify(None), Err(AuthError::MissingCredential));
        assert_eq!(verifier().verify(Some("")), Err(AuthError::MissingCredential));
        assert_eq!(verifier().verify(Some("   ")), Err(AuthError::MissingCredential));
        assert_eq!(
            verifier().verify(Some("Bearer ")),
            Err(AuthError::MissingCredential)
        );
    }

    #[test]
    fn test_expired_token() {
        let token = verifier()
            .issue(&Claims::new("alice").with_expiry(1_000))
            .unwrap();

        assert_eq!(
            verifier().verify(Some(token.as_str())),
            Err(AuthError::InvalidOrExpired(TokenRejection::Expired))
        );
        assert_eq!(
            verifier().verify_at(&token, 1_000),
            Err(TokenRejection::Expired)
        );
        assert!(verifier().verify_at(&token, 999).is_ok());
    }

    #[test]
    fn test_leeway_extends_expiry() {
        let token = verifier()
            .issue(&Claims::new("alice").with_expiry(1_000))
            .unwrap();

        let lenient = verifier().with_leeway(30);
        assert!(lenient.verify_at(&token, 1_029).is_ok());
        assert_eq!(lenient.verify_at(&token, 1_030), Err(TokenRejection::Expired));
    }

    #[test]
    fn test_wrong_secret() {
        let token = JwtVerifier::new("other").issue(&Claims::new("alice")).unwrap();
        assert_eq!(
            verifier().verify(Some(token.as_str())),
            Err(AuthError::InvalidOrExpired(TokenRejection::BadSignature))
        );
    }

    #[test]
    fn test_tampered_payload() {
        let token = verifier().issue(&Claims::new("alice")).unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(r#"{"id":"mallory"}"#);
        parts[1] = &forged;

        assert_eq!(
            verifier().verify_at(&parts.join("."), 0),
            Err(TokenRejection::BadSignature)
        );
    }

    #[test]
    fn test_malformed_tokens() {
        for token in ["garbage", "a.b", "a.b.c.d", "!!.??.##"] {
            assert_eq!(
                verifier().verify_at(token, 0),
                Err(TokenRejection::Malformed),
                "token {token:?}"
            );
        }
    }

    #[test]
    fn test_alg_none_refused() {
        let token = raw_token(r#"{"alg":"none"}"#, r#"{"id":"alice"}"#, SECRET);
        assert_eq!(
            verifier().verify_at(&token, 0),
            Err(TokenRejection::UnsupportedAlgorithm)
        );
    }

    #[test]
    fn test_numeric_id_and_sub_fallback() {
        let token = raw_token(r#"{"alg":"HS256"}"#, r#"{"id":42,"firstName":"Ada"}"#, SECRET);
        let claims = verifier().verify_at(&token, 0).unwrap();
        assert_eq!(claims.identity.as_str(), "42");
        assert_eq!(claims.display_name.as_deref(), Some("Ada"));

        let token = raw_token(r#"{"alg":"HS256"}"#, r#"{"sub":"bob"}"#, SECRET);
        assert_eq!(
            verifier().verify_at(&token, 0).unwrap().identity.as_str(),
            "bob"
        );
    }

    #[test]
    fn test_missing_identity_claim() {
        let token = raw_token(r#"{"alg":"HS256"}"#, r#"{"firstName":"Ada"}"#, SECRET);
        assert_eq!(
            verifier().verify_at(&token, 0),
            Err(TokenRejection::Malformed)
        );
    }

    #[test]
    fn test_debug_redacts_secret() {
        let rendered = format!("{:?}", verifier());
        assert!(!rendered.contains("test-secret"));
    }
}
