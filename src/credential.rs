use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use josekit::jws::alg::hmac::{HmacJwsSigner, HmacJwsVerifier};
use josekit::jws::{JwsHeader, HS256};
use josekit::jwt::{self, JwtPayload};
use serde_json::Value;
use thiserror::Error;

use crate::errors::GateError;
use crate::settings::Keys;

/// Shortest HS256 secret accepted at startup.
pub const MIN_SECRET_LEN: usize = 32;

/// Principal derived from a verified credential. Lives for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject_id: String,
    pub role: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub verified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("no credential presented")]
    Missing,
    #[error("invalid credential: {0}")]
    Invalid(String),
    #[error("credential expired")]
    Expired,
}

#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// Verify a bearer credential. All or nothing: any defect rejects it.
    async fn verify(&self, token: Option<&str>) -> Result<Identity, VerificationError>;
}

/// Pull the bearer credential from `Authorization: Bearer …`, falling back to
/// the named cookie.
pub fn token_from_headers(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        let mut parts = value.trim().splitn(2, ' ');
        if let (Some(scheme), Some(token)) = (parts.next(), parts.next()) {
            let token = token.trim();
            if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    for cookie_header in headers.get_all(header::COOKIE) {
        let Ok(cookie_header) = cookie_header.to_str() else {
            continue;
        };
        for cookie in cookie_header.split(';') {
            if let Some(value) = cookie
                .trim()
                .strip_prefix(cookie_name)
                .and_then(|s| s.strip_prefix('='))
            {
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

/// HS256 JWT verifier over a shared secret.
///
/// Claims read: `userId` (or `sub`), `role`, `name`, `email`, `isVerified`.
/// `exp` is honoured when present, with `leeway` of tolerated clock skew.
pub struct Hs256Verifier {
    verifier: HmacJwsVerifier,
    signer: HmacJwsSigner,
    leeway: Duration,
}

impl Hs256Verifier {
    pub fn new(secret: &[u8], leeway: Duration) -> Result<Self, GateError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(GateError::Misconfigured(format!(
                "JWT secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        Ok(Self {
            verifier: HS256.verifier_from_bytes(secret)?,
            signer: HS256.signer_from_bytes(secret)?,
            leeway,
        })
    }

    pub fn from_keys(keys: &Keys) -> Result<Self, GateError> {
        let secret = keys
            .jwt_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                GateError::Misconfigured(
                    "keys.jwt_secret is not set (ROLEGATE__KEYS__JWT_SECRET)".into(),
                )
            })?;
        Self::new(secret.as_bytes(), Duration::from_secs(keys.leeway_secs))
    }

    /// Sign a credential for `identity`. Development and test helper; real
    /// credentials come from the login flow.
    pub fn issue(&self, identity: &Identity, ttl: Duration) -> Result<String, GateError> {
        let now = SystemTime::now();
        let mut payload = JwtPayload::new();
        payload.set_subject(&identity.subject_id);
        payload.set_claim("userId", Some(Value::String(identity.subject_id.clone())))?;
        payload.set_claim("role", Some(Value::String(identity.role.clone())))?;
        if let Some(name) = &identity.display_name {
            payload.set_claim("name", Some(Value::String(name.clone())))?;
        }
        if let Some(email) = &identity.email {
            payload.set_claim("email", Some(Value::String(email.clone())))?;
        }
        payload.set_claim("isVerified", Some(Value::Bool(identity.verified)))?;
        payload.set_issued_at(&now);
        payload.set_expires_at(&(now + ttl));

        let mut header = JwsHeader::new();
        header.set_token_type("JWT");
        Ok(jwt::encode_with_signer(&payload, &header, &self.signer)?)
    }

    // An `exp` beyond what `SystemTime` can represent never expires.
    fn is_expired(&self, payload: &JwtPayload) -> bool {
        let Some(exp) = payload.claim("exp").and_then(Value::as_u64) else {
            return false;
        };
        UNIX_EPOCH
            .checked_add(Duration::from_secs(exp))
            .and_then(|t| t.checked_add(self.leeway))
            .is_some_and(|deadline| deadline < SystemTime::now())
    }

    fn identity_from(payload: &JwtPayload) -> Result<Identity, VerificationError> {
        let string_claim = |name: &str| {
            payload
                .claim(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .filter(|s| !s.is_empty())
        };

        let subject_id = string_claim("userId")
            .or_else(|| payload.subject().map(str::to_string))
            .ok_or_else(|| VerificationError::Invalid("missing subject claim".into()))?;
        let role = string_claim("role")
            .ok_or_else(|| VerificationError::Invalid("missing role claim".into()))?;
        let verified = payload
            .claim("isVerified")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(Identity {
            subject_id,
            role,
            display_name: string_claim("name"),
            email: string_claim("email"),
            verified,
        })
    }
}

#[async_trait]
impl CredentialVerifier for Hs256Verifier {
    async fn verify(&self, token: Option<&str>) -> Result<Identity, VerificationError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(VerificationError::Missing)?;

        let (payload, _header) = jwt::decode_with_verifier(token, &self.verifier)
            .map_err(|e| VerificationError::Invalid(e.to_string()))?;

        if self.is_expired(&payload) {
            return Err(VerificationError::Expired);
        }

        Self::identity_from(&payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn identity() -> Identity {
        Identity {
            subject_id: "u-1".into(),
            role: "admin".into(),
            display_name: Some("Ada".into()),
            email: Some("ada@example.com".into()),
            verified: true,
        }
    }

    #[tokio::test]
    async fn test_issue_then_verify() {
        let v = Hs256Verifier::new(SECRET, Duration::ZERO).unwrap();
        let token = v.issue(&identity(), Duration::from_secs(60)).unwrap();
        assert_eq!(v.verify(Some(&token)).await.unwrap(), identity());
    }

    #[tokio::test]
    async fn test_missing_token() {
        let v = Hs256Verifier::new(SECRET, Duration::ZERO).unwrap();
        assert_eq!(v.verify(None).await, Err(VerificationError::Missing));
        assert_eq!(v.verify(Some("  ")).await, Err(VerificationError::Missing));
    }

    #[tokio::test]
    async fn test_wrong_secret_is_invalid() {
        let issuer = Hs256Verifier::new(b"ffffffffffffffffffffffffffffffff", Duration::ZERO).unwrap();
        let token = issuer.issue(&identity(), Duration::from_secs(60)).unwrap();

        let v = Hs256Verifier::new(SECRET, Duration::ZERO).unwrap();
        assert!(matches!(
            v.verify(Some(&token)).await,
            Err(VerificationError::Invalid(_))
        ));
        assert!(matches!(
            v.verify(Some("not-a-jwt")).await,
            Err(VerificationError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_token() {
        let v = Hs256Verifier::new(SECRET, Duration::ZERO).unwrap();
        let mut payload = JwtPayload::new();
        payload.set_claim("userId", Some(Value::String("u-1".into()))).unwrap();
        payload.set_claim("role", Some(Value::String("admin".into()))).unwrap();
        payload.set_expires_at(&(SystemTime::now() - Duration::from_secs(3600)));
        let token = jwt::encode_with_signer(&payload, &JwsHeader::new(), &v.signer).unwrap();

        assert_eq!(v.verify(Some(&token)).await, Err(VerificationError::Expired));

        // A generous leeway absorbs the same lapse
        let lenient = Hs256Verifier::new(SECRET, Duration::from_secs(7200)).unwrap();
        assert!(lenient.verify(Some(&token)).await.is_ok());
    }

    #[tokio::test]
    async fn test_far_future_expiry_and_huge_leeway() {
        let v = Hs256Verifier::new(SECRET, Duration::MAX).unwrap();
        let mut payload = JwtPayload::new();
        payload.set_claim("userId", Some(Value::String("u-1".into()))).unwrap();
        payload.set_claim("role", Some(Value::String("admin".into()))).unwrap();
        payload.set_claim("exp", Some(Value::from(u64::MAX))).unwrap();
        let far = jwt::encode_with_signer(&payload, &JwsHeader::new(), &v.signer).unwrap();
        assert_eq!(v.verify(Some(&far)).await.unwrap().role, "admin");

        // A normal token under a leeway too large to add to any instant
        let token = v.issue(&identity(), Duration::from_secs(60)).unwrap();
        assert!(v.verify(Some(&token)).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_role_claim_is_invalid() {
        let v = Hs256Verifier::new(SECRET, Duration::ZERO).unwrap();
        let mut payload = JwtPayload::new();
        payload.set_subject("u-2");
        let token = jwt::encode_with_signer(&payload, &JwsHeader::new(), &v.signer).unwrap();
        assert!(matches!(
            v.verify(Some(&token)).await,
            Err(VerificationError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_subject_fallback_and_unverified_default() {
        let v = Hs256Verifier::new(SECRET, Duration::ZERO).unwrap();
        let mut payload = JwtPayload::new();
        payload.set_subject("u-3");
        payload.set_claim("role", Some(Value::String("student".into()))).unwrap();
        let token = jwt::encode_with_signer(&payload, &JwsHeader::new(), &v.signer).unwrap();

        let id = v.verify(Some(&token)).await.unwrap();
        assert_eq!(id.subject_id, "u-3");
        assert!(!id.verified);
        assert!(id.email.is_none());
    }

    #[test]
    fn test_short_secret_rejected() {
        assert!(matches!(
            Hs256Verifier::new(b"123456789", Duration::ZERO),
            Err(GateError::Misconfigured(_))
        ));
        assert!(matches!(
            Hs256Verifier::from_keys(&Keys::default()),
            Err(GateError::Misconfigured(_))
        ));
    }

    #[test]
    fn test_token_from_bearer_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def.ghi"));
        headers.insert(header::COOKIE, HeaderValue::from_static("token=cookie-token"));
        assert_eq!(
            token_from_headers(&headers, "token").as_deref(),
            Some("abc.def.ghi")
        );
    }

    #[test]
    fn test_token_from_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; tokenish=x; token=abc.def.ghi"),
        );
        assert_eq!(
            token_from_headers(&headers, "token").as_deref(),
            Some("abc.def.ghi")
        );
        assert_eq!(token_from_headers(&HeaderMap::new(), "token"), None);
    }

    #[test]
    fn test_non_bearer_authorization_falls_through() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwdw=="));
        assert_eq!(token_from_headers(&headers, "token"), None);
    }
}
