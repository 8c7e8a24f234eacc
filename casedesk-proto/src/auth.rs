//! Authentication payloads and session-token claim decoding.
//!
//! Tokens are JWT-shaped (`header.payload.signature`). The client never
//! verifies signatures; it only reads the payload to learn who it is
//! logged in as and when a credential expires.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::UserId;
use crate::user::Role;

/// Body of `POST /auth/login/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    /// Account email.
    pub email: String,
    /// Account password.
    pub password: String,
}

/// Response of `POST /auth/login/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    /// Short-lived bearer credential.
    pub access: String,
    /// Long-lived credential used only against `/auth/refresh/`.
    pub refresh: String,
}

/// Body of `POST /auth/refresh/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshRequest {
    /// The stored refresh credential.
    pub refresh: String,
}

/// Response of `POST /auth/refresh/`.
///
/// Servers that rotate refresh credentials also return a new `refresh`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshResponse {
    /// The newly minted access credential.
    pub access: String,
    /// A rotated refresh credential, if the server issues one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<String>,
}

/// Which kind of credential a token is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    /// Bearer credential.
    Access,
    /// Refresh credential.
    Refresh,
}

/// Decoded token payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Authenticated user; string or number on the wire.
    pub user_id: UserId,
    /// Account role, when the issuer includes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    /// Expiry as seconds since the UNIX epoch.
    pub exp: i64,
    /// Credential kind, when the issuer includes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<TokenType>,
    /// Unique token id, when the issuer includes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

impl Claims {
    /// Whether the credential is expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.exp <= now.timestamp()
    }

    /// Whether the credential is expired now.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Errors decoding a token payload.
#[derive(Debug, thiserror::Error)]
pub enum ClaimsError {
    /// The token does not have three dot-separated segments.
    #[error("malformed token: expected three segments, found {0}")]
    Malformed(usize),

    /// The payload segment is not base64url.
    #[error("token payload is not base64url: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The payload is not the expected JSON object.
    #[error("token payload is not valid claims JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode the claims carried by a JWT-shaped token without verifying it.
///
/// # Errors
///
/// Returns [`ClaimsError`] if the token is not three segments, or the
/// payload is not base64url-encoded claims JSON.
pub fn decode_claims(token: &str) -> Result<Claims, ClaimsError> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(ClaimsError::Malformed(segments.len()));
    }
    let payload = URL_SAFE_NO_PAD.decode(segments[1].trim_end_matches('='))?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Encode claims as an unsigned JWT-shaped token (`alg: none`).
///
/// Used by the development server and tests; production tokens come from
/// the real backend.
///
/// # Errors
///
/// Returns [`serde_json::Error`] if the claims cannot be serialized.
pub fn encode_unsigned(claims: &Claims) -> Result<String, serde_json::Error> {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    Ok(format!("{header}.{payload}.unsigned"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(exp: i64) -> Claims {
        Claims {
            user_id: UserId::new(7),
            role: Some(Role::Admin),
            exp,
            token_type: Some(TokenType::Access),
            jti: None,
        }
    }

    #[test]
    fn encode_then_decode_preserves_claims() {
        let token = encode_unsigned(&claims(1_900_000_000)).unwrap();
        assert_eq!(decode_claims(&token).unwrap(), claims(1_900_000_000));
    }

    #[test]
    fn string_user_id_in_payload_is_normalized() {
        let payload = URL_SAFE_NO_PAD.encode(br#"{"user_id":"7","exp":10}"#);
        let token = format!("h.{payload}.s");
        let decoded = decode_claims(&token).unwrap();
        assert_eq!(decoded.user_id, UserId::new(7));
        assert_eq!(decoded.role, None);
    }

    #[test]
    fn opaque_token_is_malformed() {
        assert!(matches!(
            decode_claims("opaque-token"),
            Err(ClaimsError::Malformed(1))
        ));
    }

    #[test]
    fn expiry_is_inclusive() {
        let now = DateTime::from_timestamp(1_000, 0).unwrap();
        assert!(claims(1_000).is_expired_at(now));
        assert!(!claims(1_001).is_expired_at(now));
    }
}
