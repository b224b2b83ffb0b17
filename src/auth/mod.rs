//! Signed bearer tokens
//!
//! Tokens have the form `{user_id}.{expires_unix}.{hex_signature}` where the
//! signature is HMAC-SHA256 over `{user_id}.{expires_unix}`. The orchestrator
//! only ever sees the resulting [`Principal`].

use crate::context::UserId;
use chrono::Utc;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Authenticated caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
}

/// Auth errors
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing credentials")]
    MissingToken,

    #[error("Malformed token")]
    Malformed,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Token expired")]
    Expired,

    #[error("Signing key rejected")]
    InvalidKey,
}

/// Issues and verifies bearer tokens with a shared secret
pub struct TokenVerifier {
    secret: SecretString,
    ttl_secs: i64,
}

impl TokenVerifier {
    pub fn new(secret: SecretString, ttl_minutes: u64) -> Self {
        Self {
            secret,
            ttl_secs: i64::try_from(ttl_minutes.saturating_mul(60)).unwrap_or(i64::MAX),
        }
    }

    fn mac(&self, payload: &str) -> Result<HmacSha256, AuthError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|_| AuthError::InvalidKey)?;
        mac.update(payload.as_bytes());
        Ok(mac)
    }

    /// Token for `user_id` valid for the configured lifetime
    pub fn issue(&self, user_id: UserId) -> Result<String, AuthError> {
        self.issue_until(user_id, Utc::now().timestamp().saturating_add(self.ttl_secs))
    }

    fn issue_until(&self, user_id: UserId, expires: i64) -> Result<String, AuthError> {
        let payload = format!("{}.{}", user_id, expires);
        let signature = hex::encode(self.mac(&payload)?.finalize().into_bytes());
        Ok(format!("{}.{}", payload, signature))
    }

    pub fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let mut parts = token.trim().splitn(3, '.');
        let (Some(user), Some(expires), Some(signature)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::Malformed);
        };

        let user_id: UserId = user.parse().map_err(|_| AuthError::Malformed)?;
        let expires_at: i64 = expires.parse().map_err(|_| AuthError::Malformed)?;
        let signature = hex::decode(signature).map_err(|_| AuthError::Malformed)?;

        self.mac(&format!("{}.{}", user, expires))?
            .verify_slice(&signature)
            .map_err(|_| AuthError::InvalidSignature)?;

        if expires_at <= Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }

        Ok(Principal { user_id })
    }
}

/// Token from an `Authorization: Bearer ...` header value
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}
