//! Bearer-token authentication for WebSocket upgrades.
//!
//! Tokens are HS256-signed JWTs. The signature and `exp` are always checked;
//! `iss` and `aud` only when configured.

use std::time::Duration;

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use chrono::{DateTime, Utc};
use jobbridge_settings::AuthSettings;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

/// JWT claims accepted by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (the client's identity).
    pub sub: String,
    /// Expiration (UTC Unix timestamp).
    pub exp: i64,
    /// Issued-at (UTC Unix timestamp).
    #[serde(default)]
    pub iat: i64,
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Audience.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

/// Authenticated identity bound to a connection for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Token subject.
    pub subject: String,
    /// Token expiry.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Identity {
    /// An identity for tests and tooling that bypass token validation.
    pub fn anonymous(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            expires_at: None,
        }
    }
}

/// Why a credential was rejected. The display string becomes the close
/// reason sent to the client.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No credential presented.
    #[error("missing credential")]
    Missing,
    /// Credential expired.
    #[error("credential expired")]
    Expired,
    /// Credential malformed or signature/claims invalid.
    #[error("invalid credential")]
    Invalid(#[source] jsonwebtoken::errors::Error),
    /// No credential within the handshake timeout.
    #[error("authentication timed out")]
    Timeout,
    /// Token could not be signed.
    #[error("failed to sign token: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),
}

/// Validates bearer tokens.
pub struct TokenValidator {
    key: DecodingKey,
    validation: Validation,
}

impl TokenValidator {
    /// Create a validator for an HS256 secret.
    pub fn new(
        secret: &str,
        issuer: Option<&str>,
        audience: Option<&str>,
        leeway: Duration,
    ) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway.as_secs();
        if let Some(iss) = issuer {
            validation.set_issuer(&[iss]);
        }
        match audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Create a validator from the `auth` settings.
    pub fn from_settings(settings: &AuthSettings) -> Self {
        Self::new(
            &settings.jwt_secret,
            settings.issuer.as_deref(),
            settings.audience.as_deref(),
            Duration::from_secs(settings.leeway_secs),
        )
    }

    /// Validate a token and return the identity it carries.
    pub fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            if matches!(e.kind(), ErrorKind::ExpiredSignature) {
                AuthError::Expired
            } else {
                AuthError::Invalid(e)
            }
        })?;
        Ok(Identity {
            expires_at: DateTime::from_timestamp(data.claims.exp, 0),
            subject: data.claims.sub,
        })
    }
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator").finish_non_exhaustive()
    }
}

/// Mint an HS256 token (development tooling and tests).
pub fn issue_token(
    settings: &AuthSettings,
    subject: &str,
    ttl: Duration,
) -> Result<String, AuthError> {
    let now = Utc::now().timestamp();
    let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
    let claims = Claims {
        sub: subject.to_owned(),
        exp: now.saturating_add(ttl_secs),
        iat: now,
        iss: settings.issuer.clone(),
        aud: settings.audience.clone(),
    };
    encode(
        &Header::default(), // HS256
        &claims,
        &EncodingKey::from_secret(settings.jwt_secret.as_bytes()),
    )
    .map_err(AuthError::Signing)
}

/// Extract a bearer token from the `Authorization` header.
pub fn bearer_from_headers(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    (scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty()).then(|| token.trim())
}
