//! Per-request authorization: picks the JWT path or the legacy opaque-token
//! path once, and produces a typed [`RequestIdentity`] for downstream use.

use crate::identity::{AuthMethod, RequestIdentity};
use crate::security::jwt::{JwtError, JwtValidator};
use crate::security::pairing::{hash_token, PairingGuard, TOKEN_PREFIX};
use axum::http::{header, HeaderMap};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Signed-token validation failed. Terminal — no fallback to the legacy
    /// path for non-`pc_` tokens.
    #[error("unauthorized: {0}")]
    TokenRejected(#[from] JwtError),
    #[error("unauthorized: invalid or missing bearer token")]
    InvalidBearerToken,
}

/// The credential strategy selected for a request.
enum Strategy {
    /// Non-`pc_` token presented while a JWT secret is configured.
    Signed(Arc<JwtValidator>, String),
    /// Everything else: pairing-issued token, empty header, or no JWT secret.
    Legacy(String),
}

/// Decides per-request trust from the `Authorization` header.
pub struct AuthResolver {
    pairing: Arc<PairingGuard>,
    jwt: Option<Arc<JwtValidator>>,
}

impl AuthResolver {
    pub fn new(pairing: Arc<PairingGuard>, jwt: Option<Arc<JwtValidator>>) -> Self {
        Self { pairing, jwt }
    }

    /// Authorize a request, resolving the credential strategy exactly once.
    pub fn authorize(&self, headers: &HeaderMap) -> Result<RequestIdentity, AuthError> {
        match self.select_strategy(headers) {
            Strategy::Signed(validator, token) => {
                let claims = validator.validate(&token)?;
                Ok(RequestIdentity {
                    method: AuthMethod::Jwt,
                    session_key: format!("user:{}", claims.sub),
                    subject: Some(claims.sub),
                    jwt_token: Some(token),
                    business_id: None,
                })
            }
            Strategy::Legacy(token) => {
                if self.pairing.has_credential(&token) {
                    return Ok(RequestIdentity {
                        method: AuthMethod::PairedToken,
                        session_key: legacy_session_key(&token),
                        subject: None,
                        jwt_token: None,
                        business_id: None,
                    });
                }
                // Bootstrap exception: before any credential has ever been
                // issued, and only while pairing is optional, requests are
                // implicitly authorized. Gone forever once one token exists.
                if !self.pairing.require_pairing() && !self.pairing.is_paired() {
                    return Ok(RequestIdentity {
                        method: AuthMethod::Bootstrap,
                        session_key: legacy_session_key(&token),
                        subject: None,
                        jwt_token: None,
                        business_id: None,
                    });
                }
                Err(AuthError::InvalidBearerToken)
            }
        }
    }

    fn select_strategy(&self, headers: &HeaderMap) -> Strategy {
        let token = bearer_token(headers);
        match &self.jwt {
            Some(validator) if !token.is_empty() && !token.starts_with(TOKEN_PREFIX) => {
                Strategy::Signed(validator.clone(), token)
            }
            _ => Strategy::Legacy(token),
        }
    }
}

/// Extract the raw bearer token from the `Authorization` header.
fn bearer_token(headers: &HeaderMap) -> String {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("")
        .to_string()
}

fn legacy_session_key(token: &str) -> String {
    format!("api:{}", &hash_token(token)[..8])
}
