//! Validation of externally issued signed tokens (JWT, shared HMAC secret).
//!
//! The signing algorithm is pinned to the HMAC family: a token whose header
//! names any other algorithm is rejected before signature verification, which
//! closes the classic algorithm-confusion hole where an attacker downgrades
//! to `none` or swaps in an asymmetric scheme.

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity claims carried by an externally signed token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaims {
    /// Defaulted so a token missing the claim still deserializes; absence is
    /// then rejected as [`JwtError::MissingSubject`] rather than a generic
    /// parse failure.
    #[serde(default)]
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    pub exp: i64,
}

/// Classified validation failures. All map to a 401 at the gateway.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JwtError {
    #[error("malformed token")]
    Malformed,
    #[error("unexpected signing algorithm")]
    AlgorithmMismatch,
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("token missing sub claim")]
    MissingSubject,
}

/// Verifies signed tokens against a shared secret.
pub struct JwtValidator {
    key: DecodingKey,
}

impl JwtValidator {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Validate a token string and return its claims.
    ///
    /// Rejects malformed tokens, non-HMAC algorithms, bad signatures, expired
    /// tokens, and tokens whose subject is missing or empty. Never consulted
    /// for pairing-issued opaque tokens.
    pub fn validate(&self, token: &str) -> Result<IdentityClaims, JwtError> {
        let header = decode_header(token).map_err(|_| JwtError::Malformed)?;
        let alg = match header.alg {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => header.alg,
            _ => return Err(JwtError::AlgorithmMismatch),
        };

        let mut validation = Validation::new(alg);
        validation.set_required_spec_claims(&["exp", "sub"]);

        let data =
            decode::<IdentityClaims>(token, &self.key, &validation).map_err(classify_error)?;
        if data.claims.sub.trim().is_empty() {
            return Err(JwtError::MissingSubject);
        }
        Ok(data.claims)
    }
}

fn classify_error(err: jsonwebtoken::errors::Error) -> JwtError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => JwtError::Expired,
        ErrorKind::InvalidSignature => JwtError::InvalidSignature,
        ErrorKind::MissingRequiredClaim(claim) if claim == "sub" => JwtError::MissingSubject,
        ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
            JwtError::AlgorithmMismatch
        }
        _ => JwtError::Malformed,
    }
}
