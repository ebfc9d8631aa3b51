//! Typed request identity, constructed once at the authorization boundary
//! and threaded explicitly through dispatch — no request-context stashing.

/// How a request was authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// Externally signed token verified against the shared secret.
    Jwt,
    /// Pairing-issued opaque token matched by credential hash.
    PairedToken,
    /// First-run convenience: pairing optional and no credentials exist yet.
    Bootstrap,
}

/// Identity attached to an authorized request.
#[derive(Debug, Clone)]
pub struct RequestIdentity {
    pub method: AuthMethod,
    /// Correlates conversational state across requests from the same caller
    /// without ever using the raw token as a key: `user:<sub>` for JWT
    /// callers, `api:<first 8 hex of token hash>` for opaque-token callers.
    pub session_key: String,
    /// Subject claim, present for JWT callers.
    pub subject: Option<String>,
    /// Raw signed token, forwarded to the agent processor for passthrough
    /// calls made on the caller's behalf. Never logged, never persisted as a
    /// key.
    pub jwt_token: Option<String>,
    /// Tenant scope requested in the body, filled in after parsing.
    pub business_id: Option<String>,
}
