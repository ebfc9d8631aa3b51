// Gateway pairing — first-connect authentication.
//
// On startup the gateway generates a one-time 6-digit pairing code printed to
// the terminal. A client presents this code via the `X-Pairing-Code` header on
// a `POST /pair` request and receives a bearer token that must be sent on all
// subsequent requests via `Authorization: Bearer <token>`.
//
// Already-paired tokens are persisted (hashed) in config so restarts don't
// require re-pairing.

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use thiserror::Error;

/// Prefix identifying pairing-issued opaque tokens. Tokens carrying it are
/// always checked against the credential set, never the JWT validator.
pub const TOKEN_PREFIX: &str = "pc_";

/// Why a pairing exchange was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PairError {
    /// The current code was already exchanged (or invalidated) and a fresh
    /// one must be obtained from the operator console.
    #[error("pairing code already used")]
    CodeUsed,
    /// Submitted code does not match. The code stays live so the caller can
    /// retry with the correct one.
    #[error("invalid pairing code")]
    CodeMismatch,
}

#[derive(Debug)]
struct PairingCode {
    code: String,
    used: bool,
}

/// Manages pairing state for the gateway.
///
/// Bearer tokens are stored as SHA-256 hashes; the plaintext is returned to
/// the client exactly once at exchange time and is unrecoverable afterwards.
#[derive(Debug)]
pub struct PairingGuard {
    /// Whether pairing is mandatory for webhook access.
    require_pairing: bool,
    /// One-time pairing code plus its consumed flag. At most one unused code
    /// exists at any time.
    code: RwLock<PairingCode>,
    /// Set of SHA-256 hashed bearer tokens (persisted across restarts).
    tokens: RwLock<HashSet<String>>,
}

impl PairingGuard {
    /// Create a new pairing guard with a freshly generated code.
    ///
    /// Existing credentials are accepted in both forms:
    /// - Plaintext (`pc_...`): hashed on load for backward compatibility
    /// - Already hashed (64-char hex): stored as-is
    pub fn new(require_pairing: bool, existing_tokens: &[String]) -> Self {
        let tokens: HashSet<String> = existing_tokens
            .iter()
            .map(|t| {
                if is_token_hash(t) {
                    t.clone()
                } else {
                    hash_token(t)
                }
            })
            .collect();
        Self {
            require_pairing,
            code: RwLock::new(PairingCode {
                code: generate_code(),
                used: false,
            }),
            tokens: RwLock::new(tokens),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_code(require_pairing: bool, code: &str) -> Self {
        let guard = Self::new(require_pairing, &[]);
        *guard.code.write() = PairingCode {
            code: code.to_string(),
            used: false,
        };
        guard
    }

    /// The active pairing code, or `None` once it has been exchanged.
    pub fn current_code(&self) -> Option<String> {
        let code = self.code.read();
        if code.used {
            None
        } else {
            Some(code.code.clone())
        }
    }

    /// Whether pairing is mandatory for webhook access.
    pub fn require_pairing(&self) -> bool {
        self.require_pairing
    }

    /// Exchange the one-time code for a bearer token.
    ///
    /// Succeeds at most once per code: the code is marked used on success and
    /// left untouched on mismatch, so only a correct retry can consume it.
    pub fn try_pair(&self, submitted: &str) -> Result<String, PairError> {
        let mut code = self.code.write();
        if code.used {
            return Err(PairError::CodeUsed);
        }
        if !constant_time_eq(submitted.trim(), &code.code) {
            return Err(PairError::CodeMismatch);
        }

        let token = generate_token();
        self.tokens.write().insert(hash_token(&token));
        code.used = true;
        Ok(token)
    }

    /// Discard the current code and issue a fresh one, clearing the used flag.
    pub fn rotate_code(&self) -> String {
        let mut code = self.code.write();
        code.code = generate_code();
        code.used = false;
        code.code.clone()
    }

    /// Rotate only if the current code has been consumed. Returns the fresh
    /// code when rotation happened.
    pub fn reset_if_used(&self) -> Option<String> {
        let mut code = self.code.write();
        if !code.used {
            return None;
        }
        code.code = generate_code();
        code.used = false;
        Some(code.code.clone())
    }

    /// Check a presented token against the stored credential hashes.
    pub fn has_credential(&self, token: &str) -> bool {
        let hashed = hash_token(token);
        self.tokens.read().contains(&hashed)
    }

    /// True once at least one credential has been issued.
    pub fn is_paired(&self) -> bool {
        !self.tokens.read().is_empty()
    }

    /// All credential hashes (for persisting to config).
    pub fn token_hashes(&self) -> Vec<String> {
        self.tokens.read().iter().cloned().collect()
    }
}

/// Generate a 6-digit numeric pairing code from the OS CSPRNG.
///
/// Rejection sampling eliminates modulo bias: raw values above the largest
/// multiple of 1_000_000 that fits in u32 are discarded and re-drawn (~0.02%
/// rejection probability). If the entropy source itself fails, fall back to a
/// fixed code instead of panicking — a guessable code is recoverable by the
/// operator, a crashed gateway is not.
fn generate_code() -> String {
    use rand::TryRngCore;

    const UPPER_BOUND: u32 = 1_000_000;
    const REJECT_THRESHOLD: u32 = (u32::MAX / UPPER_BOUND) * UPPER_BOUND;

    let mut buf = [0u8; 4];
    loop {
        if rand::rngs::OsRng.try_fill_bytes(&mut buf).is_err() {
            return "000000".to_string();
        }
        let raw = u32::from_le_bytes(buf);
        if raw < REJECT_THRESHOLD {
            return format!("{:06}", raw % UPPER_BOUND);
        }
    }
}

/// Generate a bearer token with 256 bits of entropy, hex-encoded and prefixed
/// for identifiability.
fn generate_token() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    format!("{TOKEN_PREFIX}{}", hex::encode(bytes))
}

/// SHA-256 hash a bearer token for storage. Returns lowercase hex.
pub fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

/// Check if a stored value looks like a SHA-256 hash (64 hex chars) rather
/// than a plaintext token.
fn is_token_hash(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// Constant-time string comparison to prevent timing attacks.
///
/// Does not short-circuit on length mismatch — always iterates over the
/// longer input to avoid leaking length information via timing.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();

    let len_diff = a.len() ^ b.len();

    let max_len = a.len().max(b.len());
    let mut byte_diff = 0u8;
    for i in 0..max_len {
        let x = *a.get(i).unwrap_or(&0);
        let y = *b.get(i).unwrap_or(&0);
        byte_diff |= x ^ y;
    }
    (len_diff == 0) & (byte_diff == 0)
}
