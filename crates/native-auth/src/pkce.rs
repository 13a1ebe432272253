//! Per-attempt CSRF state and PKCE (RFC 7636) material
//!
//! An [`AuthState`] is built once per interactive attempt and consumed when
//! the attempt resolves. It is deliberately not `Clone`: the verifier and
//! state string cannot leak into a second attempt.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use sha2::{Digest, Sha256};

/// Only challenge method this client emits.
pub const CHALLENGE_METHOD: &str = "S256";

/// Random bytes behind the CSRF state string (256 bits).
const STATE_BYTES: usize = 32;

/// Random bytes behind the code verifier. 64 bytes encode to 86 characters,
/// inside the 43-128 range RFC 7636 allows.
const VERIFIER_BYTES: usize = 64;

/// PKCE verifier and its derived challenge.
pub struct PkcePair {
    verifier: String,
    challenge: String,
}

impl PkcePair {
    pub fn generate() -> Self {
        let verifier = random_url_safe(VERIFIER_BYTES);
        let challenge = compute_challenge(&verifier);
        Self {
            verifier,
            challenge,
        }
    }

    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    pub fn challenge(&self) -> &str {
        &self.challenge
    }

    pub fn method(&self) -> &'static str {
        CHALLENGE_METHOD
    }
}

impl std::fmt::Debug for PkcePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkcePair")
            .field("verifier", &"[REDACTED]")
            .field("challenge", &self.challenge)
            .finish()
    }
}

/// State string and PKCE pair for one authorization attempt.
pub struct AuthState {
    state: Option<String>,
    pkce: Option<PkcePair>,
}

impl AuthState {
    /// Build fresh material for an attempt. Either part is omitted when its
    /// flag is off.
    pub fn new(use_state: bool, use_pkce: bool) -> Self {
        Self {
            state: use_state.then(|| random_url_safe(STATE_BYTES)),
            pkce: use_pkce.then(PkcePair::generate),
        }
    }

    pub fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }

    pub fn pkce(&self) -> Option<&PkcePair> {
        self.pkce.as_ref()
    }

    pub fn verifier(&self) -> Option<&str> {
        self.pkce.as_ref().map(PkcePair::verifier)
    }

    /// Query parameters this state contributes to the authorization URL.
    pub fn query_pairs(&self) -> Vec<(&'static str, &str)> {
        let mut pairs = Vec::with_capacity(3);
        if let Some(state) = &self.state {
            pairs.push(("state", state.as_str()));
        }
        if let Some(pkce) = &self.pkce {
            pairs.push(("code_challenge", pkce.challenge()));
            pairs.push(("code_challenge_method", pkce.method()));
        }
        pairs
    }
}

impl std::fmt::Debug for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthState")
            .field("state", &self.state.as_ref().map(|_| "[REDACTED]"))
            .field("pkce", &self.pkce)
            .finish()
    }
}

/// Compute the S256 code challenge from a verifier.
///
/// `challenge = BASE64URL(SHA256(verifier))`
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

fn random_url_safe(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill(&mut bytes[..]);
    URL_SAFE_NO_PAD.encode(bytes)
}
