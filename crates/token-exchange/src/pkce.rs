//! PKCE material for the token exchange
//!
//! Each exchange gets a fresh correlation identifier, a random code verifier
//! and its S256 challenge. The challenge is sent while the current token is
//! still valid; the verifier is only revealed on the poll that collects the
//! new token, proving both requests came from the same party.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use sha2::{Digest, Sha256};

use crate::constants::{MAX_VERIFIER_LENGTH, MIN_VERIFIER_LENGTH};
use crate::error::{Error, Result};

/// Identifier, verifier and challenge for one exchange.
#[derive(Debug, Clone)]
pub struct PkceMaterial {
    /// Correlates the association request with the poll (UUID v4)
    pub identifier: String,
    pub verifier: String,
    pub challenge: String,
}

impl PkceMaterial {
    /// Generate fresh material with a verifier of `verifier_length` characters.
    pub fn generate(verifier_length: usize) -> Result<Self> {
        let verifier = generate_verifier(verifier_length)?;
        let challenge = compute_challenge(&verifier);
        Ok(Self {
            identifier: uuid::Uuid::new_v4().to_string(),
            verifier,
            challenge,
        })
    }
}

/// Generate a cryptographically random code verifier of exactly `length`
/// URL-safe base64 characters.
///
/// Some servers reject verifiers with a leading `-`, so the first character
/// is replaced when the encoding happens to start with one.
pub fn generate_verifier(length: usize) -> Result<String> {
    if !(MIN_VERIFIER_LENGTH..=MAX_VERIFIER_LENGTH).contains(&length) {
        return Err(Error::InvalidVerifierLength(length));
    }

    // Enough bytes that the encoding covers `length` characters
    let mut bytes = vec![0u8; (length * 3).div_ceil(4)];
    rand::rng().fill(&mut bytes[..]);

    let mut verifier = URL_SAFE_NO_PAD.encode(&bytes);
    verifier.truncate(length);
    if verifier.starts_with('-') {
        verifier.replace_range(..1, "A");
    }
    Ok(verifier)
}

/// Compute the S256 code challenge from a verifier.
///
/// `challenge = BASE64URL(SHA256(verifier))`
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}
