//! Local, unverified inspection of session token claims
//!
//! The signature is NOT checked here. Claims are read only to estimate how
//! long a token will live and to recover the subject for the session cookie;
//! nothing in this module is an authorization decision.

use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::debug;

use crate::constants::LONG_LIVED_THRESHOLD_DAYS;

/// The subset of JWT claims the exchange cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    /// Expiry as unix seconds
    pub exp: i64,
    #[serde(default)]
    pub sub: Option<String>,
}

/// Decode a token's claims without verifying its signature or expiry.
///
/// Returns `None` for anything that is not a JWT carrying an `exp` claim.
pub fn decode_unverified(token: &str) -> Option<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;

    match jsonwebtoken::decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation) {
        Ok(data) => Some(data.claims),
        Err(e) => {
            debug!(error = %e, "token claims not decodable");
            None
        }
    }
}

/// Whether the token's declared expiry is more than 500 days from now.
pub fn is_long_lived(token: &str) -> bool {
    is_long_lived_at(token, Utc::now())
}

/// [`is_long_lived`] evaluated against an explicit `now`.
pub fn is_long_lived_at(token: &str, now: DateTime<Utc>) -> bool {
    let Some(claims) = decode_unverified(token) else {
        return false;
    };
    let horizon = now + TimeDelta::days(LONG_LIVED_THRESHOLD_DAYS);
    claims.exp > horizon.timestamp()
}
