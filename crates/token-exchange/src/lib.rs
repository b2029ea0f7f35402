//! Session token freshness and renewal
//!
//! Decides whether a session token needs renewal and performs the two-step
//! PKCE-style exchange when it does. The crate has no knowledge of the account
//! pool: callers hand in a token and persist whatever comes back.
//!
//! Renewal flow:
//! 1. `claims::is_long_lived()` inspects the token's `exp` claim locally
//! 2. Long-lived tokens are returned unchanged with no network call
//! 3. Otherwise `pkce::generate()` produces identifier, verifier and challenge
//! 4. `TokenRefresher` associates the challenge with the current token
//! 5. `TokenRefresher` polls with the verifier until a new token is issued

pub mod claims;
pub mod constants;
pub mod error;
pub mod pkce;
pub mod refresher;

pub use claims::{decode_unverified, is_long_lived, is_long_lived_at};
pub use constants::*;
pub use error::{Error, Result};
pub use pkce::{PkceMaterial, compute_challenge, generate_verifier};
pub use refresher::{ExchangeConfig, PollResponse, TokenRefresher};
