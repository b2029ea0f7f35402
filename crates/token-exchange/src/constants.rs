//! Token exchange constants

/// Tokens whose `exp` lies further out than this are treated as static
/// credentials and never exchanged.
pub const LONG_LIVED_THRESHOLD_DAYS: i64 = 500;

/// RFC 7636 bounds on the code verifier length, in characters.
pub const MIN_VERIFIER_LENGTH: usize = 43;
pub const MAX_VERIFIER_LENGTH: usize = 128;

/// Verifier length used when the configuration does not say otherwise.
pub const DEFAULT_VERIFIER_LENGTH: usize = MIN_VERIFIER_LENGTH;

/// Poll attempts before giving up on a pending exchange.
pub const DEFAULT_MAX_POLLS: u32 = 5;

/// Delay between poll attempts that returned no token yet, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
