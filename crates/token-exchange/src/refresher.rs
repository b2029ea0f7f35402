//! Two-step session token exchange
//!
//! 1. Association: POST `{uuid, challenge}` to the association endpoint,
//!    authenticated with the still-valid current token
//! 2. Poll: GET the poll endpoint with `uuid` and `verifier` until it hands
//!    out `accessToken`
//!
//! A non-success status from either endpoint fails the exchange immediately;
//! nothing is retried. The only repetition is polling a pending exchange that
//! answered 200 without a token yet, bounded by `max_polls`.

use std::time::Duration;

use reqwest::header::COOKIE;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::claims::{decode_unverified, is_long_lived};
use crate::constants::{DEFAULT_MAX_POLLS, DEFAULT_POLL_INTERVAL_MS, DEFAULT_VERIFIER_LENGTH};
use crate::error::{Error, Result};
use crate::pkce::PkceMaterial;

/// Endpoints and knobs for the exchange.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub associate_url: String,
    pub poll_url: String,
    /// When set, the current token is also sent as the cookie
    /// `<name>=<sub>%3A%3A<token>`, the form session-cookie backends expect.
    pub session_cookie: Option<String>,
    pub max_polls: u32,
    pub poll_interval: Duration,
    pub verifier_length: usize,
}

impl ExchangeConfig {
    /// Config for the given endpoints with default polling and verifier length.
    pub fn new(associate_url: impl Into<String>, poll_url: impl Into<String>) -> Self {
        Self {
            associate_url: associate_url.into(),
            poll_url: poll_url.into(),
            session_cookie: None,
            max_polls: DEFAULT_MAX_POLLS,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            verifier_length: DEFAULT_VERIFIER_LENGTH,
        }
    }
}

#[derive(Serialize)]
struct AssociateRequest<'a> {
    uuid: &'a str,
    challenge: &'a str,
}

/// Body returned by the poll endpoint.
#[derive(Debug, Deserialize, Serialize)]
pub struct PollResponse {
    #[serde(rename = "accessToken", default)]
    pub access_token: Option<String>,
}

/// Keeps session tokens usable.
///
/// Cheap to clone; the underlying `reqwest::Client` shares its connection pool.
#[derive(Debug, Clone)]
pub struct TokenRefresher {
    client: reqwest::Client,
    config: ExchangeConfig,
}

impl TokenRefresher {
    pub fn new(client: reqwest::Client, config: ExchangeConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    /// Whether `token` is a long-lived static credential (see `claims`).
    pub fn is_long_lived(&self, token: &str) -> bool {
        is_long_lived(token)
    }

    /// Return a usable token for `current`.
    ///
    /// Long-lived tokens come back unchanged without touching the network.
    /// Everything else goes through the association + poll exchange; the
    /// caller is responsible for persisting the result.
    pub async fn refresh(&self, current: &str) -> Result<String> {
        if self.is_long_lived(current) {
            debug!("token is long-lived, skipping exchange");
            return Ok(current.to_string());
        }

        let pkce = PkceMaterial::generate(self.config.verifier_length)?;
        info!(exchange_id = %pkce.identifier, "starting token exchange");

        self.associate(current, &pkce).await?;
        let token = self.poll(current, &pkce).await?;

        info!(exchange_id = %pkce.identifier, "token exchange succeeded");
        Ok(token)
    }

    /// Bind the challenge to the current token.
    async fn associate(&self, current: &str, pkce: &PkceMaterial) -> Result<()> {
        let response = self
            .authorize(self.client.post(&self.config.associate_url), current)
            .json(&AssociateRequest {
                uuid: &pkce.identifier,
                challenge: &pkce.challenge,
            })
            .send()
            .await
            .map_err(|e| Error::Http(format!("association request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            warn!(exchange_id = %pkce.identifier, %status, "association rejected");
            return Err(Error::TokenExchange(format!(
                "association endpoint returned {status}: {body}"
            )));
        }
        Ok(())
    }

    /// Collect the new token with the verifier.
    async fn poll(&self, current: &str, pkce: &PkceMaterial) -> Result<String> {
        let url = reqwest::Url::parse_with_params(
            &self.config.poll_url,
            &[
                ("uuid", pkce.identifier.as_str()),
                ("verifier", pkce.verifier.as_str()),
            ],
        )
        .map_err(|e| Error::TokenExchange(format!("invalid poll url: {e}")))?;

        for attempt in 1..=self.config.max_polls.max(1) {
            let response = self
                .authorize(self.client.get(url.clone()), current)
                .send()
                .await
                .map_err(|e| Error::Http(format!("poll request failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| String::from("<no body>"));
                warn!(exchange_id = %pkce.identifier, %status, "poll rejected");
                return Err(Error::TokenExchange(format!(
                    "poll endpoint returned {status}: {body}"
                )));
            }

            let body = response
                .json::<PollResponse>()
                .await
                .map_err(|e| Error::TokenExchange(format!("invalid poll response: {e}")))?;

            match body.access_token {
                Some(token) if !token.is_empty() => return Ok(token),
                _ => {
                    debug!(exchange_id = %pkce.identifier, attempt, "exchange pending");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }

        Err(Error::TokenExchange(format!(
            "no access token after {} polls",
            self.config.max_polls.max(1)
        )))
    }

    fn authorize(&self, request: reqwest::RequestBuilder, current: &str) -> reqwest::RequestBuilder {
        let request = request.bearer_auth(current);
        match &self.config.session_cookie {
            Some(name) => {
                let sub = decode_unverified(current)
                    .and_then(|c| c.sub)
                    .unwrap_or_default();
                request.header(COOKIE, format!("{name}={sub}%3A%3A{current}"))
            }
            None => request,
        }
    }
}
