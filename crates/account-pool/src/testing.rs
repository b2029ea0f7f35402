//! Shared fixtures for unit tests

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use jsonwebtoken::{EncodingKey, Header};
use serde::Serialize;
use token_exchange::ExchangeConfig;
use tokio::net::TcpListener;

use crate::account::NewAccount;
use crate::error::{Error, Result};
use crate::producer::{AccountProducer, ProducedAccount};
use crate::storage::BoxFuture;

/// Fixed, millisecond-aligned epoch for `ManualClock`.
pub(crate) fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

pub(crate) fn new_account(email: &str) -> NewAccount {
    NewAccount::new(email, format!("pw-{email}"))
}

#[derive(Serialize)]
struct TestClaims<'a> {
    sub: &'a str,
    exp: i64,
}

/// A JWT expiring `days` from now, signed with a key nobody verifies.
pub(crate) fn token_expiring_in(days: i64) -> String {
    let claims = TestClaims {
        sub: "auth0|user_01",
        exp: (Utc::now() + TimeDelta::days(days)).timestamp(),
    };
    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"test-key"),
    )
    .unwrap()
}

/// Producer double: numbered emails, canned login token, scripted failures.
#[derive(Default)]
pub(crate) struct StubProducer {
    pub created: AtomicUsize,
    pub logins: AtomicUsize,
    /// Remaining `create` calls that fail before one succeeds
    pub failing_creates: AtomicUsize,
    pub login_token: Option<String>,
    pub fail_login: bool,
}

impl StubProducer {
    pub(crate) fn with_login_token(token: &str) -> Self {
        Self {
            login_token: Some(token.to_string()),
            ..Self::default()
        }
    }
}

impl AccountProducer for StubProducer {
    fn create(&self) -> BoxFuture<'_, Result<ProducedAccount>> {
        Box::pin(async move {
            let failing = self
                .failing_creates
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(Error::Producer("registration rejected".into()));
            }
            let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(ProducedAccount {
                email: format!("user{n}@stub.test"),
                password: format!("pw{n}"),
                first_name: None,
                last_name: None,
                metadata: None,
                token: None,
            })
        })
    }

    fn login<'a>(
        &'a self,
        _email: &'a str,
        _password: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            self.logins.fetch_add(1, Ordering::SeqCst);
            if self.fail_login {
                return Err(Error::Producer("login rejected".into()));
            }
            Ok(self.login_token.clone())
        })
    }
}

/// Remote exchange stand-in that always issues `renewed-token`, or rejects
/// every association when `reject` is set. Returns the config and a counter
/// of association calls.
pub(crate) async fn start_exchange(reject: bool) -> (ExchangeConfig, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let app = Router::new()
        .route(
            "/associate",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if reject {
                        StatusCode::FORBIDDEN
                    } else {
                        StatusCode::OK
                    }
                }
            }),
        )
        .route(
            "/poll",
            get(|| async { axum::Json(serde_json::json!({"accessToken": "renewed-token"})) }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let mut config = ExchangeConfig::new(
        format!("http://{addr}/associate"),
        format!("http://{addr}/poll"),
    );
    config.poll_interval = Duration::from_millis(5);
    (config, calls)
}

/// Endpoints nothing listens on.
pub(crate) fn unreachable_exchange() -> ExchangeConfig {
    ExchangeConfig::new("http://127.0.0.1:9/associate", "http://127.0.0.1:9/poll")
}
