//! Admin HTTP API
//!
//! A thin pass-through to the allocation engine and scheduler.
//!
//! Endpoints:
//! - GET  /api/account                      : allocate the oldest available account
//! - POST /api/accounts/{id}/allocate       : force-allocate a specific account
//! - GET  /api/accounts                     : list accounts (no passwords or tokens)
//! - GET  /api/stats                        : counts by status
//! - POST /api/accounts/batch-mark-invalid  : invalidate by email suffix
//! - POST /api/accounts/status              : set one account's status
//! - POST /api/scheduler/trigger            : run one replenishment now
//! - GET  /api/scheduler/next               : next scheduled replenishment
//! - GET  /health                           : liveness plus pool summary
//! - GET  /metrics                          : Prometheus exposition

use std::sync::Arc;
use std::time::Instant;

use account_pool::{Account, AccountStatus, Allocation, AllocationEngine, Scheduler};
use axum::Router;
use axum::extract::{MatchedPath, Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ApiError, json_response};

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    engine: Arc<AllocationEngine>,
    scheduler: Arc<Scheduler>,
    prometheus: Option<PrometheusHandle>,
}

impl AdminState {
    pub fn new(
        engine: Arc<AllocationEngine>,
        scheduler: Arc<Scheduler>,
        prometheus: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            engine,
            scheduler,
            prometheus,
        }
    }
}

/// Build the admin router. Applies a concurrency limit of `max_connections`.
pub fn build_router(state: AdminState, max_connections: usize) -> Router {
    Router::new()
        .route("/api/account", get(allocate_next))
        .route("/api/accounts", get(list_accounts))
        .route("/api/accounts/{id}/allocate", post(allocate_by_id))
        .route("/api/accounts/batch-mark-invalid", post(batch_mark_invalid))
        .route("/api/accounts/status", post(update_status))
        .route("/api/stats", get(stats))
        .route("/api/scheduler/trigger", post(trigger_replenishment))
        .route("/api/scheduler/next", get(next_replenishment))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn(track_request))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Record count and latency per matched route.
async fn track_request(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let start = Instant::now();
    let response = next.run(request).await;
    crate::metrics::record_request(
        &route,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

/// Wire form of an allocation. This is the one place secrets leave the
/// service.
#[derive(Serialize)]
struct AllocationBody {
    id: i64,
    email: String,
    password: String,
    token: Option<String>,
}

impl From<Allocation> for AllocationBody {
    fn from(allocation: Allocation) -> Self {
        Self {
            id: allocation.id,
            email: allocation.email,
            password: allocation.password.expose().clone(),
            token: allocation.token.map(|t| t.expose().clone()),
        }
    }
}

/// Account listing entry without password or token.
#[derive(Serialize)]
struct AccountSummary {
    id: i64,
    email: String,
    first_name: Option<String>,
    last_name: Option<String>,
    status: AccountStatus,
    register_time: DateTime<Utc>,
    last_allocated_time: Option<DateTime<Utc>>,
    metadata: Option<serde_json::Value>,
    has_token: bool,
    created_at: DateTime<Utc>,
}

impl From<Account> for AccountSummary {
    fn from(account: Account) -> Self {
        Self {
            id: account.id,
            has_token: account.token.is_some(),
            email: account.email,
            first_name: account.first_name,
            last_name: account.last_name,
            status: account.status,
            register_time: account.register_time,
            last_allocated_time: account.last_allocated_time,
            metadata: account.metadata,
            created_at: account.created_at,
        }
    }
}

fn allocation_response(allocation: Option<Allocation>, not_found: &str) -> Response {
    match allocation {
        Some(allocation) => {
            let body = serde_json::to_value(AllocationBody::from(allocation))
                .unwrap_or_else(|_| serde_json::json!({}));
            json_response(StatusCode::OK, body)
        }
        None => json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": not_found }),
        ),
    }
}

/// GET /api/account: allocate the oldest available account.
async fn allocate_next(State(state): State<AdminState>) -> Result<Response, ApiError> {
    let allocation = state.engine.allocate_next().await?;
    Ok(allocation_response(allocation, "no available account"))
}

/// POST /api/accounts/{id}/allocate: administrative override, allocates
/// whatever the record's current status.
async fn allocate_by_id(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let allocation = state.engine.allocate_by_id(id).await?;
    Ok(allocation_response(allocation, "account not found"))
}

/// GET /api/accounts: every account, secrets omitted.
async fn list_accounts(State(state): State<AdminState>) -> Result<Response, ApiError> {
    let accounts: Vec<AccountSummary> = state
        .engine
        .list_all()
        .await?
        .into_iter()
        .map(AccountSummary::from)
        .collect();
    Ok(json_response(
        StatusCode::OK,
        serde_json::json!({ "accounts": accounts }),
    ))
}

/// GET /api/stats
async fn stats(State(state): State<AdminState>) -> Result<Response, ApiError> {
    let stats = state.engine.stats().await?;
    Ok(json_response(StatusCode::OK, serde_json::json!(stats)))
}

#[derive(Deserialize)]
struct BatchInvalidateRequest {
    suffix: String,
}

/// POST /api/accounts/batch-mark-invalid: the suffix must be a domain
/// such as `@example.com`.
async fn batch_mark_invalid(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<BatchInvalidateRequest>,
) -> Result<Response, ApiError> {
    if !body.suffix.starts_with('@') {
        warn!(suffix = %body.suffix, "rejected batch invalidation suffix");
        return Ok(json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": "suffix must start with '@'" }),
        ));
    }
    let updated = state.engine.batch_invalidate(&body.suffix).await?;
    Ok(json_response(
        StatusCode::OK,
        serde_json::json!({ "updated": updated }),
    ))
}

#[derive(Deserialize)]
struct StatusRequest {
    email: String,
    status: String,
    #[serde(default)]
    touch_allocated_time: bool,
}

/// POST /api/accounts/status
async fn update_status(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<StatusRequest>,
) -> Result<Response, ApiError> {
    let status: AccountStatus = body.status.parse()?;
    let updated = state
        .engine
        .mark_status(&body.email, status, body.touch_allocated_time)
        .await?;
    if !updated {
        return Ok(json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": "account not found" }),
        ));
    }
    Ok(json_response(
        StatusCode::OK,
        serde_json::json!({ "email": body.email, "status": status }),
    ))
}

/// POST /api/scheduler/trigger: fire and forget.
async fn trigger_replenishment(State(state): State<AdminState>) -> Response {
    // Detached: the run outlives the request
    drop(state.scheduler.trigger_now());
    info!("replenishment triggered via admin API");
    json_response(
        StatusCode::ACCEPTED,
        serde_json::json!({ "status": "triggered" }),
    )
}

/// GET /api/scheduler/next
async fn next_replenishment(State(state): State<AdminState>) -> Response {
    let body = match state.scheduler.next_replenishment().await {
        Some(next) => serde_json::json!({
            "scheduled": true,
            "next_run": next.at,
            "remaining_secs": next.remaining.as_secs(),
        }),
        None => serde_json::json!({ "scheduled": false }),
    };
    json_response(StatusCode::OK, body)
}

/// GET /health: 503 when storage is unreachable.
async fn health(State(state): State<AdminState>) -> Response {
    match state.engine.stats().await {
        Ok(stats) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "backend": state.engine.storage().backend(),
                "pool": stats,
            }),
        ),
        Err(e) => {
            warn!(error = %e, "health check failed");
            json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({ "status": "unhealthy", "error": e.to_string() }),
            )
        }
    }
}

/// GET /metrics: Prometheus text exposition.
async fn metrics_handler(State(state): State<AdminState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            StatusCode::OK,
            [(
                axum::http::header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use account_pool::{
        AccountProducer, BoxFuture, Insert, NewAccount, ProducedAccount, SchedulerConfig,
        SqlStore, SystemClock,
    };
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use token_exchange::{ExchangeConfig, TokenRefresher};
    use tower::ServiceExt;

    #[derive(Default)]
    struct FakeProducer {
        created: AtomicUsize,
    }

    impl AccountProducer for FakeProducer {
        fn create(&self) -> BoxFuture<'_, account_pool::Result<ProducedAccount>> {
            Box::pin(async move {
                let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(ProducedAccount {
                    email: format!("new{n}@fake.test"),
                    password: "pw".into(),
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
        ) -> BoxFuture<'a, account_pool::Result<Option<String>>> {
            Box::pin(async { Ok(Some("login-token".to_string())) })
        }
    }

    struct TestApp {
        router: Router,
        engine: Arc<AllocationEngine>,
    }

    async fn test_app() -> TestApp {
        let storage = SqlStore::in_memory(Arc::new(SystemClock)).await.unwrap();
        let engine = Arc::new(AllocationEngine::new(
            Arc::new(storage),
            TokenRefresher::new(
                reqwest::Client::new(),
                ExchangeConfig::new("http://127.0.0.1:9/associate", "http://127.0.0.1:9/poll"),
            ),
            Arc::new(FakeProducer::default()),
        ));
        let scheduler = Arc::new(Scheduler::new(
            engine.clone(),
            SchedulerConfig {
                enable_aging: false,
                ..SchedulerConfig::default()
            },
        ));
        let state = AdminState::new(engine.clone(), scheduler, None);
        TestApp {
            router: build_router(state, 16),
            engine,
        }
    }

    async fn add(engine: &AllocationEngine, email: &str) -> i64 {
        match engine
            .add_account(NewAccount::new(email, "secret-pw"))
            .await
            .unwrap()
        {
            Insert::Added { id } => id,
            Insert::Duplicate => panic!("duplicate {email}"),
        }
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn allocate_from_empty_pool_is_404() {
        let app = test_app().await;
        let (status, json) = send(&app.router, get_req("/api/account")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "no available account");
    }

    #[tokio::test]
    async fn allocate_returns_credentials_and_token() {
        let app = test_app().await;
        let id = add(&app.engine, "a@x.test").await;

        let (status, json) = send(&app.router, get_req("/api/account")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["id"], id);
        assert_eq!(json["email"], "a@x.test");
        assert_eq!(json["password"], "secret-pw");
        assert_eq!(json["token"], "login-token");

        let (status, _) = send(&app.router, get_req("/api/account")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn allocate_by_id_overrides_and_404s() {
        let app = test_app().await;
        let id = add(&app.engine, "a@x.test").await;
        app.engine
            .mark_status("a@x.test", AccountStatus::Invalid, false)
            .await
            .unwrap();

        let (status, json) = send(
            &app.router,
            post_json(&format!("/api/accounts/{id}/allocate"), serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["email"], "a@x.test");

        let (status, _) = send(
            &app.router,
            post_json("/api/accounts/999/allocate", serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn exchange_failure_is_bad_gateway() {
        let app = test_app().await;
        let mut account = NewAccount::new("a@x.test", "pw");
        account.token = Some("not-a-jwt".to_string().into());
        let Insert::Added { id } = app.engine.add_account(account).await.unwrap() else {
            panic!("expected insert");
        };

        let (status, json) = send(
            &app.router,
            post_json(&format!("/api/accounts/{id}/allocate"), serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(json["error"].as_str().is_some());
    }

    #[tokio::test]
    async fn list_accounts_omits_secrets() {
        let app = test_app().await;
        add(&app.engine, "a@x.test").await;
        add(&app.engine, "b@x.test").await;

        let (status, json) = send(&app.router, get_req("/api/accounts")).await;
        assert_eq!(status, StatusCode::OK);
        let accounts = json["accounts"].as_array().unwrap();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0]["email"], "a@x.test");
        assert_eq!(accounts[0]["status"], "available");
        assert_eq!(accounts[0]["has_token"], false);
        assert!(accounts[0].get("password").is_none());
        assert!(accounts[0].get("token").is_none());
    }

    #[tokio::test]
    async fn stats_reports_counts() {
        let app = test_app().await;
        add(&app.engine, "a@x.test").await;
        add(&app.engine, "b@x.test").await;
        send(&app.router, get_req("/api/account")).await;

        let (status, json) = send(&app.router, get_req("/api/stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["total"], 2);
        assert_eq!(json["available"], 1);
        assert_eq!(json["allocated"], 1);
        assert_eq!(json["invalid"], 0);
    }

    #[tokio::test]
    async fn batch_invalidate_requires_domain_suffix() {
        let app = test_app().await;
        add(&app.engine, "a@spam.test").await;
        add(&app.engine, "b@ok.test").await;

        let (status, _) = send(
            &app.router,
            post_json(
                "/api/accounts/batch-mark-invalid",
                serde_json::json!({ "suffix": "spam.test" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, json) = send(
            &app.router,
            post_json(
                "/api/accounts/batch-mark-invalid",
                serde_json::json!({ "suffix": "@spam.test" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["updated"], 1);
        assert_eq!(app.engine.stats().await.unwrap().invalid, 1);
    }

    #[tokio::test]
    async fn status_update_paths() {
        let app = test_app().await;
        add(&app.engine, "a@x.test").await;

        let (status, json) = send(
            &app.router,
            post_json(
                "/api/accounts/status",
                serde_json::json!({ "email": "a@x.test", "status": "invalid" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "invalid");

        let (status, _) = send(
            &app.router,
            post_json(
                "/api/accounts/status",
                serde_json::json!({ "email": "a@x.test", "status": "deleted" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app.router,
            post_json(
                "/api/accounts/status",
                serde_json::json!({ "email": "ghost@x.test", "status": "available" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn trigger_is_accepted_and_adds_account() {
        let app = test_app().await;
        let (status, json) = send(
            &app.router,
            post_json("/api/scheduler/trigger", serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json["status"], "triggered");

        for _ in 0..100 {
            if app.engine.stats().await.unwrap().total == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("triggered replenishment never added an account");
    }

    #[tokio::test]
    async fn next_run_unscheduled_before_start() {
        let app = test_app().await;
        let (status, json) = send(&app.router, get_req("/api/scheduler/next")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["scheduled"], false);
    }

    #[tokio::test]
    async fn health_includes_pool_summary() {
        let app = test_app().await;
        add(&app.engine, "a@x.test").await;

        let (status, json) = send(&app.router, get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["backend"], "sqlite");
        assert_eq!(json["pool"]["available"], 1);
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_404() {
        let app = test_app().await;
        let response = app.router.clone().oneshot(get_req("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_renders_with_recorder() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let app = test_app().await;
        let state = AdminState::new(
            app.engine.clone(),
            Arc::new(Scheduler::new(app.engine.clone(), SchedulerConfig::default())),
            Some(handle),
        );
        let router = build_router(state, 16);
        send(&router, get_req("/api/account")).await;

        let response = router.clone().oneshot(get_req("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("pool_allocations_total"), "got: {text}");
        assert!(text.contains("admin_requests_total"));
    }
}
