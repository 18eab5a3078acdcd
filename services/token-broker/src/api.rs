//! HTTP API
//!
//! Endpoints:
//! - POST /v1/tokens: acquire a token for a site
//! - GET /v1/statistics: acquisition counters and load
//! - DELETE /v1/blacklist/{site}/{account}: clear a blacklist entry
//! - GET /v1/history?limit=N: recent acquisitions with a summary
//! - GET /health: liveness and uptime
//! - GET /metrics: Prometheus exposition

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use acquisition::{AcquisitionOrchestrator, AcquisitionResult};
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tracing::info;

use crate::error::{ApiError, acquisition_status};
use crate::metrics;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 1000;

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<AcquisitionOrchestrator>,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
    /// Token requests currently being served, reported when draining
    pub in_flight: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(orchestrator: Arc<AcquisitionOrchestrator>, prometheus: PrometheusHandle) -> Self {
        Self {
            orchestrator,
            prometheus,
            started_at: Instant::now(),
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Build the axum router with all routes and shared state.
///
/// A concurrency limit caps simultaneous requests; acquisitions beyond the
/// coordinator's own ceilings wait in its queue, not here.
pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/v1/tokens", post(acquire_token))
        .route("/v1/statistics", get(statistics))
        .route("/v1/blacklist/{site}/{account}", delete(clear_blacklist))
        .route("/v1/history", get(history))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> impl IntoResponse {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Request body for POST /v1/tokens.
#[derive(Deserialize)]
struct TokenRequest {
    site: String,
    #[serde(default)]
    credential_id: Option<u64>,
}

struct InFlight<'a>(&'a AtomicU64);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// POST /v1/tokens: acquire a token.
///
/// The token is returned in the body; it is never logged.
async fn acquire_token(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<TokenRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let _in_flight = InFlight::enter(&state.in_flight);
    let started = Instant::now();

    let outcome = state
        .orchestrator
        .acquire(&body.site, body.credential_id)
        .await;
    let status = match &outcome {
        Ok(_) => StatusCode::OK,
        Err(e) => acquisition_status(e),
    };
    metrics::record_request("tokens", status.as_u16(), started.elapsed().as_secs_f64());

    let result = outcome?;
    info!(
        request_id = %result.request_id,
        site = %result.site,
        method = result.method.as_str(),
        "token issued to caller"
    );
    Ok(json_response(StatusCode::OK, token_body(&result)))
}

fn token_body(result: &AcquisitionResult) -> serde_json::Value {
    let attempts: Vec<serde_json::Value> = result
        .attempts
        .iter()
        .map(|a| {
            serde_json::json!({
                "index": a.index,
                "success": a.success,
                "duration_ms": a.duration.as_millis() as u64,
                "error_kind": a.error_kind.map(|k| k.as_str()),
                "error_message": a.error_message,
            })
        })
        .collect();
    let retries: Vec<serde_json::Value> = result
        .retries
        .iter()
        .map(|r| {
            serde_json::json!({
                "attempt": r.attempt,
                "class": r.class.map(|c| c.as_str()),
                "elapsed_ms": r.elapsed.as_millis() as u64,
                "delay_ms": r.delay.map(|d| d.as_millis() as u64),
            })
        })
        .collect();
    serde_json::json!({
        "request_id": result.request_id,
        "site": result.site,
        "account": result.account,
        "credential_id": result.credential_id,
        "token": result.token.expose(),
        "expires_at": result.expires_at,
        "method": result.method.as_str(),
        "duration_ms": result.duration.as_millis() as u64,
        "attempts": attempts,
        "retries": retries,
    })
}

/// GET /v1/statistics: process-lifetime counters plus current load.
async fn statistics(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.orchestrator.statistics();
    let load = state.orchestrator.coordinator().snapshot();
    let cache = state.orchestrator.cache().stats().await;

    json_response(
        StatusCode::OK,
        serde_json::json!({
            "acquisition_count": stats.acquisition_count,
            "success_count": stats.success_count,
            "failure_count": stats.failure_count,
            "success_rate": stats.success_rate,
            "active_acquisitions": stats.active_acquisitions,
            "login_invocations": state.orchestrator.login_invocations(),
            "coordinator": {
                "active_global": load.active_global,
                "active_per_site": load.active_per_site,
                "queue_length": load.queue_length,
                "slots": load.slots,
            },
            "cache": {
                "hits": cache.hits,
                "misses": cache.misses,
                "entries": cache.entries,
            },
        }),
    )
}

/// DELETE /v1/blacklist/{site}/{account}: admin override for a blacklisted account.
async fn clear_blacklist(
    State(state): State<AppState>,
    Path((site, account)): Path<(String, String)>,
) -> impl IntoResponse {
    let cleared = state
        .orchestrator
        .selector()
        .clear_blacklist(&site, &account)
        .await;
    let status = if cleared {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    json_response(
        status,
        serde_json::json!({
            "site": site,
            "account": account,
            "cleared": cleared,
        }),
    )
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    limit: Option<usize>,
}

/// GET /v1/history: most recent acquisitions, oldest first.
async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    if limit == 0 {
        return Err(ApiError::BadRequest("limit must be greater than 0".into()));
    }

    let records = state
        .orchestrator
        .history()
        .recent(limit)
        .await
        .map_err(ApiError::from)?;
    let summary = acquisition::history::summarize(&records);

    Ok(json_response(
        StatusCode::OK,
        serde_json::json!({
            "records": records,
            "summary": {
                "total": summary.total,
                "successes": summary.successes,
                "failures": summary.failures,
                "by_method": summary.by_method,
                "by_error_kind": summary.by_error_kind,
                "average_duration_ms": summary.average_duration_ms,
            },
        }),
    ))
}

/// GET /health: liveness with uptime and current activity.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.orchestrator.statistics();
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "uptime_seconds": state.started_at.elapsed().as_secs(),
            "active_acquisitions": stats.active_acquisitions,
            "in_flight": state.in_flight.load(Ordering::Relaxed),
        }),
    )
}

/// Prometheus metrics endpoint: returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use acquisition::{AcquisitionConfig, Collaborators};
    use axum::body::Body;
    use axum::http::Request;
    use common::Secret;
    use portal::{ErrorKind, IssuedToken, LoginPortal, PortalError};
    use std::sync::atomic::AtomicUsize;
    use stores::{Credential, MemoryCredentialStore, MemoryHistoryStore, MemoryTokenStore};
    use tower::ServiceExt;

    /// Portal that issues a fixed token, or rejects every login.
    struct FixedPortal {
        reject: bool,
        calls: AtomicUsize,
    }

    impl LoginPortal for FixedPortal {
        fn id(&self) -> &str {
            "fixed"
        }

        fn login(&self, account: &str, _secret: &Secret<String>) -> portal::Result<IssuedToken> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if self.reject {
                return Err(PortalError::new(ErrorKind::Permission, "bad password"));
            }
            Ok(IssuedToken {
                token: Secret::new(format!("token-for-{account}")),
                expires_at: None,
            })
        }
    }

    fn credential(id: u64, site: &str, account: &str) -> Credential {
        Credential {
            id,
            site: site.into(),
            account: account.into(),
            secret: "pw".into(),
            is_preferred: false,
            last_success_at: None,
            success_count: 0,
            failure_count: 0,
        }
    }

    fn test_state(reject: bool) -> AppState {
        let (recorder, handle) = metrics::test_recorder();
        drop(recorder);
        let orchestrator = AcquisitionOrchestrator::new(
            AcquisitionConfig::default(),
            Collaborators {
                portal: Arc::new(FixedPortal {
                    reject,
                    calls: AtomicUsize::new(0),
                }),
                credentials: Arc::new(MemoryCredentialStore::new([credential(
                    1,
                    "portal.example",
                    "alice",
                )])),
                tokens: Arc::new(MemoryTokenStore::new()),
                history: Arc::new(MemoryHistoryStore::new()),
            },
        )
        .unwrap();
        AppState::new(Arc::new(orchestrator), handle)
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn token_request(body: &str) -> Request<Body> {
        Request::builder()
            .uri("/v1/tokens")
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn token_endpoint_logs_in_then_serves_cache() {
        let state = test_state(false);
        let app = build_router(state.clone(), 16);

        let (status, json) = send(app.clone(), token_request(r#"{"site":"portal.example"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["token"], "token-for-alice");
        assert_eq!(json["method"], "login");
        assert_eq!(json["account"], "alice");
        assert_eq!(json["attempts"].as_array().unwrap().len(), 1);
        assert_eq!(json["retries"][0]["attempt"], 1);
        assert!(json["retries"][0]["class"].is_null());

        let (status, json) = send(
            app,
            token_request(r#"{"site":"portal.example","credential_id":1}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["method"], "cache");
        assert!(json["retries"].as_array().unwrap().is_empty());
        assert_eq!(state.orchestrator.login_invocations(), 1);
    }

    #[tokio::test]
    async fn empty_site_is_bad_request() {
        let app = build_router(test_state(false), 16);
        let (status, json) = send(app, token_request(r#"{"site":"  "}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["kind"], "validation");
    }

    #[tokio::test]
    async fn unknown_site_is_unavailable() {
        let app = build_router(test_state(false), 16);
        let (status, json) = send(app, token_request(r#"{"site":"elsewhere"}"#)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["error"]["kind"], "no_available_account");
    }

    #[tokio::test]
    async fn rejected_login_blacklists_until_cleared() {
        let state = test_state(true);
        let app = build_router(state, 16);

        let (status, json) = send(app.clone(), token_request(r#"{"site":"portal.example"}"#)).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(json["error"]["class"], "permission");
        assert_eq!(json["error"]["attempts"], 1);

        let clear = || {
            Request::builder()
                .uri("/v1/blacklist/portal.example/alice")
                .method("DELETE")
                .body(Body::empty())
                .unwrap()
        };
        let (status, json) = send(app.clone(), clear()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["cleared"], true);

        let (status, _) = send(app, clear()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn statistics_and_history_reflect_acquisitions() {
        let app = build_router(test_state(false), 16);
        send(app.clone(), token_request(r#"{"site":"portal.example"}"#)).await;
        send(app.clone(), token_request(r#"{"site":"elsewhere"}"#)).await;

        let (status, json) = send(app.clone(), get("/v1/statistics")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["acquisition_count"], 2);
        assert_eq!(json["success_count"], 1);
        assert_eq!(json["success_rate"], 0.5);
        assert_eq!(json["coordinator"]["active_global"], 0);

        let (status, json) = send(app.clone(), get("/v1/history?limit=10")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["records"].as_array().unwrap().len(), 2);
        assert_eq!(json["summary"]["successes"], 1);
        assert_eq!(json["summary"]["by_method"]["login"], 1);

        let (status, _) = send(app, get("/v1/history?limit=0")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_and_metrics_endpoints() {
        let app = build_router(test_state(false), 16);

        let (status, json) = send(app.clone(), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["in_flight"], 0);

        let response = app.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/plain; version=0.0.4; charset=utf-8"
        );
    }
}
