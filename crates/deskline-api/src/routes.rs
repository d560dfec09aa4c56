use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, Request, State};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use deskline_core::protocol::{PullRequest, PullResponse, SyncResponse};
use deskline_core::session::fingerprint;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{extract_bearer_token, Caller, JwtVerifier};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::pull::PullService;
use crate::rate_limit::{EndpointRateLimiter, ProtectedEndpoint, RateLimitMetricsSnapshot};
use crate::realtime::{parse_tables, ChangeFeed, FeedMetricsSnapshot};
use crate::reconciler::Reconciler;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    store: Store,
    jwt_verifier: Arc<JwtVerifier>,
    reconciler: Reconciler,
    pull: PullService,
    feed: ChangeFeed,
    endpoint_rate_limiter: Arc<EndpointRateLimiter>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, store: Store) -> Self {
        let feed = ChangeFeed::new(config.realtime_buffer);
        Self {
            jwt_verifier: Arc::new(JwtVerifier::new(&config)),
            reconciler: Reconciler::new(store.clone(), feed.clone()),
            pull: PullService::new(store.clone(), config.pull_page_limit),
            endpoint_rate_limiter: Arc::new(EndpointRateLimiter::from_config(config.as_ref())),
            feed,
            store,
            config,
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/sync", post(sync))
        .route("/pull", post(pull))
        .route("/realtime", get(realtime))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    rate_limit: RateLimitMetricsSnapshot,
    realtime: FeedMetricsSnapshot,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        rate_limit: state.endpoint_rate_limiter.metrics_snapshot(),
        realtime: state.feed.metrics_snapshot(),
    })
}

/// Verify the bearer token and attach the caller's memberships
async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(request.headers())?;
    let user = state.jwt_verifier.verify_access_token(token).await?;
    let memberships = state.store.memberships_for(&user.user_id).await?;
    request
        .extensions_mut()
        .insert(Caller::new(user, memberships));
    Ok(next.run(request).await)
}

/// Sync body with each operation left undecoded until it is reconciled
#[derive(Debug, Deserialize)]
struct SyncBatch {
    operations: Vec<serde_json::Value>,
}

async fn sync(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    body: Result<Json<SyncBatch>, JsonRejection>,
) -> Result<Json<SyncResponse>, AppError> {
    let Json(request) = body?;
    state
        .endpoint_rate_limiter
        .check(ProtectedEndpoint::Sync, &caller.user_id)
        .await?;

    let max = state.config.sync_max_batch_operations;
    if request.operations.len() > max {
        return Err(AppError::payload_too_large(format!(
            "Batch of {} operations exceeds the limit of {max}",
            request.operations.len()
        )));
    }

    let report = state
        .reconciler
        .apply_encoded_batch(&caller, &request.operations)
        .await?;
    tracing::info!(
        endpoint = "sync",
        user = %fingerprint(&caller.user_id),
        session = caller.session_id.as_deref().unwrap_or("none"),
        operations = request.operations.len(),
        applied = report.applied,
        unchanged = report.unchanged,
        forbidden = report.forbidden,
        not_found = report.not_found,
        rows = report.response.len(),
        "Reconciled sync batch"
    );
    Ok(Json(report.response))
}

async fn pull(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    body: Result<Json<PullRequest>, JsonRejection>,
) -> Result<Json<PullResponse>, AppError> {
    let Json(request) = body?;
    state
        .endpoint_rate_limiter
        .check(ProtectedEndpoint::Pull, &caller.user_id)
        .await?;

    let response = state.pull.pull(&caller, &request).await?;
    tracing::info!(
        endpoint = "pull",
        user = %fingerprint(&caller.user_id),
        tables = request.requested_tables().len(),
        rows = response.rows.len(),
        truncated = response.has_more.len(),
        "Served pull"
    );
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct RealtimeQuery {
    tables: Option<String>,
}

async fn realtime(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<RealtimeQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, AppError> {
    state
        .endpoint_rate_limiter
        .check(ProtectedEndpoint::Realtime, &caller.user_id)
        .await?;

    let tables = parse_tables(query.tables.as_deref()).map_err(AppError::bad_request)?;
    tracing::info!(
        endpoint = "realtime",
        user = %fingerprint(&caller.user_id),
        tables = tables.len(),
        organizations = caller.memberships.len(),
        "Opened realtime stream"
    );

    let events = state
        .feed
        .subscribe(caller.memberships, tables)
        .map(|event| Event::default().event("change").json_data(event));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, StatusCode};
    use deskline_core::models::{OrganizationId, Table, TicketId};
    use deskline_core::protocol::{CreateTicket, Operation, SyncRequest};
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::auth::issue_hs256_token;
    use crate::config::test_config;

    struct Harness {
        router: Router,
        organization_id: OrganizationId,
        token: String,
    }

    async fn harness(config: AppConfig) -> Harness {
        let store = Store::open_in_memory().await.unwrap();
        let org = store.create_organization("Acme", "alice").await.unwrap();
        let token = issue_hs256_token(config.jwt_secret.as_deref().unwrap(), "alice");
        Harness {
            router: app_router(AppState::new(Arc::new(config), store)),
            organization_id: org.id,
            token,
        }
    }

    impl Harness {
        async fn send(&self, method: Method, uri: &str, body: Option<Value>) -> Response {
            let mut builder = axum::http::Request::builder()
                .method(method)
                .uri(uri)
                .header(header::AUTHORIZATION, format!("Bearer {}", self.token));
            let body = match body {
                Some(json) => {
                    builder = builder.header(header::CONTENT_TYPE, "application/json");
                    Body::from(json.to_string())
                }
                None => Body::empty(),
            };
            self.router
                .clone()
                .oneshot(builder.body(body).unwrap())
                .await
                .unwrap()
        }

        fn create_ticket(&self, title: &str) -> Operation {
            Operation::CreateTicket(CreateTicket {
                id: TicketId::new(),
                organization_id: self.organization_id,
                title: title.to_string(),
                body: String::new(),
                status: Default::default(),
            })
        }
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn healthz_is_public() {
        let harness = harness(test_config()).await;
        let response = harness
            .router
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["realtime"]["published"], 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_requires_a_bearer_token() {
        let harness = harness(test_config()).await;
        let response = harness
            .router
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method(Method::POST)
                    .uri("/v1/sync")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"operations":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_returns_canonical_rows_by_table() {
        let harness = harness(test_config()).await;
        let request = SyncRequest {
            operations: vec![harness.create_ticket("  Broken VPN ")],
        };

        let response = harness
            .send(
                Method::POST,
                "/v1/sync",
                Some(serde_json::to_value(&request).unwrap()),
            )
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        let tickets = body["tickets"].as_array().unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0]["title"], "Broken VPN");
        assert_eq!(tickets[0]["created_by"], "alice");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn oversized_batches_are_rejected() {
        let mut config = test_config();
        config.sync_max_batch_operations = 1;
        let harness = harness(config).await;
        let request = SyncRequest {
            operations: vec![harness.create_ticket("One"), harness.create_ticket("Two")],
        };

        let response = harness
            .send(
                Method::POST,
                "/v1/sync",
                Some(serde_json::to_value(&request).unwrap()),
            )
            .await;

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().contains("limit of 1"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_operations_do_not_sink_the_batch() {
        let harness = harness(test_config()).await;
        let valid = serde_json::to_value(harness.create_ticket("Printer jam")).unwrap();
        let mut extra_field = serde_json::to_value(harness.create_ticket("Sneaky")).unwrap();
        extra_field["payload"]["bogus"] = Value::Bool(true);
        let body = serde_json::json!({
            "operations": [
                valid,
                extra_field,
                {"kind": "create_note", "payload": {}},
            ]
        });

        let response = harness.send(Method::POST, "/v1/sync", Some(body)).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        let tickets = body["tickets"].as_array().unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0]["title"], "Printer jam");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreadable_bodies_get_json_errors() {
        let harness = harness(test_config()).await;
        let response = harness
            .send(Method::POST, "/v1/sync", Some(serde_json::json!({"ops": []})))
            .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().starts_with("Invalid request"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pull_returns_rows_after_sync() {
        let harness = harness(test_config()).await;
        let request = SyncRequest {
            operations: vec![harness.create_ticket("Pulled")],
        };
        harness
            .send(
                Method::POST,
                "/v1/sync",
                Some(serde_json::to_value(&request).unwrap()),
            )
            .await;

        let response = harness
            .send(
                Method::POST,
                "/v1/pull",
                Some(serde_json::json!({"watermarks": {}})),
            )
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let pulled: PullResponse =
            serde_json::from_value(json_body(response).await).unwrap();
        assert_eq!(pulled.rows.get(Table::Tickets).len(), 1);
        assert_eq!(pulled.rows.get(Table::Organizations).len(), 1);
        assert!(pulled.has_more.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn realtime_validates_tables_and_streams_events() {
        let harness = harness(test_config()).await;

        let bad = harness
            .send(Method::GET, "/v1/realtime?tables=notes", None)
            .await;
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let ok = harness
            .send(Method::GET, "/v1/realtime?tables=tickets,tag_keys", None)
            .await;
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(ok.headers()[header::CONTENT_TYPE], "text/event-stream");
    }
}
