//! HTTP API for bridge requests, health checks and statistics

use crate::config::ApiConfig;
use crate::coordinator::BridgeCoordinator;
use crate::error::{BridgeError, BridgeResult};
use crate::ledger::LedgerSet;
use crate::request::{
    parse_amount, BridgeRequest, Chain, Direction, RequestId, RequestState, TxRef,
};
use crate::store::RequestStats;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<BridgeCoordinator>,
    pub ledgers: LedgerSet,
}

pub fn router(coordinator: Arc<BridgeCoordinator>, ledgers: LedgerSet) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/stats", get(get_stats))
        .route("/requests", post(create_request).get(list_requests))
        .route("/requests/:id", get(get_request))
        .route("/requests/:id/cancel", post(cancel_request))
        .route("/requests/:id/destination", post(link_destination))
        .route("/requests/:id/retry", post(retry_request))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(AppState {
            coordinator,
            ledgers,
        })
}

/// Run the HTTP API server
pub async fn run_server(
    config: ApiConfig,
    coordinator: Arc<BridgeCoordinator>,
    ledgers: LedgerSet,
) -> BridgeResult<()> {
    let app = router(coordinator, ledgers);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| BridgeError::Internal(format!("API bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| BridgeError::Internal(format!("API server: {}", e)))?;

    Ok(())
}

/// Error body `{ "error": "..." }` with a status derived from the error kind
pub struct ApiError(BridgeError);

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BridgeError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            BridgeError::NotFound(_) => StatusCode::NOT_FOUND,
            BridgeError::InvalidState { .. }
            | BridgeError::Conflict { .. }
            | BridgeError::DuplicateId(_) => StatusCode::CONFLICT,
            other => {
                error!("API request failed: {}", other);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_id(raw: &str) -> BridgeResult<RequestId> {
    raw.parse()
        .map_err(|_| BridgeError::InvalidRequest(format!("malformed request id {:?}", raw)))
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify the store and both chains answer
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let (store, chain_a, chain_b) = tokio::join!(
        state.coordinator.health_check(),
        state.ledgers.get(Chain::A).health_check(),
        state.ledgers.get(Chain::B).health_check(),
    );

    if let Err(e) = &store {
        warn!("Readiness: store unavailable: {}", e);
    }
    for result in [&chain_a, &chain_b] {
        if let Err(e) = result {
            warn!("Readiness: {}", e);
        }
    }

    let response = ReadinessResponse {
        ready: store.is_ok() && chain_a.is_ok() && chain_b.is_ok(),
        store: store.is_ok(),
        chain_a: chain_a.is_ok(),
        chain_b: chain_b.is_ok(),
    };
    let status = if response.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

async fn get_stats(State(state): State<AppState>) -> ApiResult<Json<RequestStats>> {
    Ok(Json(state.coordinator.stats().await?))
}

async fn create_request(
    State(state): State<AppState>,
    Json(body): Json<CreateRequestBody>,
) -> ApiResult<(StatusCode, Json<CreatedResponse>)> {
    let amount = parse_amount(&body.amount).map_err(BridgeError::InvalidRequest)?;
    let coordinator = &state.coordinator;

    let id = match body.source_tx_ref {
        Some(tx_ref) => {
            coordinator
                .initiate_observed(
                    body.direction,
                    &body.source_account,
                    body.dest_account.as_deref(),
                    amount,
                    TxRef::new(tx_ref),
                )
                .await?
        }
        None => {
            coordinator
                .initiate(
                    body.direction,
                    &body.source_account,
                    body.dest_account.as_deref(),
                    amount,
                )
                .await?
        }
    };

    Ok((StatusCode::CREATED, Json(CreatedResponse { id })))
}

async fn list_requests(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<RequestView>>> {
    let states = match query.state {
        Some(raw) => vec![raw
            .parse::<RequestState>()
            .map_err(BridgeError::InvalidRequest)?],
        None => RequestState::ALL.to_vec(),
    };

    let mut views = Vec::new();
    for state_filter in states {
        views.extend(
            state
                .coordinator
                .list(state_filter)
                .await?
                .into_iter()
                .map(RequestView::from),
        );
    }
    Ok(Json(views))
}

async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RequestView>> {
    let request = state.coordinator.status(parse_id(&id)?).await?;
    Ok(Json(request.into()))
}

async fn cancel_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RequestView>> {
    let request = state.coordinator.cancel(parse_id(&id)?).await?;
    Ok(Json(request.into()))
}

async fn link_destination(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<LinkDestinationBody>,
) -> ApiResult<Json<RequestView>> {
    let request = state
        .coordinator
        .link_destination(parse_id(&id)?, &body.dest_account)
        .await?;
    Ok(Json(request.into()))
}

async fn retry_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RequestView>> {
    let request = state.coordinator.retry(parse_id(&id)?).await?;
    Ok(Json(request.into()))
}

// Request and response types

#[derive(Deserialize)]
struct CreateRequestBody {
    direction: Direction,
    source_account: String,
    dest_account: Option<String>,
    /// Decimal amount with 18 decimals, e.g. "2.5"
    amount: String,
    /// Lock already signed by the user; the relayer then only observes it
    source_tx_ref: Option<String>,
}

#[derive(Deserialize)]
struct LinkDestinationBody {
    dest_account: String,
}

#[derive(Deserialize)]
struct ListQuery {
    state: Option<String>,
}

#[derive(Serialize)]
struct CreatedResponse {
    id: RequestId,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    store: bool,
    chain_a: bool,
    chain_b: bool,
}

/// JSON view of a request. Amounts are base-unit integers rendered as
/// strings since they exceed what JSON numbers carry safely.
#[derive(Serialize)]
pub struct RequestView {
    id: RequestId,
    direction: Direction,
    source_account: String,
    dest_account: Option<String>,
    amount: String,
    release_amount: Option<String>,
    state: RequestState,
    source_tx_ref: Option<TxRef>,
    dest_tx_ref: Option<TxRef>,
    attempts: u32,
    failure_reason: Option<String>,
    next_attempt_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<BridgeRequest> for RequestView {
    fn from(request: BridgeRequest) -> Self {
        Self {
            id: request.id,
            direction: request.direction,
            source_account: request.source_account,
            dest_account: request.dest_account,
            amount: request.amount.to_string(),
            release_amount: request.release_amount.map(|a| a.to_string()),
            state: request.state,
            source_tx_ref: request.source_tx_ref,
            dest_tx_ref: request.dest_tx_ref,
            attempts: request.attempts,
            failure_reason: request.failure_reason,
            next_attempt_at: request.next_attempt_at,
            created_at: request.created_at,
            updated_at: request.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::pricing::PricingPolicy;
    use crate::store::MemoryStore;
    use serde_json::{json, Value};

    async fn spawn_with(chain_b: Arc<MemoryLedger>) -> String {
        let coordinator = Arc::new(BridgeCoordinator::new(
            Arc::new(MemoryStore::new()),
            PricingPolicy::OneToOne,
            3,
        ));
        let ledgers = LedgerSet::new(Arc::new(MemoryLedger::new(Chain::A, 1)), chain_b);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(coordinator, ledgers))
                .await
                .unwrap();
        });
        format!("http://{}", addr)
    }

    async fn spawn_api() -> String {
        spawn_with(Arc::new(MemoryLedger::new(Chain::B, 1))).await
    }

    async fn create(client: &reqwest::Client, base: &str, body: Value) -> reqwest::Response {
        client
            .post(format!("{}/requests", base))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_fetch_deposit() {
        let base = spawn_api().await;
        let client = reqwest::Client::new();

        let response = create(
            &client,
            &base,
            json!({
                "direction": "deposit_to_b",
                "source_account": "0xAAA",
                "dest_account": "bridge-user-1",
                "amount": "2.5"
            }),
        )
        .await;
        assert_eq!(response.status(), reqwest::StatusCode::CREATED);
        let id = response.json::<Value>().await.unwrap()["id"]
            .as_str()
            .unwrap()
            .to_string();

        let view: Value = client
            .get(format!("{}/requests/{}", base, id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(view["state"], "pending");
        assert_eq!(view["amount"], "2500000000000000000");
        assert_eq!(view["attempts"], 0);
    }

    #[tokio::test]
    async fn test_validation_errors_are_400() {
        let base = spawn_api().await;
        let client = reqwest::Client::new();

        for body in [
            json!({ "direction": "deposit_to_b", "source_account": "AAA", "amount": "1" }),
            json!({ "direction": "deposit_to_b", "source_account": "0xAAA", "amount": "0" }),
            json!({ "direction": "deposit_to_b", "source_account": "0xAAA", "amount": "lots" }),
        ] {
            let response = create(&client, &base, body).await;
            assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
            let error: Value = response.json().await.unwrap();
            assert!(error["error"].is_string());
        }
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_ids() {
        let base = spawn_api().await;
        let client = reqwest::Client::new();

        let missing = client
            .get(format!("{}/requests/{}", base, RequestId::new()))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

        let malformed = client
            .get(format!("{}/requests/not-a-uuid", base))
            .send()
            .await
            .unwrap();
        assert_eq!(malformed.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cancel_then_cancel_again_conflicts() {
        let base = spawn_api().await;
        let client = reqwest::Client::new();

        let created: Value = create(
            &client,
            &base,
            json!({ "direction": "deposit_to_b", "source_account": "0xAAA", "amount": "1" }),
        )
        .await
        .json()
        .await
        .unwrap();
        let cancel_url = format!("{}/requests/{}/cancel", base, created["id"].as_str().unwrap());

        let first = client.post(&cancel_url).send().await.unwrap();
        assert_eq!(first.status(), reqwest::StatusCode::OK);
        assert_eq!(first.json::<Value>().await.unwrap()["state"], "cancelled");

        let second = client.post(&cancel_url).send().await.unwrap();
        assert_eq!(second.status(), reqwest::StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_ready_reports_chain_health() {
        let chain_b = Arc::new(MemoryLedger::new(Chain::B, 1));
        let base = spawn_with(chain_b.clone()).await;
        let client = reqwest::Client::new();

        let ready = client.get(format!("{}/ready", base)).send().await.unwrap();
        assert_eq!(ready.status(), reqwest::StatusCode::OK);

        chain_b.stop().await;
        let degraded = client.get(format!("{}/ready", base)).send().await.unwrap();
        assert_eq!(degraded.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = degraded.json().await.unwrap();
        assert_eq!(body["store"], true);
        assert_eq!(body["chain_a"], true);
        assert_eq!(body["chain_b"], false);
    }

    #[tokio::test]
    async fn test_list_and_stats() {
        let base = spawn_api().await;
        let client = reqwest::Client::new();

        for _ in 0..2 {
            create(
                &client,
                &base,
                json!({
                    "direction": "withdraw_to_a",
                    "source_account": "bridge-user-1",
                    "dest_account": "0xCCC",
                    "amount": "0.1"
                }),
            )
            .await;
        }

        let pending: Vec<Value> = client
            .get(format!("{}/requests?state=pending", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);

        let bad_filter = client
            .get(format!("{}/requests?state=sideways", base))
            .send()
            .await
            .unwrap();
        assert_eq!(bad_filter.status(), reqwest::StatusCode::BAD_REQUEST);

        let stats: Value = client
            .get(format!("{}/stats", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats["pending"], 2);
        assert_eq!(stats["settled"], 0);
    }
}
