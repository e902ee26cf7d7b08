//! HTTP API for message submission, status lookups and health checks

use crate::config::ApiConfig;
use crate::coordination::DeliveryEngine;
use crate::error::{DeliveryError, DeliveryResult};
use crate::message::{Message, MsgId, Request};
use crate::storage::{MsgStorage, StatusCounts};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DeliveryEngine>,
    pub storage: Arc<dyn MsgStorage>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/messages", post(submit_message))
        .route("/messages/:id", get(get_message))
        .route("/stats", get(get_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> DeliveryResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| DeliveryError::Config(format!("Cannot bind API address {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| DeliveryError::Internal(format!("API server failed: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - storage and node must both answer
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let storage_ok = state.storage.status_counts().await.is_ok();
    let node_ok = state
        .engine
        .broadcaster()
        .manager()
        .node()
        .block_number()
        .await
        .is_ok();

    let ready = storage_ok && node_ok;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            storage: storage_ok,
            node: node_ok,
        }),
    )
}

async fn submit_message(
    State(state): State<AppState>,
    Json(request): Json<Request>,
) -> impl IntoResponse {
    match state.engine.submit(request).await {
        Ok(id) => (StatusCode::ACCEPTED, Json(SubmitResponse { id })).into_response(),
        Err(e) => {
            warn!("Rejected submission: {}", e);
            error_response(&e).into_response()
        }
    }
}

async fn get_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Message>, (StatusCode, Json<ErrorResponse>)> {
    let id: MsgId = id.parse().map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("invalid message id: {}", id),
            }),
        )
    })?;

    state
        .storage
        .get_msg(&id)
        .await
        .map(Json)
        .map_err(|e| error_response(&e))
}

/// Queue depths and per-status message counts
async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    let sequencer = state.engine.sequencer();
    let queued = sequencer.queued_msg_count().await;
    let pending = sequencer.pending_msg_count();

    match state.storage.status_counts().await {
        Ok(statuses) => (
            StatusCode::OK,
            Json(StatsResponse {
                queued,
                pending,
                statuses,
            }),
        )
            .into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

fn error_response(err: &DeliveryError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match err {
        DeliveryError::MsgNotFound(_) => StatusCode::NOT_FOUND,
        DeliveryError::DuplicateMsg(_) => StatusCode::CONFLICT,
        DeliveryError::SelfDependency(_) => StatusCode::BAD_REQUEST,
        DeliveryError::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    storage: bool,
    node: bool,
}

#[derive(Serialize)]
struct SubmitResponse {
    id: MsgId,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct StatsResponse {
    queued: usize,
    pending: usize,
    statuses: StatusCounts,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::{FakeNode, CHAIN_ID};
    use crate::coordination::Sequencer;
    use crate::storage::MemoryStorage;
    use crate::tx::{
        Broadcaster, BroadcasterSettings, ManagerSettings, NonceAllocator, TransactionManager,
    };
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use ethers::types::Address;
    use tower::ServiceExt;

    fn app() -> (Arc<MemoryStorage>, Router) {
        let node = Arc::new(FakeNode::new());
        let storage = Arc::new(MemoryStorage::new());
        let manager = Arc::new(TransactionManager::new(
            node.clone(),
            storage.clone(),
            Arc::new(NonceAllocator::new(node)),
            ManagerSettings::new(CHAIN_ID),
        ));
        let broadcaster = Arc::new(Broadcaster::new(manager, BroadcasterSettings::default()));
        let sequencer = Arc::new(Sequencer::new(storage.clone(), 8));
        let engine = Arc::new(DeliveryEngine::new(sequencer, broadcaster));

        let router = router(AppState {
            engine,
            storage: storage.clone(),
        });
        (storage, router)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_submit_then_fetch() {
        let (storage, app) = app();
        let request = Request::new(Address::random()).to(Address::random());

        let response = app
            .clone()
            .oneshot(
                HttpRequest::post("/messages")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&request).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["id"], request.id.to_string());
        assert!(storage.has_msg(&request.id).await.unwrap());

        let response = app
            .oneshot(
                HttpRequest::get(format!("/messages/{}", request.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "queued");
    }

    #[tokio::test]
    async fn test_duplicate_submission_conflicts() {
        let (_, app) = app();
        let body = serde_json::to_vec(&Request::new(Address::random())).unwrap();

        for expected in [StatusCode::ACCEPTED, StatusCode::CONFLICT] {
            let response = app
                .clone()
                .oneshot(
                    HttpRequest::post("/messages")
                        .header("content-type", "application/json")
                        .body(Body::from(body.clone()))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), expected);
        }
    }

    #[tokio::test]
    async fn test_unknown_and_invalid_ids() {
        let (_, app) = app();

        let response = app
            .clone()
            .oneshot(
                HttpRequest::get(format!("/messages/{}", MsgId::random()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                HttpRequest::get("/messages/not-a-uuid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_ready_and_stats() {
        let (storage, app) = app();
        storage.add_msg(Request::new(Address::random())).await.unwrap();

        let response = app
            .clone()
            .oneshot(HttpRequest::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(HttpRequest::get("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let stats = body_json(response).await;
        assert_eq!(stats["statuses"]["pending"], 1);
        assert_eq!(stats["queued"], 0);
    }
}
