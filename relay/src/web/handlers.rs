//! Claim intake handlers.
//!
//! The request body is handed to the receiver untouched: a body that is not
//! JSON must still produce the receiver's invalid-input response rather than
//! an extractor rejection.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tracing::info;

use crate::receiver::{Receiver, ReceiverOutcome};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub receiver: Receiver,
}

impl AppState {
    pub fn new(receiver: Receiver) -> Self {
        Self { receiver }
    }
}

/// Routes served by the receiver binary.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/claims", post(submit_claim))
        .with_state(state)
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Claim intake
// =============================================================================

/// Claim intake response.
#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    pub status: &'static str,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

fn status_code(outcome: &ReceiverOutcome) -> StatusCode {
    match outcome {
        ReceiverOutcome::Sent { .. } => StatusCode::OK,
        ReceiverOutcome::InvalidInput => StatusCode::BAD_REQUEST,
        ReceiverOutcome::ConfigError => StatusCode::INTERNAL_SERVER_ERROR,
        ReceiverOutcome::SendFailed => StatusCode::BAD_GATEWAY,
    }
}

/// `POST /claims` with a `{ "body": ..., "number": ... }` event.
pub async fn submit_claim(State(state): State<AppState>, body: Bytes) -> (StatusCode, Json<ClaimResponse>) {
    info!(body_length = body.len(), "claims_request_received");

    let outcome = state.receiver.handle(&body).await;
    let status = status_code(&outcome);

    info!(status = status.as_u16(), outcome = outcome.code(), "claims_request_handled");

    let request_id = match &outcome {
        ReceiverOutcome::Sent { request_id } => Some(request_id.clone()),
        _ => None,
    };

    (
        status,
        Json(ClaimResponse {
            status: outcome.code(),
            message: outcome.message(),
            request_id,
        }),
    )
}
