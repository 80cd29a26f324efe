//! Localhost control API: approve/reject stalled calls, rotate the
//! signing key.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;
use tracing::{error, info};
use vouch_core::gateway::GatewayError;

use crate::state::SharedState;

/// Builds the control router.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/approve/:event_id", post(approve))
        .route("/api/reject/:event_id", post(reject))
        .route("/api/rekey", post(rekey))
        .with_state(state)
}

async fn approve(State(state): State<SharedState>, Path(event_id): Path<String>) -> Response {
    signal(&state, &event_id, true)
}

async fn reject(State(state): State<SharedState>, Path(event_id): Path<String>) -> Response {
    signal(&state, &event_id, false)
}

fn signal(state: &SharedState, event_id: &str, approved: bool) -> Response {
    match state.gateway.signal(event_id, approved) {
        Ok(()) => {
            info!(event_id = %event_id, approved, "stall resolved via control API");
            let text = if approved {
                "Event approved\n"
            } else {
                "Event rejected\n"
            };
            (StatusCode::OK, text).into_response()
        },
        Err(GatewayError::UnknownEvent { .. }) => (
            StatusCode::NOT_FOUND,
            "Event not found or already processed\n",
        )
            .into_response(),
        Err(GatewayError::AlreadySignaled { .. }) => {
            (StatusCode::CONFLICT, "Event already processed\n").into_response()
        },
        Err(e) => {
            error!(error = %e, "unexpected gateway error");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error\n").into_response()
        },
    }
}

async fn rekey(State(state): State<SharedState>) -> Response {
    match state.worker.rotate_key().await {
        Ok((old_public_key, new_public_key)) => {
            info!(
                old_key = %old_public_key,
                new_key = %new_public_key,
                "key rotation successful"
            );
            Json(json!({
                "old_public_key": old_public_key,
                "new_public_key": new_public_key,
            }))
            .into_response()
        },
        Err(e) => {
            error!(error = %e, "key rotation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to rotate key: {e}\n"),
            )
                .into_response()
        },
    }
}
