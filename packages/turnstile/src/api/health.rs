use axum::{extract::State, http::StatusCode, response::IntoResponse};
use color_eyre::eyre::Report;
use tracing::error;

use crate::api::AppState;

/// Health check endpoint.
///
/// ## Validation
///
/// Validates that the rate limit store is reachable before responding.
#[tracing::instrument(skip(state))]
pub async fn handle(State(state): State<AppState>) -> PingResponse {
    match state.store.ping().await {
        Ok(()) => PingResponse::Success,
        Err(err) => {
            error!(?err, "health.store_unreachable");
            PingResponse::Error(err)
        }
    }
}

#[derive(Debug)]
pub enum PingResponse {
    Success,
    Error(Report),
}

impl IntoResponse for PingResponse {
    fn into_response(self) -> axum::response::Response {
        match self {
            PingResponse::Success => StatusCode::OK.into_response(),
            PingResponse::Error(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "rate limit store unreachable").into_response()
            }
        }
    }
}
