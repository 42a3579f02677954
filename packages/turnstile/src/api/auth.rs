use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use serde::Serialize;
use tracing::info;

use crate::{admission::RequestContext, api::AppState};

pub fn router() -> Router<AppState> {
    Router::new().route("/auth/test", get(handle))
}

#[derive(Debug, Serialize)]
pub struct Message {
    pub msg: &'static str,
}

/// Confirms that the caller presented a valid token.
///
/// ## Responses
/// - 200: `{"msg": "you're in"}`
/// - 401: Missing, malformed, invalid, or expired token
/// - 429: App quota exhausted
#[tracing::instrument(skip(context))]
pub async fn handle(context: RequestContext) -> AuthTestResponse {
    info!(uid = %context.uid, "auth.test.success");
    AuthTestResponse::Success
}

#[derive(Debug)]
pub enum AuthTestResponse {
    Success,
}

impl IntoResponse for AuthTestResponse {
    fn into_response(self) -> axum::response::Response {
        match self {
            AuthTestResponse::Success => {
                (StatusCode::OK, Json(Message { msg: "you're in" })).into_response()
            }
        }
    }
}
