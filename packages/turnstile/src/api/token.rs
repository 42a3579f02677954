//! Token issuance.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use serde::Serialize;
use tracing::{error, info};

use crate::{
    admission::{ErrorBody, RequestContext},
    api::AppState,
    auth::BearerToken,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/token", get(issue))
}

#[derive(Debug, Serialize)]
pub struct TokenBody {
    pub token: BearerToken,
}

/// Issue a token.
///
/// Tokens issued here are not tied to an account: they carry no subject and
/// expire after fifteen minutes.
///
/// ## Endpoint
/// ```text
/// GET /token
/// User-Agent: <agent>
/// X-Device-Fingerprint: <fingerprint>
/// ```
///
/// ## Responses
/// - 200: `{"token": "<jwt>"}`
/// - 403: Caller could not be fingerprinted
/// - 429: Issuance quota exhausted
/// - 500: Signing failed or the rate limit store is unavailable
#[tracing::instrument(skip(state, context), fields(tier = %context.tier))]
pub async fn issue(State(state): State<AppState>, context: RequestContext) -> IssueResponse {
    match state.issuer.issue(None) {
        Ok(token) => {
            info!(uid = %context.uid, "token.issue.success");
            IssueResponse::Success(TokenBody { token })
        }
        Err(err) => {
            error!(?err, "token.issue.error");
            IssueResponse::Error
        }
    }
}

#[derive(Debug)]
pub enum IssueResponse {
    Success(TokenBody),

    /// Signing failed; the cause is logged, not returned.
    Error,
}

impl IntoResponse for IssueResponse {
    fn into_response(self) -> axum::response::Response {
        match self {
            IssueResponse::Success(body) => (StatusCode::OK, Json(body)).into_response(),
            IssueResponse::Error => {
                (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorBody::internal())).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use pretty_assertions::assert_eq as pretty_assert_eq;
    use serde_json::{Value, json};

    use super::*;

    #[tokio::test]
    async fn signing_failure_hides_cause() {
        let response = IssueResponse::Error.into_response();
        pretty_assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        pretty_assert_eq!(
            response
                .headers()
                .get(axum::http::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok()),
            Some("application/json")
        );

        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        let body = serde_json::from_slice::<Value>(&body).expect("json body");
        pretty_assert_eq!(body, json!({"error": "internal server error"}));
    }
}
