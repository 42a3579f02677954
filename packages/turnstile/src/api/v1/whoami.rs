//! Reports how the caller was identified.
//!
//! Callers with a valid token are reported at the `normal` tier keyed by
//! their subject; everyone else is reported at the `throttled` tier keyed by
//! their device fingerprint.

use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::info;

use crate::{
    admission::RequestContext,
    identity::{ClientIdentity, RequestTier},
};

#[derive(Debug, Serialize)]
pub struct WhoAmI {
    pub tier: RequestTier,
    pub uid: String,
    pub client: ClientIdentity,

    /// When the caller's token expires; absent for anonymous callers.
    #[serde(with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub token_expires_at: Option<OffsetDateTime>,
}

/// ## Endpoint
/// ```text
/// GET /api/v1/whoami
/// Authorization: Bearer <token>        (optional)
/// User-Agent: <agent>                  (required without a valid token)
/// X-Device-Fingerprint: <fingerprint>  (required without a valid token)
/// ```
#[tracing::instrument(skip(context))]
pub async fn handle(context: RequestContext) -> WhoAmIResponse {
    info!(tier = %context.tier, "whoami.get.success");
    WhoAmIResponse::Success(WhoAmI {
        tier: context.tier,
        token_expires_at: context.claims.as_ref().map(|claims| claims.expires_at()),
        uid: context.uid,
        client: context.client,
    })
}

#[derive(Debug)]
pub enum WhoAmIResponse {
    Success(WhoAmI),
}

impl IntoResponse for WhoAmIResponse {
    fn into_response(self) -> axum::response::Response {
        match self {
            WhoAmIResponse::Success(body) => (StatusCode::OK, Json(body)).into_response(),
        }
    }
}
