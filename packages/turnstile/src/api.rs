//! HTTP surface.
//!
//! ## Admission
//!
//! Routes are grouped by [`RoutePolicy`] and each group is wrapped in the
//! [`gate`](admission::gate) middleware via `route_layer`, so admission only
//! runs for requests that matched a route. Handlers extract
//! [`RequestContext`](crate::admission::RequestContext) to read the resolved
//! caller.
//!
//! `/health` is not admitted: load balancers must be able to probe it
//! without a fingerprint or token.
//!
//! ## Response types
//!
//! Handlers return a response enum implementing
//! [`IntoResponse`](axum::response::IntoResponse), one variant per outcome,
//! so that each endpoint's possible responses are visible in one place.

use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    body::Body,
    http::Request,
    middleware::from_fn_with_state,
    routing::get,
};
use tower::ServiceBuilder;
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::Span;

use crate::{
    admission::{self, Admission, FailMode, Gate, RoutePolicy},
    auth::{TokenIssuer, TokenVerifier},
    identity::IdentityResolver,
    keys::Keypair,
    rate_limit::{Limits, RateLimiter},
    store::Store,
};

pub mod auth;
pub mod health;
pub mod token;
pub mod v1;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_BODY_SIZE: usize = 1024 * 1024;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Dependencies shared by every handler. Built once at startup and never
/// mutated.
#[derive(Clone, Debug)]
pub struct AppState {
    pub issuer: TokenIssuer,
    pub store: Store,
    pub admission: Arc<Admission>,
}

impl AppState {
    /// Wire the keypair and store into the issuer and admission pipeline.
    pub fn new(
        keypair: Keypair,
        store: Store,
        limits: Limits,
        fail_mode: FailMode,
        store_timeout: Duration,
    ) -> Self {
        let resolver = IdentityResolver::new(TokenVerifier::new(keypair.verifying));
        let limiter = RateLimiter::new(store.clone(), store_timeout);
        Self {
            issuer: TokenIssuer::new(keypair.signing),
            store,
            admission: Arc::new(Admission::new(resolver, limiter, limits, fail_mode)),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    let shared = &state.admission;
    let issuance = gated(token::router(), shared, RoutePolicy::TOKEN_ISSUANCE);
    let protected = gated(auth::router(), shared, RoutePolicy::PROTECTED);
    let optional = gated(v1::router(), shared, RoutePolicy::OPTIONAL);

    Router::new()
        .route("/health", get(health::handle))
        .merge(issuance)
        .merge(protected)
        .nest("/api/v1", optional)
        .layer(middleware)
        .with_state(state)
}

fn gated(
    router: Router<AppState>,
    shared: &Arc<Admission>,
    policy: RoutePolicy,
) -> Router<AppState> {
    let gate = Gate::new(Arc::clone(shared), policy);
    router.route_layer(from_fn_with_state(gate, admission::gate))
}

fn request_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    tracing::info_span!(
        "request",
        method = %request.method(),
        path = %request.uri().path(),
        request_id,
    )
}
