use axum::{Router, routing::get};

use crate::api::AppState;

pub mod whoami;

pub fn router() -> Router<AppState> {
    Router::new().route("/whoami", get(whoami::handle))
}
