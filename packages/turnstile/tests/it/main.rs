use std::{sync::LazyLock, time::Duration};

use axum_test::TestServer;
use turnstile::{
    admission::FailMode,
    api::{self, AppState},
    keys::{EncodedKeypair, Keypair},
    rate_limit::Limits,
    store::{Memory, Store},
};

pub mod routes;
pub mod rate_limit;
pub mod redis;
pub mod token;

/// Generated once; decoding is cheap enough to repeat per test.
static ENCODED: LazyLock<EncodedKeypair> =
    LazyLock::new(|| EncodedKeypair::generate().expect("generate keypair"));

pub const USER_AGENT: &str = "turnstile-tests/1.0";
pub const DEVICE: &str = "device-1";

pub const LIMITS: Limits = Limits {
    normal: 10,
    throttled: 5,
    auth: 3,
    global: 1_000,
    window: Duration::from_secs(60),
};

#[track_caller]
pub fn keypair() -> Keypair {
    ENCODED.decode().expect("decode keypair")
}

/// A server backed by a fresh in-memory store.
#[track_caller]
pub fn server(limits: Limits) -> (TestServer, AppState) {
    let state = AppState::new(
        keypair(),
        Store::from(Memory::new()),
        limits,
        FailMode::Closed,
        Duration::from_secs(1),
    );
    let server = TestServer::new(api::router(state.clone())).expect("start test server");
    (server, state)
}
