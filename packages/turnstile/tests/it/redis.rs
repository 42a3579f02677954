//! Window transactions against a live Redis.
//!
//! Set `TURNSTILE_TEST_REDIS_ADDR` (e.g. `127.0.0.1:6379`, plus
//! `TURNSTILE_TEST_REDIS_PASSWORD` if needed) to run these; without it they
//! return early.

use std::time::Duration;

use pretty_assertions::assert_eq as pretty_assert_eq;
use turnstile::{
    rate_limit::{LimitError, LimitKey, Quota, RateLimiter, Scope, now_ms},
    store::{Redis, RedisConfig, Store},
};

const QUOTA: Quota = Quota {
    limit: 5,
    window: Duration::from_secs(60),
};

async fn limiter() -> Option<RateLimiter> {
    let Ok(addr) = std::env::var("TURNSTILE_TEST_REDIS_ADDR") else {
        tracing::warn!("TURNSTILE_TEST_REDIS_ADDR unset; skipping");
        return None;
    };
    let config = RedisConfig {
        addr,
        password: std::env::var("TURNSTILE_TEST_REDIS_PASSWORD").ok(),
        tls: false,
        ca_cert_path: None,
    };
    let redis = Redis::connect(&config).await.expect("connect to redis");
    Some(RateLimiter::new(Store::from(redis), Duration::from_secs(2)))
}

/// A key no other run shares.
fn fresh_key() -> LimitKey {
    LimitKey::new(Scope::App, &format!("it-{}", uuid::Uuid::new_v4()))
}

#[test_log::test(tokio::test)]
async fn concurrent_checks_admit_exactly_limit() {
    let Some(limiter) = limiter().await else {
        return;
    };
    let key = fresh_key();
    let now = now_ms();

    let checks = (0..20)
        .map(|_| {
            let limiter = limiter.clone();
            let key = key.clone();
            tokio::spawn(async move { limiter.check_limit_at(&key, QUOTA, now).await })
        })
        .collect::<Vec<_>>();

    let mut admitted = 0;
    for check in checks {
        match check.await.expect("join") {
            Ok(_) => admitted += 1,
            Err(LimitError::Exceeded { .. }) => {}
            Err(err) => panic!("store error: {err}"),
        }
    }
    pretty_assert_eq!(admitted, QUOTA.limit);
}

#[test_log::test(tokio::test)]
async fn window_slides_and_rejected_hits_are_retracted() {
    let Some(limiter) = limiter().await else {
        return;
    };
    let key = fresh_key();
    let start = now_ms();

    for second in 0..10 {
        let result = limiter
            .check_limit_at(&key, QUOTA, start + second * 1_000)
            .await;
        pretty_assert_eq!(result.is_ok(), second < 5, "request at t={second}s");
    }

    // Admitted hits at 0s and 1s have left the window. Had the rejected hits
    // at 5s..9s been kept, they would still fill it.
    limiter
        .check_limit_at(&key, QUOTA, start + 61_000)
        .await
        .expect("admitted after the window slides");
}
