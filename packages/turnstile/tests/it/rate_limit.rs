use std::time::Duration;

use pretty_assertions::assert_eq as pretty_assert_eq;
use turnstile::{
    rate_limit::{LimitError, LimitKey, Quota, RateLimiter, Scope},
    store::{Memory, Store},
};

const QUOTA: Quota = Quota {
    limit: 5,
    window: Duration::from_secs(60),
};

fn limiter() -> RateLimiter {
    RateLimiter::new(Store::from(Memory::new()), Duration::from_secs(1))
}

#[test_log::test(tokio::test)]
async fn five_per_minute_scenario() {
    let limiter = limiter();
    let key = LimitKey::new(Scope::App, "abc");

    for second in 0..5 {
        limiter
            .check_limit_at(&key, QUOTA, second * 1_000)
            .await
            .unwrap_or_else(|err| panic!("request at t={second}s: {err}"));
    }

    let err = limiter
        .check_limit_at(&key, QUOTA, 5_000)
        .await
        .expect_err("sixth request");
    assert!(matches!(err, LimitError::Exceeded { .. }), "{err:?}");

    limiter
        .check_limit_at(&key, QUOTA, 61_000)
        .await
        .expect("seventh request after the window slides");
}

#[test_log::test(tokio::test)]
async fn window_converges_on_limit_under_sustained_load() {
    let limiter = limiter();
    let key = LimitKey::new(Scope::App, "steady");

    // One request every 100ms for three windows.
    let mut admitted = 0;
    for tick in 0..1_800 {
        if limiter.check_limit_at(&key, QUOTA, tick * 100).await.is_ok() {
            admitted += 1;
        }
    }
    pretty_assert_eq!(admitted, 15);
}

#[test_log::test(tokio::test)]
async fn uids_are_isolated() {
    let limiter = limiter();
    for uid in ["abc", "def"] {
        let key = LimitKey::new(Scope::App, uid);
        for second in 0..5 {
            limiter
                .check_limit_at(&key, QUOTA, second * 1_000)
                .await
                .unwrap_or_else(|err| panic!("{uid} at t={second}s: {err}"));
        }
    }
}
