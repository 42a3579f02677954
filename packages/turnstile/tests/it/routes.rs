use axum::http::{
    HeaderName, HeaderValue, StatusCode,
    header::{AUTHORIZATION, COOKIE, RETRY_AFTER, SET_COOKIE, USER_AGENT as USER_AGENT_HEADER},
};
use axum_test::{TestRequest, TestServer};
use pretty_assertions::assert_eq as pretty_assert_eq;
use serde_json::{Value, json};
use turnstile::{crypto::Fingerprint, identity::DEVICE_FINGERPRINT_HEADER, rate_limit::Limits};

use crate::{DEVICE, LIMITS, USER_AGENT, server};

const CLIENT_IP: &str = "203.0.113.7";

fn fingerprinted(request: TestRequest) -> TestRequest {
    request
        .add_header(USER_AGENT_HEADER, HeaderValue::from_static(USER_AGENT))
        .add_header(
            HeaderName::from_static(DEVICE_FINGERPRINT_HEADER),
            HeaderValue::from_static(DEVICE),
        )
        .add_header(
            HeaderName::from_static("x-forwarded-for"),
            HeaderValue::from_static(CLIENT_IP),
        )
}

fn bearer(token: &str) -> HeaderValue {
    HeaderValue::from_str(&format!("Bearer {token}")).expect("header value")
}

async fn issue_token(server: &TestServer) -> String {
    let response = fingerprinted(server.get("/token")).await;
    pretty_assert_eq!(response.status_code(), StatusCode::OK);
    let body = response.json::<Value>();
    body["token"].as_str().expect("token string").to_string()
}

#[test_log::test(tokio::test)]
async fn health_is_not_admitted() {
    let (server, _) = server(LIMITS);
    let response = server.get("/health").await;
    pretty_assert_eq!(response.status_code(), StatusCode::OK);
    assert!(response.headers().get(SET_COOKIE).is_none());
}

#[test_log::test(tokio::test)]
async fn issues_token_to_fingerprinted_caller() {
    let (server, _) = server(LIMITS);
    let response = fingerprinted(server.get("/token")).await;
    pretty_assert_eq!(response.status_code(), StatusCode::OK);

    let token = response.json::<Value>()["token"]
        .as_str()
        .map(turnstile::auth::BearerToken::new)
        .expect("token string");
    let verifier = turnstile::auth::TokenVerifier::new(crate::keypair().verifying);
    let claims = verifier.verify(&token).expect("issued token verifies");
    pretty_assert_eq!(claims.subject(), None);
}

#[test_log::test(tokio::test)]
async fn sets_anon_cookie_on_first_visit() {
    let (server, _) = server(LIMITS);
    let response = fingerprinted(server.get("/api/v1/whoami")).await;
    pretty_assert_eq!(response.status_code(), StatusCode::OK);

    let cookie = response
        .headers()
        .get(SET_COOKIE)
        .and_then(|value| value.to_str().ok())
        .expect("set-cookie header")
        .to_string();
    assert!(cookie.starts_with("anon_id="), "{cookie}");
    for attribute in ["HttpOnly", "Secure", "Path=/", "Max-Age=3600"] {
        assert!(cookie.contains(attribute), "missing {attribute}: {cookie}");
    }

    let body = response.json::<Value>();
    pretty_assert_eq!(body["client"]["class"], json!("new"));
}

#[test_log::test(tokio::test)]
async fn anonymous_caller_is_throttled_by_fingerprint() {
    let (server, _) = server(LIMITS);
    let response = fingerprinted(server.get("/api/v1/whoami")).await;
    pretty_assert_eq!(response.status_code(), StatusCode::OK);

    let body = response.json::<Value>();
    let expected = Fingerprint::new(CLIENT_IP, USER_AGENT, DEVICE).into_string();
    pretty_assert_eq!(body["tier"], json!("throttled"));
    pretty_assert_eq!(body["uid"], json!(expected));
}

#[test_log::test(tokio::test)]
async fn token_takes_precedence_over_cookie() {
    let (server, state) = server(LIMITS);
    let token = state.issuer.issue(Some("alice")).expect("issue");

    let response = fingerprinted(server.get("/api/v1/whoami"))
        .add_header(AUTHORIZATION, bearer(token.expose()))
        .add_header(COOKIE, HeaderValue::from_static("anon_id=returning-visitor"))
        .await;
    pretty_assert_eq!(response.status_code(), StatusCode::OK);

    let body = response.json::<Value>();
    pretty_assert_eq!(body["tier"], json!("normal"));
    pretty_assert_eq!(body["uid"], json!("alice"));
    pretty_assert_eq!(
        body["client"],
        json!({ "id": "returning-visitor", "class": "returning" })
    );
    assert!(response.headers().get(SET_COOKIE).is_none());
}

#[test_log::test(tokio::test)]
async fn protected_route_accepts_issued_token() {
    let (server, _) = server(LIMITS);
    let token = issue_token(&server).await;

    let response = server
        .get("/auth/test")
        .add_header(AUTHORIZATION, bearer(&token))
        .await;
    pretty_assert_eq!(response.status_code(), StatusCode::OK);
    pretty_assert_eq!(response.json::<Value>(), json!({ "msg": "you're in" }));
}

#[test_log::test(tokio::test)]
async fn protected_route_rejects_wrong_scheme() {
    let (server, _) = server(LIMITS);
    let response = fingerprinted(server.get("/auth/test"))
        .add_header(AUTHORIZATION, HeaderValue::from_static("Token abc"))
        .await;
    pretty_assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().get(SET_COOKIE).is_none());
}

#[test_log::test(tokio::test)]
async fn protected_route_rejects_missing_token() {
    let (server, _) = server(LIMITS);
    let response = fingerprinted(server.get("/auth/test")).await;
    pretty_assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
}

#[test_log::test(tokio::test)]
async fn anonymous_without_user_agent_is_forbidden() {
    let (server, _) = server(LIMITS);
    let response = server
        .get("/api/v1/whoami")
        .add_header(
            HeaderName::from_static(DEVICE_FINGERPRINT_HEADER),
            HeaderValue::from_static(DEVICE),
        )
        .await;
    pretty_assert_eq!(response.status_code(), StatusCode::FORBIDDEN);
}

#[test_log::test(tokio::test)]
async fn anonymous_caller_is_rate_limited() {
    let (server, _) = server(LIMITS);
    for _ in 0..LIMITS.throttled {
        let response = fingerprinted(server.get("/api/v1/whoami")).await;
        pretty_assert_eq!(response.status_code(), StatusCode::OK);
    }

    let response = fingerprinted(server.get("/api/v1/whoami")).await;
    pretty_assert_eq!(response.status_code(), StatusCode::TOO_MANY_REQUESTS);
    pretty_assert_eq!(
        response.headers().get(RETRY_AFTER).and_then(|v| v.to_str().ok()),
        Some("60")
    );
}

#[test_log::test(tokio::test)]
async fn token_issuance_has_dedicated_quota() {
    let (server, _) = server(LIMITS);
    for _ in 0..LIMITS.auth {
        issue_token(&server).await;
    }

    let response = fingerprinted(server.get("/token")).await;
    pretty_assert_eq!(response.status_code(), StatusCode::TOO_MANY_REQUESTS);

    // The app quota for the same caller is untouched.
    let response = fingerprinted(server.get("/api/v1/whoami")).await;
    pretty_assert_eq!(response.status_code(), StatusCode::OK);
}

#[test_log::test(tokio::test)]
async fn authenticated_callers_have_independent_quotas() {
    let limits = Limits { normal: 1, ..LIMITS };
    let (server, state) = server(limits);
    let alice = state.issuer.issue(Some("alice")).expect("issue");
    let bob = state.issuer.issue(Some("bob")).expect("issue");

    for token in [&alice, &bob] {
        let response = server
            .get("/auth/test")
            .add_header(AUTHORIZATION, bearer(token.expose()))
            .await;
        pretty_assert_eq!(response.status_code(), StatusCode::OK);
    }

    let response = server
        .get("/auth/test")
        .add_header(AUTHORIZATION, bearer(alice.expose()))
        .await;
    pretty_assert_eq!(response.status_code(), StatusCode::TOO_MANY_REQUESTS);
}

#[test_log::test(tokio::test)]
async fn throttled_requests_do_not_consume_global_quota() {
    let limits = Limits {
        throttled: 1,
        global: 10,
        ..LIMITS
    };
    let (server, state) = server(limits);

    let statuses = whoami_statuses(&server, limits.global).await;
    pretty_assert_eq!(statuses[0], StatusCode::OK);
    assert!(
        statuses[1..].iter().all(|status| *status == StatusCode::TOO_MANY_REQUESTS),
        "{statuses:?}"
    );

    let token = state.issuer.issue(Some("alice")).expect("issue");
    let response = server
        .get("/auth/test")
        .add_header(AUTHORIZATION, bearer(token.expose()))
        .await;
    pretty_assert_eq!(response.status_code(), StatusCode::OK);
}

async fn whoami_statuses(server: &TestServer, count: u64) -> Vec<StatusCode> {
    let mut statuses = Vec::new();
    for _ in 0..count {
        statuses.push(fingerprinted(server.get("/api/v1/whoami")).await.status_code());
    }
    statuses
}

#[test_log::test(tokio::test)]
async fn unknown_routes_skip_admission() {
    let (server, _) = server(LIMITS);
    let response = server.get("/nope").await;
    pretty_assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}
