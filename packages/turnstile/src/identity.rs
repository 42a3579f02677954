//! Caller identity and quota tier resolution.
//!
//! Every request resolves to a [`Caller`]: a quota tier plus the uid its rate
//! limit windows are keyed by. Resolution has exactly two branches:
//!
//! - A verified bearer token resolves to [`RequestTier::Normal`], keyed by
//!   the token subject.
//! - Otherwise the caller is anonymous: [`RequestTier::Throttled`], keyed by
//!   a device fingerprint built from the client IP, `User-Agent` and
//!   `X-Device-Fingerprint` headers.
//!
//! Separately, the `anon_id` cookie classifies the client as new or
//! returning for telemetry; see [`ClientIdentity`]. It never affects the
//! rate limit key.

use std::net::SocketAddr;

use axum::{
    extract::ConnectInfo,
    http::{
        HeaderMap, Request,
        header::{AUTHORIZATION, USER_AGENT},
        request::Parts,
    },
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use derive_more::{Debug, Display, Error, From};
use serde::Serialize;
use tower_governor::key_extractor::{KeyExtractor, SmartIpKeyExtractor};
use tracing::debug;

use crate::{
    auth::{BearerToken, Claims, TokenError, TokenVerifier},
    crypto::{Fingerprint, generate_anon_id, token_digest},
};

/// Name of the anonymous session cookie.
pub const ANON_COOKIE: &str = "anon_id";

/// Header carrying the client-supplied device fingerprint.
pub const DEVICE_FINGERPRINT_HEADER: &str = "x-device-fingerprint";

const ANON_COOKIE_MAX_AGE: time::Duration = time::Duration::hours(1);
const ANON_ID_MAX_LEN: usize = 64;

/// Errors produced while resolving who a caller is.
#[derive(Clone, Debug, Display, Error, From, PartialEq, Eq)]
pub enum IdentityError {
    /// Token-based authentication was required or attempted and failed.
    #[display("{_0}")]
    Token(TokenError),

    /// An anonymous caller did not send the headers needed to fingerprint it.
    #[display("cannot fingerprint anonymous caller: missing {_0} header")]
    #[from(ignore)]
    FingerprintUnavailable(#[error(not(source))] &'static str),

    /// Request-scoped identity was read before the admission pipeline set it.
    #[display("request context missing; admission did not run for this route")]
    #[from(ignore)]
    ContextMissing,
}

/// Quota class a request is charged against.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestTier {
    /// Bearer of a verified token.
    #[display("normal")]
    Normal,

    /// Anonymous, fingerprinted caller.
    #[display("throttled")]
    Throttled,

    /// Aggregate quota shared by every caller.
    #[display("global")]
    Global,

    /// Token issuance; has its own quota regardless of how the caller
    /// authenticated.
    #[display("auth_endpoint")]
    AuthEndpoint,
}

/// Whether a route requires a verified token or tolerates anonymous callers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AuthMode {
    /// A missing or invalid token rejects the request.
    Required,

    /// A missing or invalid token falls back to anonymous resolution.
    Optional,
}

/// How a client was classified by its `anon_id` cookie.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientClass {
    /// No cookie was present; a fresh id was minted.
    #[display("new")]
    New,

    /// A well-formed cookie was present.
    #[display("returning")]
    Returning,

    /// A cookie was present but unusable; a fresh id replaced it.
    #[display("fallback")]
    Fallback,
}

/// Anonymous session identity, carried by the `anon_id` cookie.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClientIdentity {
    pub id: String,
    pub class: ClientClass,
}

impl ClientIdentity {
    /// Read the `anon_id` cookie, minting a fresh id if it is absent or
    /// unusable.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let jar = CookieJar::from_headers(headers);
        match jar.get(ANON_COOKIE).map(|cookie| cookie.value()) {
            Some(id) if is_valid_anon_id(id) => Self {
                id: String::from(id),
                class: ClientClass::Returning,
            },
            Some(_) => Self {
                id: generate_anon_id(),
                class: ClientClass::Fallback,
            },
            None => Self {
                id: generate_anon_id(),
                class: ClientClass::New,
            },
        }
    }

    /// Whether the id was minted for this request and needs to be sent back.
    pub fn is_minted(&self) -> bool {
        !matches!(self.class, ClientClass::Returning)
    }

    /// The cookie to set on the response, if the id was minted.
    ///
    /// The cookie is HTTP-only, secure, scoped to the root path, and lives
    /// for one hour.
    pub fn cookie(&self) -> Option<Cookie<'static>> {
        self.is_minted().then(|| {
            Cookie::build((ANON_COOKIE, self.id.clone()))
                .path("/")
                .max_age(ANON_COOKIE_MAX_AGE)
                .http_only(true)
                .secure(true)
                .same_site(SameSite::Lax)
                .build()
        })
    }
}

fn is_valid_anon_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= ANON_ID_MAX_LEN
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// The resolved caller for a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Caller {
    /// Quota class for the caller's general API traffic.
    pub tier: RequestTier,

    /// Identifier the caller's rate limit windows are keyed by.
    pub uid: String,

    /// Verified claims, present only for [`RequestTier::Normal`].
    pub claims: Option<Claims>,
}

impl Caller {
    /// A caller authenticated by a verified token.
    ///
    /// Tokens without a subject are keyed by a digest of the token itself so
    /// that distinct bearers never share a quota.
    pub fn authenticated(token: &BearerToken, claims: Claims) -> Self {
        let uid = match claims.subject() {
            Some(subject) => String::from(subject),
            None => token_digest(token),
        };
        Self {
            tier: RequestTier::Normal,
            uid,
            claims: Some(claims),
        }
    }

    /// An anonymous caller identified by its device fingerprint.
    pub fn anonymous(fingerprint: Fingerprint) -> Self {
        Self {
            tier: RequestTier::Throttled,
            uid: fingerprint.into_string(),
            claims: None,
        }
    }
}

/// Resolves callers from request headers.
#[derive(Clone, Debug)]
pub struct IdentityResolver {
    verifier: TokenVerifier,
}

impl IdentityResolver {
    pub fn new(verifier: TokenVerifier) -> Self {
        Self { verifier }
    }

    /// Resolve the caller for a request.
    ///
    /// The token branch and the anonymous branch are mutually exclusive: a
    /// request that presents an `Authorization` header is resolved from the
    /// token, and only falls back to the anonymous branch in
    /// [`AuthMode::Optional`].
    pub fn resolve(&self, parts: &Parts, mode: AuthMode) -> Result<Caller, IdentityError> {
        match (self.authenticate(parts), mode) {
            (Ok(caller), _) => Ok(caller),
            (Err(err), AuthMode::Required) => Err(IdentityError::Token(err)),
            (Err(err), AuthMode::Optional) => {
                debug!(reason = %err, "identity.anonymous_fallback");
                fingerprint(&parts.headers, peer_addr(parts)).map(Caller::anonymous)
            }
        }
    }

    fn authenticate(&self, parts: &Parts) -> Result<Caller, TokenError> {
        let (token, claims) = self.verifier.verify_header(parts.headers.get(AUTHORIZATION))?;
        Ok(Caller::authenticated(&token, claims))
    }
}

/// Fingerprint an anonymous caller.
///
/// Both `User-Agent` and `X-Device-Fingerprint` must be present: a caller
/// that cannot be fingerprinted cannot be fairly rate limited.
pub fn fingerprint(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
) -> Result<Fingerprint, IdentityError> {
    let user_agent = header_str(headers, USER_AGENT.as_str())
        .ok_or(IdentityError::FingerprintUnavailable("User-Agent"))?;
    let device = header_str(headers, DEVICE_FINGERPRINT_HEADER)
        .ok_or(IdentityError::FingerprintUnavailable("X-Device-Fingerprint"))?;
    let ip = client_ip(headers, peer);
    Ok(Fingerprint::new(&ip, user_agent, device))
}

/// Determine the client IP.
///
/// Uses the same precedence as the reverse-proxy aware key extractor of
/// `tower_governor`: the first parsable `X-Forwarded-For` entry, then
/// `X-Real-IP`, then the RFC 7239 `Forwarded` header, then the peer address
/// of the connection. Returns an empty string if none are available.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let mut request = Request::new(());
    *request.headers_mut() = headers.clone();
    if let Some(peer) = peer {
        request.extensions_mut().insert(ConnectInfo(peer));
    }
    SmartIpKeyExtractor
        .extract(&request)
        .map(|ip| ip.to_string())
        .unwrap_or_default()
}

fn peer_addr(parts: &Parts) -> Option<SocketAddr> {
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
