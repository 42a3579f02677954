//! Short-lived ES256 tokens.
//!
//! Tokens are JWTs signed with the process keypair (see [`crate::keys`]).
//! They carry a fixed audience, an issued-at and expiry timestamp, and an
//! optional subject. There is no server-side record of issued tokens, so a
//! token cannot be revoked before it expires.

use axum::http::HeaderValue;
use derive_more::{Debug, Display, Error};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

mod issuer;
mod verifier;

pub use issuer::TokenIssuer;
pub use verifier::TokenVerifier;

/// The audience every issued token carries and every verified token must
/// match.
pub const AUDIENCE: &str = "admin-api";

/// How long an issued token stays valid.
pub const TOKEN_LIFETIME: Duration = Duration::minutes(15);

/// The only signature algorithm tokens may declare.
pub const ALGORITHM: &str = "ES256";

/// Errors produced while issuing or verifying tokens.
///
/// Verification errors always reject the request with `401`; none of them are
/// retried.
#[derive(Clone, Debug, Display, Error, PartialEq, Eq)]
pub enum TokenError {
    /// The signing operation itself failed.
    #[display("sign token: {_0}")]
    Signing(#[error(not(source))] String),

    /// The Authorization header is absent or not `Bearer <token>`.
    #[display("authorization header must be of the form 'Bearer <token>'")]
    MalformedHeader,

    /// The token declares an algorithm other than ES256.
    #[display("unexpected signing algorithm: {_0}")]
    AlgorithmMismatch(#[error(not(source))] String),

    /// The token's signature verified, but it has expired.
    #[display("token expired")]
    Expired,

    /// The token failed to parse or its signature or claims did not verify.
    #[display("invalid token: {_0}")]
    Invalid(#[error(not(source))] String),
}

/// The claims carried inside a token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Expiry, seconds since the Unix epoch.
    pub exp: i64,

    /// Issued-at, seconds since the Unix epoch.
    pub iat: i64,

    /// Intended consumer of the token.
    pub aud: String,

    /// The authenticated principal, if the token is tied to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
}

impl Claims {
    /// Build claims for a token issued at `now`.
    pub fn new(now: OffsetDateTime, subject: Option<&str>) -> Self {
        let issued_at = now.unix_timestamp();
        Self {
            iat: issued_at,
            exp: (now + TOKEN_LIFETIME).unix_timestamp(),
            aud: String::from(AUDIENCE),
            sub: subject
                .filter(|subject| !subject.is_empty())
                .map(String::from),
        }
    }

    /// The subject, treating an empty value the same as an absent one.
    pub fn subject(&self) -> Option<&str> {
        self.sub.as_deref().filter(|subject| !subject.is_empty())
    }

    pub fn expires_at(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.exp).unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    pub fn issued_at(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.iat).unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }
}

/// A token as presented by a client or returned by the issuer.
///
/// Holding one of these says nothing about whether it is valid; use
/// [`TokenVerifier::verify`] to get trusted [`Claims`].
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
#[debug("BearerToken(..)")]
#[serde(transparent)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// View the plaintext token.
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    /// Extract the token from a raw `Authorization` header value.
    ///
    /// The header must be exactly `Bearer <token>`; any other scheme, extra
    /// segments, or an empty token is rejected.
    pub fn from_header(header: Option<&HeaderValue>) -> Result<Self, TokenError> {
        let value = header
            .and_then(|value| value.to_str().ok())
            .ok_or(TokenError::MalformedHeader)?;

        match value.split(' ').collect::<Vec<_>>().as_slice() {
            ["Bearer", token] if !token.is_empty() => Ok(Self::new(*token)),
            _ => Err(TokenError::MalformedHeader),
        }
    }
}
