use jsonwebtoken::{Algorithm, Header, encode};
use time::OffsetDateTime;
use tracing::debug;

use crate::{
    auth::{BearerToken, Claims, TokenError},
    keys::SigningKey,
};

/// Issues ES256 tokens signed with the private half of the keypair.
#[derive(Clone, Debug)]
pub struct TokenIssuer {
    key: SigningKey,
}

impl TokenIssuer {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    /// Issue a token valid from now for [`TOKEN_LIFETIME`](crate::auth::TOKEN_LIFETIME).
    ///
    /// Pass a subject only when authenticating a known principal.
    #[tracing::instrument(name = "TokenIssuer::issue", skip(self))]
    pub fn issue(&self, subject: Option<&str>) -> Result<BearerToken, TokenError> {
        self.issue_at(subject, OffsetDateTime::now_utc())
    }

    /// Issue a token as if the current time were `now`.
    pub fn issue_at(
        &self,
        subject: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<BearerToken, TokenError> {
        let claims = Claims::new(now, subject);
        let token = encode(
            &Header::new(Algorithm::ES256),
            &claims,
            self.key.as_encoding_key(),
        )
        .map_err(|err| TokenError::Signing(err.to_string()))?;

        debug!(exp = claims.exp, has_subject = claims.sub.is_some(), "token.issue");
        Ok(BearerToken::new(token))
    }
}
