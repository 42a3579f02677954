use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, Validation, decode, errors::ErrorKind};
use serde::Deserialize;
use time::OffsetDateTime;

use crate::{
    auth::{ALGORITHM, AUDIENCE, BearerToken, Claims, TokenError},
    keys::VerifyingKey,
};

/// Verifies tokens against the public half of the keypair.
///
/// Verification runs on every protected request; results are not cached.
#[derive(Clone, Debug)]
pub struct TokenVerifier {
    key: VerifyingKey,
    validation: Validation,
}

/// The subset of the JOSE header needed to check the declared algorithm
/// before any signature work happens.
#[derive(Deserialize)]
struct DeclaredHeader {
    alg: Option<String>,
}

impl TokenVerifier {
    pub fn new(key: VerifyingKey) -> Self {
        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_audience(&[AUDIENCE]);
        validation.set_required_spec_claims(&["exp", "iat", "aud"]);
        // Expiry is checked against an explicit clock in `verify_at`.
        validation.validate_exp = false;
        Self { key, validation }
    }

    /// Verify a token against the current time.
    pub fn verify(&self, token: &BearerToken) -> Result<Claims, TokenError> {
        self.verify_at(token, OffsetDateTime::now_utc())
    }

    /// Verify a token as if the current time were `now`.
    ///
    /// The declared algorithm is checked first so that unsigned or
    /// symmetric-keyed tokens never reach signature verification.
    pub fn verify_at(&self, token: &BearerToken, now: OffsetDateTime) -> Result<Claims, TokenError> {
        let declared = declared_algorithm(token.expose())?;
        if declared != ALGORITHM {
            return Err(TokenError::AlgorithmMismatch(declared));
        }

        let data = decode::<Claims>(token.expose(), self.key.as_decoding_key(), &self.validation)
            .map_err(|err| match err.kind() {
                ErrorKind::InvalidAlgorithm => TokenError::AlgorithmMismatch(declared.clone()),
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid(err.to_string()),
            })?;

        let claims = data.claims;
        if now.unix_timestamp() > claims.exp {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    /// Extract and verify the bearer token from a raw `Authorization` header.
    pub fn verify_header(
        &self,
        header: Option<&axum::http::HeaderValue>,
    ) -> Result<(BearerToken, Claims), TokenError> {
        let token = BearerToken::from_header(header)?;
        let claims = self.verify(&token)?;
        Ok((token, claims))
    }
}

/// Read the `alg` field from the token's header segment without verifying
/// anything. An absent algorithm reads as `"none"`.
fn declared_algorithm(token: &str) -> Result<String, TokenError> {
    let segment = token
        .split('.')
        .next()
        .filter(|segment| !segment.is_empty())
        .ok_or_else(|| TokenError::Invalid(String::from("missing header segment")))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|err| TokenError::Invalid(format!("decode header: {err}")))?;
    let header = serde_json::from_slice::<DeclaredHeader>(&bytes)
        .map_err(|err| TokenError::Invalid(format!("parse header: {err}")))?;
    Ok(header.alg.unwrap_or_else(|| String::from("none")))
}
