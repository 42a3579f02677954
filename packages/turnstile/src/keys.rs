//! Signing keypair decoding.
//!
//! Keys arrive from configuration as base64-encoded PEM text. Configuration
//! transports sometimes escape newlines, so literal `\n` sequences are
//! normalized to real newlines before the PEM framing is parsed.
//!
//! Tokens are signed exclusively with ES256 (ECDSA over P-256 with SHA-256),
//! so both halves of the keypair must be P-256 keys:
//! - The private key may be SEC1 (`EC PRIVATE KEY`) or PKCS#8 (`PRIVATE KEY`).
//! - The public key must be PKIX (`PUBLIC KEY`) with the EC algorithm OID.
//!
//! Decoding happens once at startup; the resulting keys are immutable and
//! shared read-only across request tasks.

use base64::{Engine, engine::general_purpose::STANDARD};
use derive_more::{Debug, Display, Error};
use jsonwebtoken::{DecodingKey, EncodingKey};
use p256::{
    PublicKey, SecretKey,
    elliptic_curve::{self, sec1::ToEncodedPoint},
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding},
};
use spki::SubjectPublicKeyInfoRef;

const LABEL_SEC1: &str = "EC PRIVATE KEY";
const LABEL_PKCS8: &str = "PRIVATE KEY";
const LABEL_PKIX: &str = "PUBLIC KEY";

/// Errors produced while decoding key material.
///
/// All of these are fatal at startup: the service must not accept traffic
/// with key material it cannot use.
#[derive(Clone, Debug, Display, Error, PartialEq, Eq)]
pub enum KeyError {
    /// The configured value is not valid base64 (or not UTF-8 once decoded).
    #[display("decode key material: {_0}")]
    Decode(#[error(not(source))] String),

    /// The decoded text has no usable PEM framing.
    #[display("key material has no PEM framing: {_0}")]
    Format(#[error(not(source))] String),

    /// The PEM payload does not parse as the expected key type.
    #[display("parse {expected}: {reason}")]
    Parse {
        expected: &'static str,
        reason: String,
    },

    /// The public key parsed, but it is not an elliptic-curve key.
    #[display("public key is not an elliptic-curve key (algorithm {_0})")]
    TypeMismatch(#[error(not(source))] String),

    /// A freshly generated key could not be encoded.
    #[display("encode generated key: {_0}")]
    Encode(#[error(not(source))] String),
}

/// The private half of the keypair, used only by the token issuer.
#[derive(Clone, Debug)]
#[debug("SigningKey(..)")]
pub struct SigningKey(EncodingKey);

impl SigningKey {
    /// Decode a base64-encoded PEM EC private key.
    pub fn decode(encoded: &str) -> Result<Self, KeyError> {
        let (label, der) = decode_pem(encoded)?;
        let secret = match label.as_str() {
            LABEL_SEC1 => SecretKey::from_sec1_der(&der).map_err(|err| KeyError::Parse {
                expected: "SEC1 EC private key",
                reason: err.to_string(),
            })?,
            LABEL_PKCS8 => SecretKey::from_pkcs8_der(&der).map_err(|err| KeyError::Parse {
                expected: "PKCS#8 EC private key",
                reason: err.to_string(),
            })?,
            other => {
                return Err(KeyError::Parse {
                    expected: "EC private key",
                    reason: format!("unexpected PEM label {other:?}"),
                });
            }
        };

        // The signer only accepts PKCS#8, so SEC1 keys are re-encoded here.
        let pkcs8 = secret.to_pkcs8_der().map_err(|err| KeyError::Parse {
            expected: "EC private key",
            reason: err.to_string(),
        })?;
        Ok(Self(EncodingKey::from_ec_der(pkcs8.as_bytes())))
    }

    pub(crate) fn as_encoding_key(&self) -> &EncodingKey {
        &self.0
    }
}

/// The public half of the keypair, used only by the token verifier.
#[derive(Clone, Debug)]
#[debug("VerifyingKey(..)")]
pub struct VerifyingKey(DecodingKey);

impl VerifyingKey {
    /// Decode a base64-encoded PEM PKIX public key, asserting it is an EC key.
    pub fn decode(encoded: &str) -> Result<Self, KeyError> {
        let (label, der) = decode_pem(encoded)?;
        if label != LABEL_PKIX {
            return Err(KeyError::Parse {
                expected: "PKIX public key",
                reason: format!("unexpected PEM label {label:?}"),
            });
        }

        let info = SubjectPublicKeyInfoRef::try_from(der.as_slice()).map_err(|err| {
            KeyError::Parse {
                expected: "PKIX public key",
                reason: err.to_string(),
            }
        })?;
        if info.algorithm.oid != elliptic_curve::ALGORITHM_OID {
            return Err(KeyError::TypeMismatch(info.algorithm.oid.to_string()));
        }

        let public = PublicKey::from_public_key_der(&der).map_err(|err| KeyError::Parse {
            expected: "P-256 public key",
            reason: err.to_string(),
        })?;

        // The verifier expects the raw uncompressed point, not the SPKI wrapper.
        let point = public.to_encoded_point(false);
        Ok(Self(DecodingKey::from_ec_der(point.as_bytes())))
    }

    pub(crate) fn as_decoding_key(&self) -> &DecodingKey {
        &self.0
    }
}

/// Both halves of the signing keypair, decoded once per process.
#[derive(Clone, Debug)]
pub struct Keypair {
    pub signing: SigningKey,
    pub verifying: VerifyingKey,
}

impl Keypair {
    /// Decode the keypair from its configured base64-encoded PEM forms.
    pub fn decode(private: &str, public: &str) -> Result<Self, KeyError> {
        Ok(Self {
            signing: SigningKey::decode(private)?,
            verifying: VerifyingKey::decode(public)?,
        })
    }
}

/// A freshly generated keypair in the same encoding the service reads from
/// its configuration.
#[derive(Clone, Debug)]
pub struct EncodedKeypair {
    #[debug(skip)]
    pub private: String,
    pub public: String,
}

impl EncodedKeypair {
    /// Generate a new random P-256 keypair.
    ///
    /// The private key is emitted as SEC1 PEM and the public key as PKIX PEM,
    /// each base64-encoded.
    pub fn generate() -> Result<Self, KeyError> {
        let secret = SecretKey::random(&mut rand::rngs::OsRng);
        let private = secret
            .to_sec1_pem(LineEnding::LF)
            .map_err(|err| KeyError::Encode(err.to_string()))?;
        let public = secret
            .public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|err| KeyError::Encode(err.to_string()))?;
        Ok(Self {
            private: STANDARD.encode(private.as_bytes()),
            public: STANDARD.encode(public.as_bytes()),
        })
    }

    /// Decode this keypair for use by the issuer and verifier.
    pub fn decode(&self) -> Result<Keypair, KeyError> {
        Keypair::decode(&self.private, &self.public)
    }
}

/// Decode base64 text into a PEM label and its DER payload.
fn decode_pem(encoded: &str) -> Result<(String, Vec<u8>), KeyError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|err| KeyError::Decode(err.to_string()))?;
    let text = String::from_utf8(bytes).map_err(|err| KeyError::Decode(err.to_string()))?;
    let text = text.replace("\\n", "\n");
    let text = text.trim();
    if !text.starts_with("-----BEGIN ") {
        return Err(KeyError::Format(String::from("missing BEGIN boundary")));
    }
    let text = format!("{text}\n");

    let (label, der) = pem_rfc7468::decode_vec(text.as_bytes())
        .map_err(|err| KeyError::Format(err.to_string()))?;
    Ok((label.to_string(), der))
}
