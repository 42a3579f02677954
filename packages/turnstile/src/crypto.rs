//! Hashing and random identifier generation.

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::auth::BearerToken;

/// A stable identifier for an unauthenticated caller.
///
/// Fingerprints are the hex-encoded SHA-256 digest of
/// `client_ip|user_agent|device_fingerprint`. They key the caller's rate
/// limit window, so two requests from the same device and network share a
/// quota even without a cookie.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(client_ip: &str, user_agent: &str, device: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(client_ip.as_bytes());
        hasher.update(b"|");
        hasher.update(user_agent.as_bytes());
        hasher.update(b"|");
        hasher.update(device.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// Digest a bearer token into a quota identifier.
///
/// Used for tokens without a subject so that distinct bearers never share a
/// rate limit key. The plaintext token never leaves this function.
pub fn token_digest(token: &BearerToken) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.expose().as_bytes());
    format!("token:{}", hex::encode(hasher.finalize()))
}

/// Generate an anonymous session id with 128 bits of entropy.
///
/// Returns a 32-character hex string (16 random bytes, hex-encoded).
pub fn generate_anon_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
