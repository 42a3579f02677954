use pretty_assertions::assert_eq as pretty_assert_eq;
use test_strategy::proptest;
use time::OffsetDateTime;
use turnstile::auth::{AUDIENCE, TOKEN_LIFETIME, TokenIssuer, TokenVerifier};

use crate::keypair;

#[proptest]
fn issued_tokens_verify_before_expiry(
    #[strategy("[a-zA-Z0-9@._-]{0,32}")] subject: String,
    #[strategy(0i64..(TOKEN_LIFETIME.whole_seconds()))] elapsed: i64,
) {
    let keypair = keypair();
    let issuer = TokenIssuer::new(keypair.signing);
    let verifier = TokenVerifier::new(keypair.verifying);

    let issued = OffsetDateTime::from_unix_timestamp(1_700_000_000).expect("timestamp");
    let token = issuer.issue_at(Some(&subject), issued).expect("issue");
    let claims = verifier
        .verify_at(&token, issued + time::Duration::seconds(elapsed))
        .expect("verify");

    let expected = Some(subject.as_str()).filter(|s| !s.is_empty());
    pretty_assert_eq!(claims.subject(), expected);
    pretty_assert_eq!(claims.aud, AUDIENCE);
    pretty_assert_eq!(claims.issued_at(), issued);
    pretty_assert_eq!(claims.expires_at(), issued + TOKEN_LIFETIME);
}

#[test_log::test]
fn tokens_from_other_keys_are_rejected() {
    let issuer = TokenIssuer::new(keypair().signing);
    let other = turnstile::keys::EncodedKeypair::generate()
        .and_then(|generated| generated.decode())
        .expect("generate keypair");
    let verifier = TokenVerifier::new(other.verifying);

    let token = issuer.issue(Some("alice")).expect("issue");
    assert!(verifier.verify(&token).is_err());
}
