//! Key fetching, caching and signature verification modes.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use serde_json::json;
use tokenward_auth::asn1::{pem_to_der, subject_public_key_info};
use tokenward_auth::{
    AuthErrorCode, Clock, Error, FixedClock, KeyResolver, KeySet, KeySource, PublicKeyCache,
    SignatureVerifier, TokenVerifier, TokenVerifierConfig, VerifyOptions, rsa_key_from_spki,
};

const FIXED_MESSAGE: &[u8] = b"tokenward fixed message";
const FIXED_SIGNATURE: &str = "N7DmGMQ_ay_eDI1VWhZWZHt5hBhRZIBJpgtrZvKC47RJU54elwMy_NRKldJbyGpH0RaSIqT9Vh0aMSAHUSsyhr4Io6Wbexs5mf3hlhOBgzk9JoqvDqmq27cU7n0_dh86hL1ellgVimgEGl2t3NTKdKZBj0UPksQQvFn0TwNTkmBq-15m2Pm_RbFgOiD9I5jlafyJXRJ0oonTGPzHL_PVutnMJr6QpJ7qgVWdB0-_OaLZPqBp_ySpsweoltjV9C_c6mqOytwleAqvTSNJ7nYF2uW4CqhfqsmFLRL-doC4gvbTryqGS-1pHjiiN3sV_0jF-6r1l2qL3gnayviQzZsn_Q";

fn resolver(source: KeySource, clock: Arc<FixedClock>) -> KeyResolver {
    KeyResolver::new(
        source,
        Arc::new(PublicKeyCache::new(clock)),
        reqwest::Client::new(),
    )
}

fn verifier(signature: SignatureVerifier, require_kid: bool) -> TokenVerifier {
    let mut config = TokenVerifierConfig::id_token(PROJECT);
    config.require_kid = require_kid;
    TokenVerifier::new(config, signature, Arc::new(FixedClock::new(NOW * 1000)))
}

#[tokio::test]
async fn key_cache_honours_max_age() {
    let idp = MockIdentityProvider::start().await;
    idp.mock_jwks(Some(60), 2).await;
    let resolver = resolver(KeySource::Jwks(format!("{}/jwks", idp.uri())), idp.clock.clone());

    let first = resolver.fetch_keys().await.unwrap();
    assert_eq!(first.keys.len(), 2);
    assert_eq!(first.expires_at_ms, idp.clock.now_ms() + 60_000);

    resolver.fetch_keys().await.unwrap();
    idp.clock.advance(Duration::from_secs(61));
    resolver.fetch_keys().await.unwrap();
}

#[tokio::test]
async fn missing_cache_control_is_always_stale() {
    let idp = MockIdentityProvider::start().await;
    idp.mock_jwks(None, 2).await;
    let resolver = resolver(KeySource::Jwks(format!("{}/jwks", idp.uri())), idp.clock.clone());

    assert_eq!(resolver.fetch_keys().await.unwrap().expires_at_ms, 0);
    resolver.fetch_keys().await.unwrap();
}

#[tokio::test]
async fn fetch_failure_is_operational() {
    let idp = MockIdentityProvider::start().await;
    let resolver = resolver(KeySource::Jwks(format!("{}/missing", idp.uri())), idp.clock.clone());

    let err = resolver.fetch_keys().await.unwrap_err();
    assert!(matches!(err, Error::Keys(_)));
    assert!(err.auth_code().is_none());
}

#[tokio::test]
async fn verifies_against_x509_certificates() {
    let idp = MockIdentityProvider::start().await;
    idp.mock_x509(json!({ "key-1": SIGNING_CERT, "key-2": OTHER_CERT })).await;
    let v = verifier(
        SignatureVerifier::PublicKey(resolver(
            KeySource::X509(format!("{}/x509", idp.uri())),
            idp.clock.clone(),
        )),
        true,
    );

    let decoded = v
        .verify(&id_token("user-1", 600), &VerifyOptions::default())
        .await
        .unwrap();
    assert_eq!(decoded.uid, "user-1");

    let wrong_key = sign(OTHER_KEY, Some("key-1"), &id_claims("user-1", 600));
    let err = v.verify(&wrong_key, &VerifyOptions::default()).await.unwrap_err();
    assert!(err.is_auth_code(AuthErrorCode::InvalidSignature));
}

fn fan_out(keys: KeySet) -> TokenVerifier {
    verifier(
        SignatureVerifier::PublicKey(resolver(
            KeySource::Static(Arc::new(keys)),
            Arc::new(FixedClock::new(NOW * 1000)),
        )),
        false,
    )
}

fn only_other_key() -> KeySet {
    let mut jwks: serde_json::Value = serde_json::from_str(JWKS).unwrap();
    jwks["keys"]
        .as_array_mut()
        .unwrap()
        .retain(|k| k["kid"] == "key-2");
    KeySet::from_jwks_json(&jwks.to_string()).unwrap()
}

#[tokio::test]
async fn fan_out_accepts_any_matching_key() {
    let v = fan_out(KeySet::from_jwks_json(JWKS).unwrap());
    let token = sign(SIGNING_KEY, None, &id_claims("user-1", 600));
    assert!(v.verify(&token, &VerifyOptions::default()).await.is_ok());
}

#[tokio::test]
async fn fan_out_reports_expiry_not_signature() {
    let v = fan_out(KeySet::from_jwks_json(JWKS).unwrap());
    let expired = sign(SIGNING_KEY, None, &id_claims("user-1", -1));
    let err = v.verify(&expired, &VerifyOptions::default()).await.unwrap_err();
    assert!(err.is_auth_code(AuthErrorCode::TokenExpired));
}

#[tokio::test]
async fn fan_out_without_match_is_invalid_signature() {
    let v = fan_out(only_other_key());
    let token = sign(SIGNING_KEY, None, &id_claims("user-1", 600));

    let err = v.verify(&token, &VerifyOptions::default()).await.unwrap_err();
    assert!(err.is_auth_code(AuthErrorCode::InvalidSignature));

    let opts = VerifyOptions {
        unsafe_expire_on_invalid_kid: true,
        ..VerifyOptions::default()
    };
    let err = v.verify(&token, &opts).await.unwrap_err();
    assert!(err.is_auth_code(AuthErrorCode::TokenExpired));
}

#[test]
fn certificate_key_verifies_known_signature() {
    let der = pem_to_der(SIGNING_CERT).unwrap();
    let info = subject_public_key_info(&der).unwrap();
    assert_eq!(info.algorithm, "1.2.840.113549.1.1.1");

    let key = rsa_key_from_spki(&info.spki).unwrap();
    assert!(
        jsonwebtoken::crypto::verify(
            FIXED_SIGNATURE,
            FIXED_MESSAGE,
            &key,
            jsonwebtoken::Algorithm::RS256
        )
        .unwrap()
    );

    let other = subject_public_key_info(&pem_to_der(OTHER_CERT).unwrap()).unwrap();
    let other_key = rsa_key_from_spki(&other.spki).unwrap();
    assert!(
        !jsonwebtoken::crypto::verify(
            FIXED_SIGNATURE,
            FIXED_MESSAGE,
            &other_key,
            jsonwebtoken::Algorithm::RS256
        )
        .unwrap()
    );
}

#[test]
fn truncated_certificates_fail_to_parse() {
    let der = pem_to_der(SIGNING_CERT).unwrap();
    for len in 0..der.len() {
        assert!(
            subject_public_key_info(&der[..len]).is_err(),
            "prefix of {len} bytes parsed"
        );
    }

    let mut corrupted = der.clone();
    corrupted[1] = 0x85; // five length octets
    assert!(subject_public_key_info(&corrupted).is_err());
}
