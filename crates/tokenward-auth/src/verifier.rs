//! Id token verification.
//!
//! [`TokenVerifier`] runs the cheap structural claim checks first and only
//! then asks a [`SignatureVerifier`] for the cryptographic check.

use std::sync::Arc;

use futures::future::try_join_all;
use jsonwebtoken::Algorithm;
use serde_json::Value;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::AuthErrorCode;
use crate::keys::{KeyResolver, PublicKey};
use crate::token::{DecodedToken, UnverifiedToken, VerifyOptions};
use crate::{Error, Result};

/// The only algorithm accepted outside emulator mode.
pub const RS256: &str = "RS256";

/// Issuer prefix of provider id tokens; the project id is appended.
pub const ID_TOKEN_ISSUER_PREFIX: &str = "https://securetoken.google.com/";

/// Audience of custom tokens minted for the identity toolkit.
pub const CUSTOM_TOKEN_AUDIENCE: &str =
    "https://identitytoolkit.googleapis.com/google.identity.identitytoolkit.v1.IdentityToolkit";

const MAX_SUBJECT_LEN: usize = 128;

/// How a token's signature is checked.
#[derive(Debug, Clone)]
pub enum SignatureVerifier {
    /// RS256 against keys from a resolver.
    PublicKey(KeyResolver),
    /// Development mode: no signature check, time claims only.
    Emulator,
}

impl SignatureVerifier {
    /// True in development mode.
    pub fn is_emulator(&self) -> bool {
        matches!(self, SignatureVerifier::Emulator)
    }

    /// Check the signature of `token` and its time claims at `now` (seconds).
    ///
    /// With a `kid` header only that key is tried. Without one every key is
    /// tried concurrently and any match is enough; an expired token stops the
    /// fan-out immediately.
    ///
    /// # Errors
    /// `TOKEN_EXPIRED`, `NO_MATCHING_KID`, `INVALID_SIGNATURE`, or an
    /// operational error from key resolution.
    pub async fn verify(
        &self,
        token: &UnverifiedToken,
        opts: &VerifyOptions,
        now: u64,
    ) -> Result<()> {
        let resolver = match self {
            SignatureVerifier::Emulator => return check_time_claims(token, now),
            SignatureVerifier::PublicKey(resolver) => resolver,
        };

        let entry = resolver.fetch_keys().await?;
        let keys = entry.keys;

        match token.header.kid.as_deref() {
            Some(kid) => {
                let Some(key) = keys.get(kid) else {
                    return Err(no_match(
                        opts,
                        format!("no public key published for kid \"{kid}\""),
                    ));
                };
                if verify_with_key(token, key, now)? {
                    Ok(())
                } else {
                    Err(Error::auth(
                        AuthErrorCode::InvalidSignature,
                        "invalid token signature",
                    ))
                }
            }
            None => {
                let attempts = keys
                    .iter()
                    .map(|key| async move { verify_with_key(token, key, now) });
                let results = try_join_all(attempts).await?;
                if results.into_iter().any(|ok| ok) {
                    Ok(())
                } else if opts.unsafe_expire_on_invalid_kid {
                    Err(no_match(opts, "no public key verified the token".to_string()))
                } else {
                    Err(Error::auth(
                        AuthErrorCode::InvalidSignature,
                        "no public key verified the token signature",
                    ))
                }
            }
        }
    }
}

fn no_match(opts: &VerifyOptions, message: String) -> Error {
    if opts.unsafe_expire_on_invalid_kid {
        warn!(%message, "treating unmatched key as expired token");
        Error::auth(AuthErrorCode::TokenExpired, message)
    } else {
        Error::auth(AuthErrorCode::NoMatchingKid, message)
    }
}

/// `Ok(false)` on a signature mismatch; an error only for expiry.
fn verify_with_key(token: &UnverifiedToken, key: &PublicKey, now: u64) -> Result<bool> {
    let matched = jsonwebtoken::crypto::verify(
        &token.signature,
        token.signing_input.as_bytes(),
        &key.key,
        Algorithm::RS256,
    )
    .unwrap_or_else(|e| {
        debug!(kid = ?key.kid, error = %e, "signature check errored");
        false
    });

    if matched {
        check_time_claims(token, now)?;
    }
    Ok(matched)
}

fn check_time_claims(token: &UnverifiedToken, now: u64) -> Result<()> {
    if let Some(nbf) = token.claim("nbf") {
        let nbf = nbf.as_u64().ok_or_else(|| {
            Error::auth(AuthErrorCode::InvalidArgument, "\"nbf\" claim must be a number")
        })?;
        if nbf > now {
            return Err(Error::auth(
                AuthErrorCode::InvalidArgument,
                "token is not yet valid (\"nbf\" in the future)",
            ));
        }
    }

    let exp = token
        .claim("exp")
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            Error::auth(
                AuthErrorCode::InvalidArgument,
                "missing numeric \"exp\" claim",
            )
        })?;
    if exp <= now {
        return Err(Error::auth(
            AuthErrorCode::TokenExpired,
            format!("token expired at {exp}"),
        ));
    }
    Ok(())
}

/// Static expectations for the tokens of one project.
#[derive(Debug, Clone)]
pub struct TokenVerifierConfig {
    /// Expected `aud`; also the `iss` suffix.
    pub project_id: String,
    /// `iss` must equal this prefix followed by the project id.
    pub issuer_prefix: String,
    /// When set, `firebase.tenant` must equal it.
    pub tenant_id: Option<String>,
    /// Reject tokens without a `kid` header (outside emulator mode).
    pub require_kid: bool,
}

impl TokenVerifierConfig {
    /// Id token expectations for `project_id`.
    pub fn id_token(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            issuer_prefix: ID_TOKEN_ISSUER_PREFIX.to_string(),
            tenant_id: None,
            require_kid: true,
        }
    }
}

/// Verifies id tokens for one project.
#[derive(Debug, Clone)]
pub struct TokenVerifier {
    config: TokenVerifierConfig,
    signature: SignatureVerifier,
    clock: Arc<dyn Clock>,
}

impl TokenVerifier {
    /// Verifier with `config` checking signatures through `signature`.
    pub fn new(
        config: TokenVerifierConfig,
        signature: SignatureVerifier,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            signature,
            clock,
        }
    }

    /// The static expectations.
    pub fn config(&self) -> &TokenVerifierConfig {
        &self.config
    }

    /// Verify `token`; the input is never modified.
    ///
    /// # Errors
    /// A classified [`crate::AuthError`] for bad tokens, or an operational
    /// error from key resolution.
    pub async fn verify(&self, token: &str, opts: &VerifyOptions) -> Result<DecodedToken> {
        let unverified = UnverifiedToken::decode(token)?;
        self.check_structure(&unverified)?;

        let now = opts.current_time.unwrap_or_else(|| self.clock.now_secs());
        self.signature.verify(&unverified, opts, now).await?;

        decoded(unverified)
    }

    fn check_structure(&self, token: &UnverifiedToken) -> Result<()> {
        let emulator = self.signature.is_emulator();
        let invalid = |message: String| Error::auth(AuthErrorCode::InvalidArgument, message);

        match token.header.alg.as_deref() {
            None => return Err(invalid("token header has no \"alg\"".to_string())),
            Some(alg) if !emulator && alg != RS256 => {
                return Err(invalid(format!(
                    "token has incorrect algorithm: expected \"{RS256}\" but got \"{alg}\""
                )));
            }
            Some(_) => {}
        }

        if !emulator && self.config.require_kid && token.header.kid.is_none() {
            let is_custom_token =
                token.claim("aud").and_then(Value::as_str) == Some(CUSTOM_TOKEN_AUDIENCE);
            let message = if is_custom_token {
                "expected an ID token but was given a custom token"
            } else {
                "token has no \"kid\" header"
            };
            return Err(Error::auth(AuthErrorCode::NoKidInHeader, message));
        }

        let project_id = self.config.project_id.as_str();
        if !audience_matches(token.claim("aud"), project_id) {
            return Err(invalid(format!(
                "token has incorrect \"aud\" claim: expected \"{project_id}\""
            )));
        }

        let issuer = format!("{}{project_id}", self.config.issuer_prefix);
        if token.claim("iss").and_then(Value::as_str) != Some(issuer.as_str()) {
            return Err(invalid(format!(
                "token has incorrect \"iss\" claim: expected \"{issuer}\""
            )));
        }

        match token.claim("sub") {
            Some(Value::String(sub)) if sub.is_empty() => {
                return Err(invalid("token has an empty \"sub\" claim".to_string()));
            }
            Some(Value::String(sub)) if sub.chars().count() > MAX_SUBJECT_LEN => {
                return Err(invalid(format!(
                    "token has \"sub\" longer than {MAX_SUBJECT_LEN} characters"
                )));
            }
            Some(Value::String(_)) => {}
            _ => return Err(invalid("token has no string \"sub\" claim".to_string())),
        }

        if let Some(expected) = self.config.tenant_id.as_deref() {
            let tenant = tenant_of(token);
            if tenant != Some(expected) {
                return Err(Error::auth(
                    AuthErrorCode::MismatchingTenantId,
                    format!(
                        "token tenant {tenant:?} does not match configured tenant \"{expected}\""
                    ),
                ));
            }
        }

        Ok(())
    }
}

fn audience_matches(aud: Option<&Value>, project_id: &str) -> bool {
    match aud {
        Some(Value::String(s)) => s == project_id,
        Some(Value::Array(arr)) => arr.iter().any(|v| v.as_str() == Some(project_id)),
        _ => false,
    }
}

fn tenant_of(token: &UnverifiedToken) -> Option<&str> {
    token
        .claim("firebase")
        .and_then(|f| f.get("tenant"))
        .and_then(Value::as_str)
}

fn decoded(token: UnverifiedToken) -> Result<DecodedToken> {
    let num = |key: &str| token.claim(key).and_then(Value::as_u64);
    let str_claim = |key: &str| token.claim(key).and_then(Value::as_str).map(str::to_string);

    let uid = str_claim("sub").unwrap_or_default();
    let issuer = str_claim("iss").unwrap_or_default();
    let audience = match token.claim("aud") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(arr)) => arr
            .iter()
            .filter_map(Value::as_str)
            .next()
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    };
    let expires_at = num("exp").unwrap_or_default();
    let issued_at = num("iat").unwrap_or_default();
    let auth_time = num("auth_time");
    let tenant = tenant_of(&token).map(str::to_string);

    Ok(DecodedToken {
        header: token.header,
        uid,
        issuer,
        audience,
        expires_at,
        issued_at,
        auth_time,
        tenant,
        claims: token.claims,
    })
}
