//! Per-request credential evaluation.
//!
//! [`AuthService::evaluate`] reads the stored token set, verifies the id
//! token and, when it has expired, refreshes it exactly once. Expected
//! failures become [`Outcome::Invalid`]; operational errors are returned.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::codec::{CookieBuilder, CookieCodec, CustomTokens};
use crate::config::AuthConfig;
use crate::cookie::{CookieOptions, RequestCookies, ResponseCookie};
use crate::credential::{AccessTokenCache, Credential};
use crate::error::{AuthErrorCode, InvalidTokenReason};
use crate::identity::{IdentityClient, RequestContext, http_client};
use crate::keys::{KeyResolver, PublicKeyCache};
use crate::rotating::RotatingCredential;
use crate::signer::CryptoSigner;
use crate::token::{DecodedToken, VerifyOptions};
use crate::verifier::{SignatureVerifier, TokenVerifier, TokenVerifierConfig};
use crate::{Error, Result};

/// Access token the emulator accepts for administrative calls.
const EMULATOR_ACCESS_TOKEN: &str = "owner";

/// Process-wide state shared by every [`AuthService`].
#[derive(Debug, Clone)]
pub struct SharedState {
    /// Client for all upstream calls.
    pub http: reqwest::Client,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Fetched verification keys.
    pub public_keys: Arc<PublicKeyCache>,
    /// Upstream access tokens.
    pub access_tokens: Arc<AccessTokenCache>,
}

impl SharedState {
    /// Fresh caches on `clock`.
    pub fn new(http: reqwest::Client, clock: Arc<dyn Clock>) -> Self {
        Self {
            public_keys: Arc::new(PublicKeyCache::new(Arc::clone(&clock))),
            access_tokens: Arc::new(AccessTokenCache::new(Arc::clone(&clock))),
            http,
            clock,
        }
    }

    /// Wall clock and the default HTTP client.
    ///
    /// # Errors
    /// The HTTP client cannot be built.
    pub fn system() -> Result<Self> {
        Ok(Self::new(http_client()?, Arc::new(SystemClock)))
    }
}

/// Result of evaluating a request's credentials.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The request is authenticated.
    Valid {
        /// Verified id token.
        token: DecodedToken,
        /// Current token set.
        tokens: CustomTokens,
        /// Tokens were refreshed or read from an outdated layout; cookies
        /// must be written again.
        rotated: bool,
    },
    /// The request must re-authenticate.
    Invalid {
        /// Why.
        reason: InvalidTokenReason,
        /// The classified failure behind `reason`, if any.
        cause: Option<AuthErrorCode>,
    },
}

impl Outcome {
    fn invalid(reason: InvalidTokenReason, cause: Option<AuthErrorCode>) -> Self {
        Outcome::Invalid { reason, cause }
    }

    /// True for [`Outcome::Valid`].
    pub fn is_valid(&self) -> bool {
        matches!(self, Outcome::Valid { .. })
    }

    /// True when the cookies must be written again.
    pub fn rotated(&self) -> bool {
        matches!(self, Outcome::Valid { rotated: true, .. })
    }

    /// The failure reason, for [`Outcome::Invalid`].
    pub fn invalid_reason(&self) -> Option<InvalidTokenReason> {
        match self {
            Outcome::Invalid { reason, .. } => Some(*reason),
            Outcome::Valid { .. } => None,
        }
    }
}

/// Token verification, refresh and cookie storage for one project.
#[derive(Debug, Clone)]
pub struct AuthService {
    project_id: String,
    tenant_id: Option<String>,
    emulator: bool,
    enable_custom_token: bool,
    verifier: TokenVerifier,
    codec: CookieCodec,
    cookie_options: CookieOptions,
    identity: IdentityClient,
    signer: Option<CryptoSigner>,
    credential: Option<Credential>,
    shared: SharedState,
}

impl AuthService {
    /// Build from a validated configuration.
    ///
    /// # Errors
    /// `Config` when the configuration is incomplete, or the service account
    /// key does not parse.
    pub fn from_config(config: &AuthConfig, shared: SharedState) -> Result<Self> {
        config.validate()?;

        let emulator = config.is_emulator();
        let signature = if emulator {
            SignatureVerifier::Emulator
        } else {
            SignatureVerifier::PublicKey(KeyResolver::new(
                config.key_source(),
                Arc::clone(&shared.public_keys),
                shared.http.clone(),
            ))
        };
        let verifier = TokenVerifier::new(
            TokenVerifierConfig {
                tenant_id: config.tenant_id.clone(),
                ..TokenVerifierConfig::id_token(config.project_id.clone())
            },
            signature,
            Arc::clone(&shared.clock),
        );

        let builder = if config.enable_multiple_cookies {
            CookieBuilder::Multiple
        } else {
            CookieBuilder::Single
        };
        let codec = CookieCodec::new(
            config.cookie_name.clone(),
            RotatingCredential::new(&config.cookie_signature_keys)?,
            builder,
            config.enable_custom_token,
        );

        let signer = match (&config.service_account, emulator) {
            (_, true) => Some(CryptoSigner::emulator()),
            (Some(account), false) => Some(CryptoSigner::from_service_account(account)?),
            (None, false) => None,
        };
        if config.enable_custom_token && signer.is_none() {
            return Err(Error::Config(
                "enable_custom_token requires a service account".to_string(),
            ));
        }

        let credential = match (&config.service_account, emulator) {
            (_, true) => None,
            (Some(account), false) => {
                let credential = Credential::service_account(account.clone())?;
                Some(match &config.oauth_token_url {
                    Some(url) => credential.with_token_url(url.clone()),
                    None => credential,
                })
            }
            (None, false) => Some(Credential::metadata()),
        };

        let identity = IdentityClient::new(
            shared.http.clone(),
            config.endpoints(),
            config.api_key.clone(),
            config.tenant_id.clone(),
        );

        Ok(Self {
            project_id: config.project_id.clone(),
            tenant_id: config.tenant_id.clone(),
            emulator,
            enable_custom_token: config.enable_custom_token,
            verifier,
            codec,
            cookie_options: config.cookie.clone(),
            identity,
            signer,
            credential,
            shared,
        })
    }

    /// The cookie codec.
    pub fn codec(&self) -> &CookieCodec {
        &self.codec
    }

    /// Decide whether the request carrying `cookies` is authenticated.
    ///
    /// Cookie integrity is checked before any token verification, and at
    /// most one refresh is attempted.
    ///
    /// # Errors
    /// Operational failures only: network errors, malformed upstream
    /// answers, and a refreshed token that still does not verify.
    #[instrument(skip_all)]
    pub async fn evaluate(
        &self,
        cookies: &RequestCookies,
        opts: &VerifyOptions,
    ) -> Result<Outcome> {
        let tokens = match self.codec.parse(cookies) {
            Ok(tokens) => tokens,
            Err(e) => {
                return match e.invalid_reason() {
                    Some(reason) => {
                        debug!(%reason, "stored credentials rejected");
                        Ok(Outcome::invalid(reason, None))
                    }
                    None => Err(e),
                };
            }
        };

        match self.verify_id_token(&tokens.id_token, opts).await {
            Ok(token) => {
                let migrate = self.codec.needs_migration(cookies);
                if migrate {
                    debug!(
                        layout = ?self.codec.layout(cookies),
                        "re-issuing cookies in configured layout"
                    );
                }
                Ok(Outcome::Valid {
                    token,
                    tokens,
                    rotated: migrate,
                })
            }
            Err(e) if e.is_auth_code(AuthErrorCode::TokenExpired) => {
                self.refresh(tokens, opts).await
            }
            Err(e) => classify(e),
        }
    }

    async fn refresh(&self, stored: CustomTokens, opts: &VerifyOptions) -> Result<Outcome> {
        info!("id token expired; refreshing");
        let ctx = RequestContext::from(opts);

        let fresh = match self.identity.refresh_id_token(&stored.refresh_token, &ctx).await {
            Ok(fresh) => fresh,
            Err(Error::Auth(e)) => {
                match e.code {
                    AuthErrorCode::UserNotFound | AuthErrorCode::UserDisabled => {
                        warn!(code = %e.code, "refresh rejected for account");
                    }
                    _ => info!(code = %e.code, "refresh token rejected"),
                }
                return Ok(Outcome::invalid(
                    InvalidTokenReason::InvalidCredentials,
                    Some(e.code),
                ));
            }
            Err(Error::Upstream { status, message }) if (400..500).contains(&status) => {
                info!(status, %message, "refresh rejected");
                return Ok(Outcome::invalid(InvalidTokenReason::InvalidCredentials, None));
            }
            Err(e) => return Err(e),
        };

        // The refreshed token must verify; a second failure is not retried.
        let token = self.verify_id_token(&fresh.id_token, opts).await?;

        let custom_token = if self.enable_custom_token {
            Some(self.create_custom_token(&token)?)
        } else {
            None
        };

        info!(uid = %token.uid, "refreshed credentials");
        Ok(Outcome::Valid {
            token,
            tokens: CustomTokens {
                id_token: fresh.id_token,
                refresh_token: fresh.refresh_token,
                custom_token,
                metadata: stored.metadata,
            },
            rotated: true,
        })
    }

    /// Verify an id token, including the revocation check when requested.
    ///
    /// # Errors
    /// A classified auth error, or an operational error.
    pub async fn verify_id_token(
        &self,
        id_token: &str,
        opts: &VerifyOptions,
    ) -> Result<DecodedToken> {
        let token = self.verifier.verify(id_token, opts).await?;
        if opts.check_revoked {
            self.check_revoked(&token).await?;
        }
        Ok(token)
    }

    async fn check_revoked(&self, token: &DecodedToken) -> Result<()> {
        let access_token = match &self.credential {
            Some(credential) => {
                credential
                    .access_token(&self.shared.http, &self.shared.access_tokens)
                    .await?
            }
            None if self.emulator => EMULATOR_ACCESS_TOKEN.to_string(),
            None => {
                return Err(Error::Config("revocation check requires a credential".to_string()));
            }
        };

        let account = self
            .identity
            .lookup_account(&self.project_id, &token.uid, &access_token)
            .await?;

        if account.disabled {
            return Err(Error::auth(AuthErrorCode::UserDisabled, "the user account is disabled"));
        }
        let authenticated_at = token.auth_time.unwrap_or(token.issued_at);
        if let Some(valid_since) = account.valid_since {
            if authenticated_at < valid_since {
                return Err(Error::auth(
                    AuthErrorCode::TokenRevoked,
                    "the id token has been revoked",
                ));
            }
        }
        Ok(())
    }

    fn signer(&self) -> Result<&CryptoSigner> {
        self.signer
            .as_ref()
            .ok_or_else(|| {
                Error::Config("minting custom tokens requires a service account".to_string())
            })
    }

    /// Mint a custom token for the account and custom claims of `token`.
    ///
    /// # Errors
    /// No signer is configured, or the claims are not allowed.
    pub fn create_custom_token(&self, token: &DecodedToken) -> Result<String> {
        let claims = token.custom_claims();
        self.signer()?.create_custom_token(
            &token.uid,
            Some(&claims),
            self.tenant_id.as_deref(),
            &self.shared.clock,
        )
    }

    /// Turn a freshly issued id token into a full token set (login).
    ///
    /// The id token is verified, a custom token is minted for its account
    /// and exchanged for a new id and refresh token.
    ///
    /// # Errors
    /// A classified auth error when the token or the exchange is rejected,
    /// or an operational error.
    #[instrument(skip_all)]
    pub async fn custom_id_and_refresh_tokens(
        &self,
        id_token: &str,
        opts: &VerifyOptions,
    ) -> Result<CustomTokens> {
        let token = self.verify_id_token(id_token, opts).await?;
        let custom_token = self.create_custom_token(&token)?;
        let exchanged = self
            .identity
            .exchange_custom_token(&custom_token, &RequestContext::from(opts))
            .await?;

        Ok(CustomTokens {
            custom_token: self.enable_custom_token.then_some(custom_token),
            ..exchanged
        })
    }

    /// Cookies storing `tokens` in the configured layout.
    ///
    /// # Errors
    /// Serialization or signing failure.
    pub fn response_cookies(&self, tokens: &CustomTokens) -> Result<Vec<ResponseCookie>> {
        self.codec.response_cookies(tokens)
    }

    /// Cookies removing every stored credential.
    pub fn logout_cookies(&self) -> Vec<ResponseCookie> {
        self.codec.expire_all()
    }

    /// Render `cookies` as `Set-Cookie` header values.
    ///
    /// # Errors
    /// `Config` when the cookie attributes are illegal for a name.
    pub fn set_cookie_headers(&self, cookies: &[ResponseCookie]) -> Result<Vec<String>> {
        let now_ms = self.shared.clock.now_ms();
        cookies
            .iter()
            .map(|c| c.render(&self.cookie_options, now_ms))
            .collect()
    }
}

fn classify(e: Error) -> Result<Outcome> {
    match e.auth_code() {
        Some(AuthErrorCode::NoMatchingKid) => {
            Ok(Outcome::invalid(
                InvalidTokenReason::InvalidKid,
                Some(AuthErrorCode::NoMatchingKid),
            ))
        }
        Some(code) => {
            debug!(%code, "id token rejected");
            Ok(Outcome::invalid(InvalidTokenReason::InvalidCredentials, Some(code)))
        }
        None => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;

    fn config() -> AuthConfig {
        AuthConfig {
            project_id: "demo".into(),
            api_key: "key".into(),
            cookie_name: "session".into(),
            cookie_signature_keys: vec!["k1".into()],
            emulator_host: Some("127.0.0.1:1".into()),
            ..AuthConfig::default()
        }
    }

    fn service(config: &AuthConfig) -> AuthService {
        let shared = SharedState::new(reqwest::Client::new(), Arc::new(FixedClock::new(0)));
        AuthService::from_config(config, shared).unwrap()
    }

    #[tokio::test]
    async fn codec_failures_become_invalid() {
        let svc = service(&config());
        let outcome = svc
            .evaluate(&RequestCookies::new(), &VerifyOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.invalid_reason(), Some(InvalidTokenReason::Missing));

        let tampered: RequestCookies = [("session", "a.b.c")].into_iter().collect();
        let outcome = svc.evaluate(&tampered, &VerifyOptions::default()).await.unwrap();
        assert_eq!(outcome.invalid_reason(), Some(InvalidTokenReason::InvalidSignature));
    }

    #[test]
    fn custom_tokens_need_a_signer() {
        let mut cfg = config();
        cfg.emulator_host = None;
        cfg.enable_custom_token = true;
        let shared = SharedState::new(reqwest::Client::new(), Arc::new(FixedClock::new(0)));
        assert!(matches!(
            AuthService::from_config(&cfg, shared),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn non_auth_errors_are_not_masked() {
        assert!(classify(Error::Keys("down".into())).is_err());
        assert_eq!(
            classify(Error::auth(AuthErrorCode::NoMatchingKid, "x"))
                .unwrap()
                .invalid_reason(),
            Some(InvalidTokenReason::InvalidKid)
        );
        assert_eq!(
            classify(Error::auth(AuthErrorCode::InvalidSignature, "x"))
                .unwrap()
                .invalid_reason(),
            Some(InvalidTokenReason::InvalidCredentials)
        );
    }

    #[test]
    fn logout_expires_everything() {
        let svc = service(&config());
        let headers = svc.set_cookie_headers(&svc.logout_cookies()).unwrap();
        assert_eq!(headers.len(), 6);
        assert!(headers.iter().all(|h| h.contains("Max-Age=0")));
    }
}
