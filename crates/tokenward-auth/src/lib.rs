//! tokenward-auth
//!
//! Token verification, refresh and signed cookie storage for edge-style
//! HTTP middleware. It focuses on four recurring problems:
//!
//! - **Verifying id tokens** against published keys (JWKS or X.509
//!   certificates decoded with a small DER reader), with or without a `kid`
//! - **Rotating HMAC keys** for cookie integrity without logging users out
//! - **Storing token sets in cookies**, in single, multiple or legacy layouts
//! - **Refreshing expired tokens** exactly once per request
//!
//! The core API is [`AuthService`], built from an [`AuthConfig`] and a
//! [`SharedState`] holding the HTTP client, the clock and the caches.
//!
//! ## Quick start
//! ```no_run
//! use tokenward_auth::{AuthConfig, AuthService, Outcome, RequestCookies, SharedState};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = AuthConfig::load_from_file("tokenward.toml".as_ref())?;
//! config.apply_env()?;
//! let auth = AuthService::from_config(&config, SharedState::system()?)?;
//!
//! let cookies = RequestCookies::from_header("AuthToken=eyJ...");
//! match auth.evaluate(&cookies, &config.verify_options()).await? {
//!     Outcome::Valid { token, tokens, rotated } => {
//!         println!("uid={}", token.uid);
//!         if rotated {
//!             let headers = auth.set_cookie_headers(&auth.response_cookies(&tokens)?)?;
//!             println!("{headers:?}");
//!         }
//!     }
//!     Outcome::Invalid { reason, .. } => println!("re-authenticate: {reason}"),
//! }
//! # Ok(()) }
//! ```

#![forbid(unsafe_code)]

pub mod asn1;
mod clock;
mod codec;
mod config;
mod cookie;
mod credential;
mod error;
mod identity;
mod keys;
mod lifecycle;
mod rotating;
mod signer;
mod token;
mod verifier;

pub use clock::{Clock, FixedClock, SystemClock};
pub use codec::{CookieBuilder, CookieCodec, CookieLayout, CookieParser, CustomTokens};
pub use config::{AuthConfig, DEFAULT_JWKS_URL, DEFAULT_X509_URL, KeySourceKind};
pub use cookie::{
    Cookie, CookieOptions, MAX_COOKIE_AGE_SECS, RequestCookies, ResponseCookie, SameSite,
    build_clear_cookie, build_set_cookie,
};
pub use credential::{
    AccessTokenCache, AccessTokenCacheEntry, Credential, METADATA_TOKEN_URL, OAUTH_TOKEN_URL,
    REFRESH_THRESHOLD, ServiceAccount,
};
pub use error::{AuthError, AuthErrorCode, Error, InvalidTokenReason, Result};
pub use identity::{
    APP_CHECK_HEADER, AccountRecord, Endpoints, IdentityClient, RequestContext, http_client,
};
pub use keys::{
    Jwk, JwksDocument, KeyResolver, KeySet, KeySource, PublicKey, PublicKeyCache,
    PublicKeyCacheEntry, rsa_key_from_certificate, rsa_key_from_spki,
};
pub use lifecycle::{AuthService, Outcome, SharedState};
pub use rotating::RotatingCredential;
pub use signer::{CUSTOM_TOKEN_LIFETIME_SECS, CryptoSigner, RESERVED_CLAIMS};
pub use token::{DecodedToken, JwtHeader, UnverifiedToken, VerifyOptions};
pub use verifier::{
    CUSTOM_TOKEN_AUDIENCE, ID_TOKEN_ISSUER_PREFIX, RS256, SignatureVerifier, TokenVerifier,
    TokenVerifierConfig,
};
