//! Upstream service credentials and their cached access tokens.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::clock::{Clock, SystemClock};
use crate::{Error, Result};

/// OAuth token endpoint for service account assertions.
pub const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Metadata server token endpoint for the default service account.
pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

const METADATA_FLAVOR_HEADER: &str = "Metadata-Flavor";

const SCOPES: &str = "https://www.googleapis.com/auth/cloud-platform \
https://www.googleapis.com/auth/firebase.database \
https://www.googleapis.com/auth/firebase.messaging \
https://www.googleapis.com/auth/identitytoolkit \
https://www.googleapis.com/auth/userinfo.email";

/// Tokens with less than this much lifetime left are fetched again.
pub const REFRESH_THRESHOLD: Duration = Duration::from_secs(5 * 60);

const ASSERTION_LIFETIME_SECS: u64 = 3600;

/// A service account key file.
#[derive(Clone, Deserialize)]
pub struct ServiceAccount {
    /// Project the account belongs to.
    pub project_id: String,
    /// Account email, used as issuer of assertions and custom tokens.
    pub client_email: String,
    /// PKCS#8 PEM private key.
    pub private_key: String,
}

impl fmt::Debug for ServiceAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccount")
            .field("project_id", &self.project_id)
            .field("client_email", &self.client_email)
            .finish_non_exhaustive()
    }
}

impl ServiceAccount {
    /// Parse a JSON key file.
    ///
    /// # Errors
    /// Invalid JSON or missing fields.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// The RS256 signing key.
    ///
    /// # Errors
    /// The PEM is not an RSA private key.
    pub fn encoding_key(&self) -> Result<EncodingKey> {
        Ok(EncodingKey::from_rsa_pem(self.private_key.as_bytes())?)
    }
}

/// A cached bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessTokenCacheEntry {
    /// Bearer value.
    pub token: String,
    /// Epoch milliseconds.
    pub expires_at_ms: u64,
}

/// Access tokens keyed by the endpoint that issued them.
#[derive(Debug)]
pub struct AccessTokenCache {
    entries: DashMap<String, Arc<AccessTokenCacheEntry>>,
    clock: Arc<dyn Clock>,
    threshold: Duration,
}

impl Default for AccessTokenCache {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl AccessTokenCache {
    /// Empty cache on `clock` with the default refresh threshold.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            threshold: REFRESH_THRESHOLD,
        }
    }

    /// Replace the refresh threshold.
    #[must_use]
    pub fn with_threshold(mut self, threshold: Duration) -> Self {
        self.threshold = threshold;
        self
    }

    /// The entry for `url` if it outlives the refresh threshold.
    pub fn get_fresh(&self, url: &str) -> Option<Arc<AccessTokenCacheEntry>> {
        let entry = self.entries.get(url)?;
        let threshold_ms = u64::try_from(self.threshold.as_millis()).unwrap_or(u64::MAX);
        if entry.expires_at_ms > self.clock.now_ms().saturating_add(threshold_ms) {
            Some(Arc::clone(entry.value()))
        } else {
            None
        }
    }

    /// Store `token` for `url`, valid for `expires_in_secs`.
    pub fn insert(
        &self,
        url: &str,
        token: String,
        expires_in_secs: u64,
    ) -> Arc<AccessTokenCacheEntry> {
        let entry = Arc::new(AccessTokenCacheEntry {
            token,
            expires_at_ms: self
                .clock
                .now_ms()
                .saturating_add(expires_in_secs.saturating_mul(1000)),
        });
        self.entries.insert(url.to_string(), Arc::clone(&entry));
        entry
    }

    /// Drop the entry for `url`.
    pub fn invalidate(&self, url: &str) {
        self.entries.remove(url);
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Serialize)]
struct Assertion<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

/// Where access tokens come from.
#[derive(Clone)]
pub enum Credential {
    /// Signed JWT-bearer assertion exchanged at an OAuth endpoint.
    ServiceAccount {
        /// Key file.
        account: ServiceAccount,
        /// Parsed private key.
        key: EncodingKey,
        /// OAuth token endpoint.
        token_url: String,
    },
    /// Instance metadata server.
    Metadata {
        /// Token endpoint.
        url: String,
    },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::ServiceAccount {
                account, token_url, ..
            } => f
                .debug_struct("ServiceAccount")
                .field("client_email", &account.client_email)
                .field("token_url", token_url)
                .finish_non_exhaustive(),
            Credential::Metadata { url } => f.debug_struct("Metadata").field("url", url).finish(),
        }
    }
}

impl Credential {
    /// Credential for `account` against the default OAuth endpoint.
    ///
    /// # Errors
    /// The private key does not parse.
    pub fn service_account(account: ServiceAccount) -> Result<Self> {
        let key = account.encoding_key()?;
        Ok(Credential::ServiceAccount {
            account,
            key,
            token_url: OAUTH_TOKEN_URL.to_string(),
        })
    }

    /// Credential backed by the default metadata server.
    pub fn metadata() -> Self {
        Credential::Metadata {
            url: METADATA_TOKEN_URL.to_string(),
        }
    }

    /// Same credential, other token endpoint.
    #[must_use]
    pub fn with_token_url(self, url: impl Into<String>) -> Self {
        match self {
            Credential::ServiceAccount { account, key, .. } => Credential::ServiceAccount {
                account,
                key,
                token_url: url.into(),
            },
            Credential::Metadata { .. } => Credential::Metadata { url: url.into() },
        }
    }

    /// Endpoint tokens are fetched from; also the cache key.
    pub fn token_url(&self) -> &str {
        match self {
            Credential::ServiceAccount { token_url, .. } => token_url,
            Credential::Metadata { url } => url,
        }
    }

    /// Project of the service account, when known.
    pub fn project_id(&self) -> Option<&str> {
        match self {
            Credential::ServiceAccount { account, .. } => Some(&account.project_id),
            Credential::Metadata { .. } => None,
        }
    }

    /// A bearer token, from `cache` when it outlives the refresh threshold.
    ///
    /// # Errors
    /// Network failure, a non-success answer (`Upstream`) or a malformed body.
    #[instrument(skip(self, http, cache), fields(url = self.token_url()))]
    pub async fn access_token(
        &self,
        http: &reqwest::Client,
        cache: &AccessTokenCache,
    ) -> Result<String> {
        let url = self.token_url();
        if let Some(entry) = cache.get_fresh(url) {
            return Ok(entry.token.clone());
        }

        let request = match self {
            Credential::ServiceAccount {
                account,
                key,
                token_url,
            } => {
                let iat = cache.clock.now_secs();
                let assertion = jsonwebtoken::encode(
                    &Header::new(Algorithm::RS256),
                    &Assertion {
                        iss: &account.client_email,
                        scope: SCOPES,
                        aud: token_url,
                        iat,
                        exp: iat + ASSERTION_LIFETIME_SECS,
                    },
                    key,
                )?;
                http.post(token_url.as_str()).form(&[
                    ("grant_type", JWT_BEARER_GRANT),
                    ("assertion", assertion.as_str()),
                ])
            }
            Credential::Metadata { url } => {
                http.get(url.as_str()).header(METADATA_FLAVOR_HEADER, "Google")
            }
        };

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(Error::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        let body: TokenResponse = resp.json().await?;
        debug!(expires_in = body.expires_in, "fetched access token");
        Ok(cache.insert(url, body.access_token, body.expires_in).token.clone())
    }
}
