//! Client for the upstream token and account endpoints.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::codec::CustomTokens;
use crate::error::AuthErrorCode;
use crate::token::VerifyOptions;
use crate::{Error, Result};

/// Header carrying an App Check assertion.
pub const APP_CHECK_HEADER: &str = "X-Firebase-AppCheck";

const TOKEN_BASE: &str = "https://securetoken.googleapis.com/v1";
const IDENTITY_BASE: &str = "https://identitytoolkit.googleapis.com/v1";

/// Shared HTTP client with the timeout used for every upstream call.
///
/// # Errors
/// The TLS backend fails to initialise.
pub fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?)
}

/// Base URLs of the upstream services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    /// Secure token service, e.g. `https://securetoken.googleapis.com/v1`.
    pub token_base: String,
    /// Identity toolkit, e.g. `https://identitytoolkit.googleapis.com/v1`.
    pub identity_base: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self::production()
    }
}

impl Endpoints {
    /// Public production endpoints.
    pub fn production() -> Self {
        Self {
            token_base: TOKEN_BASE.to_string(),
            identity_base: IDENTITY_BASE.to_string(),
        }
    }

    /// Endpoints served by an emulator at `host` (`host:port`).
    pub fn emulator(host: &str) -> Self {
        Self {
            token_base: format!("http://{host}/securetoken.googleapis.com/v1"),
            identity_base: format!("http://{host}/identitytoolkit.googleapis.com/v1"),
        }
    }

    fn refresh_url(&self, api_key: &str) -> String {
        format!("{}/token?key={api_key}", self.token_base)
    }

    fn custom_token_url(&self, api_key: &str) -> String {
        format!(
            "{}/accounts:signInWithCustomToken?key={api_key}",
            self.identity_base
        )
    }

    fn lookup_url(&self, project_id: &str, tenant_id: Option<&str>) -> String {
        match tenant_id {
            Some(tenant) => format!(
                "{}/projects/{project_id}/tenants/{tenant}/accounts:lookup",
                self.identity_base
            ),
            None => format!("{}/projects/{project_id}/accounts:lookup", self.identity_base),
        }
    }
}

/// Headers forwarded with a user-facing upstream call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// `Referer`, for API keys restricted by referrer.
    pub referer: Option<String>,
    /// App Check assertion.
    pub app_check_token: Option<String>,
}

impl From<&VerifyOptions> for RequestContext {
    fn from(opts: &VerifyOptions) -> Self {
        Self {
            referer: opts.referer.clone(),
            app_check_token: opts.app_check_token.clone(),
        }
    }
}

impl RequestContext {
    fn apply(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(referer) = &self.referer {
            request = request.header(reqwest::header::REFERER, referer);
        }
        if let Some(token) = &self.app_check_token {
            request = request.header(APP_CHECK_HEADER, token);
        }
        request
    }
}

/// Account state relevant to revocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    /// Account id.
    pub uid: String,
    /// Sign-in is blocked.
    pub disabled: bool,
    /// Tokens issued before this epoch second are revoked.
    pub valid_since: Option<u64>,
}

#[derive(Deserialize)]
struct RefreshResponse {
    id_token: String,
    refresh_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    id_token: String,
    refresh_token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignInRequest<'a> {
    token: &'a str,
    return_secure_token: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tenant_id: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LookupRequest<'a> {
    local_id: [&'a str; 1],
}

#[derive(Deserialize)]
struct LookupResponse {
    #[serde(default)]
    users: Vec<LookupUser>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupUser {
    local_id: String,
    #[serde(default)]
    disabled: bool,
    valid_since: Option<String>,
}

/// Calls the token refresh, custom token exchange and account lookup
/// endpoints for one project.
#[derive(Debug, Clone)]
pub struct IdentityClient {
    http: reqwest::Client,
    endpoints: Endpoints,
    api_key: String,
    tenant_id: Option<String>,
}

impl IdentityClient {
    /// Client for `api_key` against `endpoints`.
    pub fn new(
        http: reqwest::Client,
        endpoints: Endpoints,
        api_key: impl Into<String>,
        tenant_id: Option<String>,
    ) -> Self {
        Self {
            http,
            endpoints,
            api_key: api_key.into(),
            tenant_id,
        }
    }

    /// The configured endpoints.
    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Exchange a refresh token for a new id and refresh token.
    ///
    /// # Errors
    /// A classified auth error when the provider rejects the token,
    /// otherwise an operational error.
    #[instrument(skip_all)]
    pub async fn refresh_id_token(
        &self,
        refresh_token: &str,
        ctx: &RequestContext,
    ) -> Result<CustomTokens> {
        let request = self
            .http
            .post(self.endpoints.refresh_url(&self.api_key))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ]);
        let body: RefreshResponse = send(ctx.apply(request)).await?;
        debug!("refreshed id token");
        Ok(CustomTokens::new(body.id_token, body.refresh_token))
    }

    /// Exchange a custom token for an id and refresh token.
    ///
    /// # Errors
    /// A classified auth error when the provider rejects the token,
    /// otherwise an operational error.
    #[instrument(skip_all)]
    pub async fn exchange_custom_token(
        &self,
        custom_token: &str,
        ctx: &RequestContext,
    ) -> Result<CustomTokens> {
        let request = self
            .http
            .post(self.endpoints.custom_token_url(&self.api_key))
            .json(&SignInRequest {
                token: custom_token,
                return_secure_token: true,
                tenant_id: self.tenant_id.as_deref(),
            });
        let body: SignInResponse = send(ctx.apply(request)).await?;
        Ok(CustomTokens::new(body.id_token, body.refresh_token))
    }

    /// Account state of `uid`, authorised with `access_token`.
    ///
    /// # Errors
    /// `USER_NOT_FOUND` when the account does not exist, otherwise an
    /// operational error.
    #[instrument(skip(self, access_token))]
    pub async fn lookup_account(
        &self,
        project_id: &str,
        uid: &str,
        access_token: &str,
    ) -> Result<AccountRecord> {
        let request = self
            .http
            .post(self.endpoints.lookup_url(project_id, self.tenant_id.as_deref()))
            .bearer_auth(access_token)
            .json(&LookupRequest { local_id: [uid] });
        let body: LookupResponse = send(request).await?;

        let user = body
            .users
            .into_iter()
            .find(|u| u.local_id == uid)
            .ok_or_else(|| {
                Error::auth(
                    AuthErrorCode::UserNotFound,
                    format!("no account for uid \"{uid}\""),
                )
            })?;

        let valid_since = match user.valid_since.as_deref() {
            Some(raw) => Some(raw.parse::<u64>().map_err(|_| Error::Upstream {
                status: 200,
                message: format!("validSince is not a number: {raw}"),
            })?),
            None => None,
        };

        Ok(AccountRecord {
            uid: user.local_id,
            disabled: user.disabled,
            valid_since,
        })
    }
}

async fn send<T: DeserializeOwned>(request: reqwest::RequestBuilder) -> Result<T> {
    let resp = request.send().await?;
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }

    let text = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or(text);

    match classify(&message) {
        Some(code) => {
            debug!(%code, "upstream rejected credential");
            Err(Error::auth(code, message))
        }
        None => {
            warn!(status = status.as_u16(), %message, "upstream call failed");
            Err(Error::Upstream {
                status: status.as_u16(),
                message,
            })
        }
    }
}

/// Map an upstream error message such as `TOKEN_EXPIRED : detail` to a code.
fn classify(message: &str) -> Option<AuthErrorCode> {
    let head = message
        .split(|c: char| c == ':' || c.is_whitespace())
        .next()
        .unwrap_or_default();
    match head {
        "USER_NOT_FOUND" => Some(AuthErrorCode::UserNotFound),
        "USER_DISABLED" => Some(AuthErrorCode::UserDisabled),
        "TOKEN_EXPIRED"
        | "INVALID_REFRESH_TOKEN"
        | "INVALID_GRANT_TYPE"
        | "MISSING_REFRESH_TOKEN"
        | "INVALID_CUSTOM_TOKEN"
        | "CREDENTIAL_MISMATCH"
        | "INVALID_ID_TOKEN" => Some(AuthErrorCode::InvalidCredential),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_upstream_messages() {
        assert_eq!(classify("USER_NOT_FOUND"), Some(AuthErrorCode::UserNotFound));
        assert_eq!(classify("USER_DISABLED"), Some(AuthErrorCode::UserDisabled));
        assert_eq!(
            classify("TOKEN_EXPIRED : refresh token expired"),
            Some(AuthErrorCode::InvalidCredential)
        );
        assert_eq!(classify("INVALID_REFRESH_TOKEN"), Some(AuthErrorCode::InvalidCredential));
        assert_eq!(classify("QUOTA_EXCEEDED"), None);
        assert_eq!(classify(""), None);
    }

    #[test]
    fn emulator_urls() {
        let e = Endpoints::emulator("127.0.0.1:9099");
        assert_eq!(
            e.refresh_url("k"),
            "http://127.0.0.1:9099/securetoken.googleapis.com/v1/token?key=k"
        );
        assert_eq!(
            e.custom_token_url("k"),
            "http://127.0.0.1:9099/identitytoolkit.googleapis.com/v1/accounts:signInWithCustomToken?key=k"
        );
        assert_eq!(
            e.lookup_url("p", Some("t")),
            "http://127.0.0.1:9099/identitytoolkit.googleapis.com/v1/projects/p/tenants/t/accounts:lookup"
        );
    }
}
