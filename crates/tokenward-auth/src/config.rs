//! Configuration loading: TOML file, then `TOKENWARD_*` environment overrides.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::cookie::CookieOptions;
use crate::credential::ServiceAccount;
use crate::identity::Endpoints;
use crate::keys::KeySource;
use crate::token::VerifyOptions;
use crate::{Error, Result};

/// JWKS of the secure token service.
pub const DEFAULT_JWKS_URL: &str =
    "https://www.googleapis.com/service_accounts/v1/jwk/securetoken@system.gserviceaccount.com";

/// Legacy `kid → certificate` map of the secure token service.
pub const DEFAULT_X509_URL: &str =
    "https://www.googleapis.com/robot/v1/metadata/x509/securetoken@system.gserviceaccount.com";

const ENV_PREFIX: &str = "TOKENWARD_";

/// Which publication format verification keys are fetched in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySourceKind {
    /// JSON Web Key Set.
    #[default]
    Jwks,
    /// Map of key id to X.509 certificate.
    X509,
}

/// Everything the auth engine needs to know about a deployment.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Project whose id tokens are accepted (`aud`, `iss` suffix).
    pub project_id: String,
    /// Web API key sent with refresh and sign-in calls.
    pub api_key: String,
    /// Tenant that tokens must belong to, if any.
    pub tenant_id: Option<String>,

    /// Base cookie name; the multiple layout appends suffixes.
    pub cookie_name: String,
    /// Ordered; the first key signs.
    pub cookie_signature_keys: Vec<String>,
    /// Attributes of every cookie written.
    pub cookie: CookieOptions,
    /// Write one cookie per token instead of a single signed cookie.
    pub enable_multiple_cookies: bool,
    /// Mint and store a custom token alongside the id and refresh tokens.
    pub enable_custom_token: bool,

    /// Look the account up on every verification to catch revocation.
    pub check_revoked: bool,
    /// See [`VerifyOptions::unsafe_expire_on_invalid_kid`].
    pub unsafe_expire_on_invalid_kid: bool,

    /// `host:port` of a local emulator; switches off signature checks.
    pub emulator_host: Option<String>,

    /// Publication format of the verification keys.
    pub key_source: KeySourceKind,
    /// Overrides the key URL implied by `key_source`.
    pub keys_url: Option<String>,
    /// Overrides the production upstream endpoints.
    pub endpoints: Option<Endpoints>,
    /// Overrides the OAuth token endpoint used by the service account.
    pub oauth_token_url: Option<String>,

    /// Signs custom tokens and authenticates admin calls; the metadata
    /// server is used when absent.
    pub service_account: Option<ServiceAccount>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            api_key: String::new(),
            tenant_id: None,
            cookie_name: "AuthToken".to_string(),
            cookie_signature_keys: Vec::new(),
            cookie: CookieOptions::default(),
            enable_multiple_cookies: false,
            enable_custom_token: false,
            check_revoked: false,
            unsafe_expire_on_invalid_kid: false,
            emulator_host: None,
            key_source: KeySourceKind::Jwks,
            keys_url: None,
            endpoints: None,
            oauth_token_url: None,
            service_account: None,
        }
    }
}

impl AuthConfig {
    /// Parse TOML.
    ///
    /// # Errors
    /// `Config` on invalid TOML.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("invalid TOML: {e}")))
    }

    /// Read and parse a TOML file.
    ///
    /// # Errors
    /// `Config` when the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("invalid TOML in {}: {e}", path.display())))
    }

    /// Override fields from the process environment.
    ///
    /// # Errors
    /// `Config` on an unparsable boolean.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Override fields from `lookup`, called with full variable names.
    ///
    /// # Errors
    /// `Config` on an unparsable boolean.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.is_empty());
        let flag = |name: &str, target: &mut bool| -> Result<()> {
            if let Some(raw) = var(name) {
                *target = parse_bool(name, &raw)?;
            }
            Ok(())
        };

        if let Some(v) = var("API_KEY") {
            self.api_key = v;
        }
        if let Some(v) = var("PROJECT_ID") {
            self.project_id = v;
        }
        if let Some(v) = var("TENANT_ID") {
            self.tenant_id = Some(v);
        }
        if let Some(v) = var("COOKIE_NAME") {
            self.cookie_name = v;
        }
        if let Some(v) = var("COOKIE_SIGNATURE_KEYS") {
            self.cookie_signature_keys = v.split(',').map(|k| k.trim().to_string()).collect();
        }
        if let Some(v) = var("EMULATOR_HOST") {
            self.emulator_host = Some(v);
        }
        flag("ENABLE_MULTIPLE_COOKIES", &mut self.enable_multiple_cookies)?;
        flag("ENABLE_CUSTOM_TOKEN", &mut self.enable_custom_token)?;
        flag("CHECK_REVOKED", &mut self.check_revoked)?;
        flag("UNSAFE_EXPIRE_ON_INVALID_KID", &mut self.unsafe_expire_on_invalid_kid)?;
        Ok(())
    }

    /// Reject configurations the engine cannot run with.
    ///
    /// # Errors
    /// `Config` naming the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.project_id.trim().is_empty() {
            return Err(Error::Config("project_id is required".to_string()));
        }
        if self.api_key.trim().is_empty() {
            return Err(Error::Config("api_key is required".to_string()));
        }
        if self.cookie_signature_keys.is_empty() {
            return Err(Error::Config("cookie_signature_keys must not be empty".to_string()));
        }
        if self.cookie_signature_keys.iter().any(String::is_empty) {
            return Err(Error::Config(
                "cookie_signature_keys must not contain empty keys".to_string(),
            ));
        }
        if self.cookie_name.is_empty()
            || self
                .cookie_name
                .chars()
                .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '=' | ';' | ',' | '"'))
        {
            return Err(Error::Config(format!("invalid cookie name \"{}\"", self.cookie_name)));
        }
        self.cookie.validate_for(&self.cookie_name)?;
        Ok(())
    }

    /// True when an emulator host is configured.
    pub fn is_emulator(&self) -> bool {
        self.emulator_host.is_some()
    }

    /// Where verification keys come from.
    pub fn key_source(&self) -> KeySource {
        let default = match self.key_source {
            KeySourceKind::Jwks => DEFAULT_JWKS_URL,
            KeySourceKind::X509 => DEFAULT_X509_URL,
        };
        let url = self.keys_url.clone().unwrap_or_else(|| default.to_string());
        match self.key_source {
            KeySourceKind::Jwks => KeySource::Jwks(url),
            KeySourceKind::X509 => KeySource::X509(url),
        }
    }

    /// Upstream endpoints; the emulator host wins over any override.
    pub fn endpoints(&self) -> Endpoints {
        match (&self.emulator_host, &self.endpoints) {
            (Some(host), _) => Endpoints::emulator(host),
            (None, Some(endpoints)) => endpoints.clone(),
            (None, None) => Endpoints::production(),
        }
    }

    /// Per-request options derived from the configured flags.
    pub fn verify_options(&self) -> VerifyOptions {
        VerifyOptions {
            check_revoked: self.check_revoked,
            unsafe_expire_on_invalid_kid: self.unsafe_expire_on_invalid_kid,
            ..VerifyOptions::default()
        }
    }
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!(
            "{ENV_PREFIX}{name} must be a boolean, got \"{raw}\""
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const TOML: &str = r#"
project_id = "demo"
api_key = "api-key"
cookie_name = "__Host-session"
cookie_signature_keys = ["new", "old"]
enable_multiple_cookies = true
key_source = "x509"

[cookie]
same_site = "strict"
max_age_seconds = 3600
"#;

    #[test]
    fn parses_toml() {
        let cfg = AuthConfig::from_toml_str(TOML).unwrap();
        assert_eq!(cfg.project_id, "demo");
        assert_eq!(cfg.cookie_signature_keys, ["new", "old"]);
        assert!(cfg.enable_multiple_cookies);
        assert_eq!(cfg.cookie.max_age_seconds, Some(3600));
        assert!(cfg.cookie.secure);
        assert!(matches!(cfg.key_source(), KeySource::X509(url) if url == DEFAULT_X509_URL));
        cfg.validate().unwrap();
    }

    #[test]
    fn env_overrides_file() {
        let mut cfg = AuthConfig::from_toml_str(TOML).unwrap();
        let env: HashMap<&str, &str> = HashMap::from([
            ("TOKENWARD_PROJECT_ID", "other"),
            ("TOKENWARD_COOKIE_SIGNATURE_KEYS", "k3, k2"),
            ("TOKENWARD_ENABLE_MULTIPLE_COOKIES", "false"),
            ("TOKENWARD_EMULATOR_HOST", "localhost:9099"),
            ("TOKENWARD_CHECK_REVOKED", "1"),
        ]);
        cfg.apply_env_from(|k| env.get(k).map(|v| (*v).to_string()))
            .unwrap();

        assert_eq!(cfg.project_id, "other");
        assert_eq!(cfg.cookie_signature_keys, ["k3", "k2"]);
        assert!(!cfg.enable_multiple_cookies);
        assert!(cfg.verify_options().check_revoked);
        assert_eq!(cfg.endpoints(), Endpoints::emulator("localhost:9099"));
    }

    #[test]
    fn bad_boolean_is_config_error() {
        let mut cfg = AuthConfig::default();
        let err = cfg
            .apply_env_from(|k| (k == "TOKENWARD_CHECK_REVOKED").then(|| "maybe".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn validation() {
        let mut cfg = AuthConfig::from_toml_str(TOML).unwrap();
        cfg.cookie_signature_keys.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = AuthConfig::from_toml_str(TOML).unwrap();
        cfg.cookie.domain = Some("example.com".into());
        assert!(cfg.validate().is_err());

        let mut cfg = AuthConfig::from_toml_str(TOML).unwrap();
        cfg.cookie.max_age_seconds = Some(400_000_000_000);
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let mut cfg = AuthConfig::from_toml_str(TOML).unwrap();
        cfg.cookie_name = "bad;name".into();
        assert!(cfg.validate().is_err());

        assert!(AuthConfig::default().validate().is_err());
    }
}
