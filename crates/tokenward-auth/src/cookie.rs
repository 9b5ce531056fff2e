//! Cookie wire helpers: `Set-Cookie` rendering and `Cookie` header parsing.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use httpdate::fmt_http_date;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const HOST_PREFIX: &str = "__Host-";

/// Longest `Max-Age` a user agent honours (400 days).
pub const MAX_COOKIE_AGE_SECS: u64 = 400 * 24 * 60 * 60;

/// 9999-12-31T23:59:59Z, the last instant an HTTP date can express.
const MAX_HTTP_DATE_SECS: u64 = 253_402_300_799;

/// SameSite attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    /// SameSite=Strict
    Strict,
    /// SameSite=Lax
    Lax,
    /// SameSite=None
    None,
}

impl SameSite {
    fn as_str(self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}

/// Attributes applied to every cookie of a set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieOptions {
    /// Cookie path.
    pub path: String,

    /// Optional cookie domain.
    pub domain: Option<String>,

    /// Send on HTTPS only.
    pub secure: bool,

    /// Not accessible to JS.
    pub http_only: bool,

    /// SameSite attribute.
    pub same_site: SameSite,

    /// Max-Age in seconds.
    pub max_age_seconds: Option<u64>,
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            domain: None,
            secure: true,
            http_only: true,
            same_site: SameSite::Lax,
            max_age_seconds: Some(12 * 24 * 60 * 60),
        }
    }
}

impl CookieOptions {
    /// Check that these attributes are legal for a cookie called `name`.
    ///
    /// `Max-Age` is capped at [`MAX_COOKIE_AGE_SECS`]. `__Host-` cookies
    /// need `Path=/`, `Secure` and no `Domain`.
    ///
    /// # Errors
    /// `Config` describing the violated rule.
    pub fn validate_for(&self, name: &str) -> Result<()> {
        if let Some(max_age) = self
            .max_age_seconds
            .filter(|age| *age > MAX_COOKIE_AGE_SECS)
        {
            return Err(Error::Config(format!(
                "cookie max_age_seconds {max_age} exceeds {MAX_COOKIE_AGE_SECS}"
            )));
        }
        if !name.starts_with(HOST_PREFIX) {
            return Ok(());
        }
        if self.path != "/" {
            return Err(Error::Config("__Host- cookies must have Path=/".to_string()));
        }
        if !self.secure {
            return Err(Error::Config("__Host- cookies must be Secure".to_string()));
        }
        if self.domain.is_some() {
            return Err(Error::Config("__Host- cookies must not set Domain".to_string()));
        }
        Ok(())
    }

    fn push_common(&self, parts: &mut Vec<String>) {
        parts.push(format!("Path={}", self.path));

        if let Some(domain) = &self.domain {
            parts.push(format!("Domain={domain}"));
        }
        if self.secure {
            parts.push("Secure".to_string());
        }
        if self.http_only {
            parts.push("HttpOnly".to_string());
        }

        parts.push(format!("SameSite={}", self.same_site.as_str()));
    }
}

/// A name/value pair bound for the wire.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cookie {
    /// Cookie name.
    pub name: String,
    /// Cookie value.
    pub value: String,
}

impl Cookie {
    /// A cookie called `name` holding `value`.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One cookie instruction for the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseCookie {
    /// Store the cookie.
    Set(Cookie),
    /// Remove the named cookie from the client.
    Expire(String),
}

impl ResponseCookie {
    /// The cookie name this instruction targets.
    pub fn name(&self) -> &str {
        match self {
            ResponseCookie::Set(c) => &c.name,
            ResponseCookie::Expire(name) => name,
        }
    }

    /// Render as a `Set-Cookie` header value; `now_ms` anchors `Expires`.
    ///
    /// # Errors
    /// `Config` if the attributes are illegal for the cookie name.
    pub fn render(&self, opts: &CookieOptions, now_ms: u64) -> Result<String> {
        match self {
            ResponseCookie::Set(c) => build_set_cookie(&c.name, &c.value, opts, now_ms),
            ResponseCookie::Expire(name) => build_clear_cookie(name, opts),
        }
    }
}

/// Build a `Set-Cookie` header value.
///
/// # Errors
/// `Config` if the attributes are illegal for `name`.
pub fn build_set_cookie(
    name: &str,
    value: &str,
    opts: &CookieOptions,
    now_ms: u64,
) -> Result<String> {
    opts.validate_for(name)?;

    let mut parts: Vec<String> = Vec::new();
    parts.push(format!("{name}={value}"));
    opts.push_common(&mut parts);

    if let Some(max_age) = opts.max_age_seconds {
        parts.push(format!("Max-Age={max_age}"));
        // Expires for older clients.
        parts.push(format!("Expires={}", fmt_http_date(expires_at(now_ms, max_age)?)));
    }

    Ok(parts.join("; "))
}

fn expires_at(now_ms: u64, max_age: u64) -> Result<SystemTime> {
    let secs = (now_ms / 1000)
        .checked_add(max_age)
        .filter(|secs| *secs <= MAX_HTTP_DATE_SECS)
        .ok_or_else(|| Error::Config("cookie expiry is not representable".to_string()))?;
    UNIX_EPOCH
        .checked_add(Duration::from_secs(secs))
        .ok_or_else(|| Error::Config("cookie expiry is not representable".to_string()))
}

/// Build a `Set-Cookie` header value that clears the cookie.
///
/// # Errors
/// `Config` if the attributes are illegal for `name`.
pub fn build_clear_cookie(name: &str, opts: &CookieOptions) -> Result<String> {
    opts.validate_for(name)?;

    let mut parts: Vec<String> = Vec::new();
    parts.push(format!("{name}="));
    opts.push_common(&mut parts);
    parts.push("Max-Age=0".to_string());
    parts.push(format!("Expires={}", fmt_http_date(UNIX_EPOCH)));

    Ok(parts.join("; "))
}

/// Cookies sent with a request, by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestCookies {
    values: BTreeMap<String, String>,
}

impl RequestCookies {
    /// Empty jar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `Cookie:` header. Pairs without `=` are ignored; the first
    /// occurrence of a name wins.
    pub fn from_header(header: &str) -> Self {
        let mut jar = Self::new();
        for pair in header.split(';') {
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let value = value.trim().trim_matches('"');
            jar.values
                .entry(name.to_string())
                .or_insert_with(|| value.to_string());
        }
        jar
    }

    /// Value of `name`, if sent.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// True if `name` was sent.
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Add or replace a cookie.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    /// True when no cookies were sent.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for RequestCookies {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut jar = Self::new();
        for (name, value) in iter {
            jar.insert(name, value);
        }
        jar
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_cookie_attributes() {
        let opts = CookieOptions {
            max_age_seconds: Some(60),
            ..Default::default()
        };
        let sc = build_set_cookie("session.id", "abc", &opts, 0).unwrap();
        assert_eq!(
            sc,
            "session.id=abc; Path=/; Secure; HttpOnly; SameSite=Lax; Max-Age=60; \
             Expires=Thu, 01 Jan 1970 00:01:00 GMT"
        );
    }

    #[test]
    fn oversized_max_age_is_rejected() {
        let opts = CookieOptions {
            max_age_seconds: Some(400_000_000_000),
            ..Default::default()
        };
        assert!(matches!(opts.validate_for("session"), Err(Error::Config(_))));
        assert!(matches!(
            build_set_cookie("session", "v", &opts, 1_700_000_000_000),
            Err(Error::Config(_))
        ));

        let capped = CookieOptions {
            max_age_seconds: Some(MAX_COOKIE_AGE_SECS),
            ..Default::default()
        };
        assert!(build_set_cookie("session", "v", &capped, 1_700_000_000_000).is_ok());
        // a clock past the HTTP date range fails instead of panicking
        assert!(build_set_cookie("session", "v", &capped, u64::MAX).is_err());
    }

    #[test]
    fn clear_cookie_has_max_age_zero() {
        let opts = CookieOptions::default();
        let sc = build_clear_cookie("session", &opts).unwrap();
        assert!(sc.starts_with("session=;"));
        assert!(sc.contains("Max-Age=0"));
        assert!(sc.ends_with("Expires=Thu, 01 Jan 1970 00:00:00 GMT"));
    }

    #[test]
    fn host_prefix_rules() {
        let mut opts = CookieOptions::default();
        assert!(build_set_cookie("__Host-session", "v", &opts, 0).is_ok());

        opts.domain = Some("example.com".into());
        assert!(matches!(
            build_set_cookie("__Host-session", "v", &opts, 0),
            Err(Error::Config(_))
        ));
        assert!(build_set_cookie("session", "v", &opts, 0).is_ok());

        let insecure = CookieOptions {
            secure: false,
            ..Default::default()
        };
        assert!(build_clear_cookie("__Host-session", &insecure).is_err());
    }

    #[test]
    fn parses_cookie_header() {
        let jar = RequestCookies::from_header("a=1; session.id=x.y.z ; junk; b=\"q\"; a=2");
        assert_eq!(jar.get("a"), Some("1"));
        assert_eq!(jar.get("session.id"), Some("x.y.z"));
        assert_eq!(jar.get("b"), Some("q"));
        assert!(!jar.contains("junk"));
    }

    #[test]
    fn same_site_from_config() {
        let opts: CookieOptions = serde_json::from_str(r#"{"same_site":"strict"}"#).unwrap();
        assert_eq!(opts.same_site, SameSite::Strict);
        assert_eq!(opts.path, "/");
    }
}
