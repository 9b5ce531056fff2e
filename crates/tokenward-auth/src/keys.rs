//! Public key resolution.
//!
//! Keys come from a JWKS endpoint or from a legacy map of `kid → X.509 PEM`.
//! Fetched sets are cached per URL for the `max-age` the server advertises.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, instrument};

use crate::asn1::{self, OID_RSA_ENCRYPTION};
use crate::clock::{Clock, SystemClock};
use crate::{Error, Result};

/// Minimal JWK structure; only RSA members are read.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    /// Key type.
    pub kty: String,

    /// Key id.
    pub kid: Option<String>,

    /// Algorithm (optional).
    pub alg: Option<String>,

    /// RSA modulus.
    pub n: Option<String>,

    /// RSA exponent.
    pub e: Option<String>,
}

/// A JWKS (JSON Web Key Set).
#[derive(Debug, Clone, Deserialize)]
pub struct JwksDocument {
    /// Keys.
    pub keys: Vec<Jwk>,
}

/// A usable verification key.
#[derive(Clone)]
pub struct PublicKey {
    /// Key id, when published with one.
    pub kid: Option<String>,
    /// Key material for `jsonwebtoken::crypto::verify`.
    pub key: DecodingKey,
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey").field("kid", &self.kid).finish()
    }
}

/// The keys published by one endpoint.
#[derive(Debug, Clone, Default)]
pub struct KeySet {
    keys: Vec<PublicKey>,
}

impl KeySet {
    /// Wrap already imported keys.
    pub fn new(keys: Vec<PublicKey>) -> Self {
        Self { keys }
    }

    /// Parse a JWKS document. Non-RSA keys are skipped.
    ///
    /// # Errors
    /// Fails on invalid JSON or an RSA key missing `n`/`e`.
    pub fn from_jwks_json(json: &str) -> Result<Self> {
        let doc: JwksDocument = serde_json::from_str(json)?;
        let mut keys = Vec::with_capacity(doc.keys.len());
        for jwk in &doc.keys {
            if jwk.kty != "RSA" {
                debug!(kty = %jwk.kty, kid = ?jwk.kid, "skipping non-RSA key");
                continue;
            }
            keys.push(PublicKey {
                kid: jwk.kid.clone(),
                key: rsa_key_from_jwk(jwk)?,
            });
        }
        Ok(Self { keys })
    }

    /// Parse a `{ "<kid>": "<PEM certificate>" }` map.
    ///
    /// # Errors
    /// Fails on invalid JSON, malformed certificates, or non-RSA keys.
    pub fn from_x509_json(json: &str) -> Result<Self> {
        let certs: BTreeMap<String, String> = serde_json::from_str(json)?;
        let mut keys = Vec::with_capacity(certs.len());
        for (kid, pem) in certs {
            keys.push(PublicKey {
                key: rsa_key_from_certificate(&pem)?,
                kid: Some(kid),
            });
        }
        Ok(Self { keys })
    }

    /// Key with this id.
    pub fn get(&self, kid: &str) -> Option<&PublicKey> {
        self.keys.iter().find(|k| k.kid.as_deref() == Some(kid))
    }

    /// All keys, in publication order.
    pub fn iter(&self) -> impl Iterator<Item = &PublicKey> {
        self.keys.iter()
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True when no key was published.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

fn rsa_key_from_jwk(jwk: &Jwk) -> Result<DecodingKey> {
    let n = jwk
        .n
        .as_deref()
        .ok_or_else(|| Error::Keys("RSA JWK missing n".to_string()))?;
    let e = jwk
        .e
        .as_deref()
        .ok_or_else(|| Error::Keys("RSA JWK missing e".to_string()))?;
    Ok(DecodingKey::from_rsa_components(n, e)?)
}

/// Import the RSA key of a PEM certificate via its `SubjectPublicKeyInfo`.
///
/// # Errors
/// Fails on malformed DER or a non-RSA key algorithm.
pub fn rsa_key_from_certificate(pem: &str) -> Result<DecodingKey> {
    let der = asn1::pem_to_der(pem)?;
    let info = asn1::subject_public_key_info(&der)?;
    import_spki(&info)
}

/// Import a bare DER `SubjectPublicKeyInfo` (RSA only).
///
/// # Errors
/// Fails on malformed DER or a non-RSA key algorithm.
pub fn rsa_key_from_spki(der: &[u8]) -> Result<DecodingKey> {
    let info = asn1::parse_subject_public_key_info(der)?;
    import_spki(&info)
}

fn import_spki(info: &asn1::PublicKeyInfo) -> Result<DecodingKey> {
    if info.algorithm != OID_RSA_ENCRYPTION {
        return Err(Error::Keys(format!(
            "unsupported key algorithm: {}",
            info.algorithm
        )));
    }
    Ok(DecodingKey::from_rsa_der(&info.public_key))
}

/// A cached key set and the instant it goes stale.
#[derive(Debug, Clone)]
pub struct PublicKeyCacheEntry {
    /// Keys.
    pub keys: Arc<KeySet>,
    /// Epoch milliseconds; `0` means always stale.
    pub expires_at_ms: u64,
}

/// Key sets keyed by the URL they were fetched from.
///
/// Entries are replaced whole, so a concurrent reader sees either the old or
/// the new set. Staleness is checked on read; nothing is swept.
#[derive(Debug)]
pub struct PublicKeyCache {
    entries: DashMap<String, Arc<PublicKeyCacheEntry>>,
    clock: Arc<dyn Clock>,
}

impl Default for PublicKeyCache {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl PublicKeyCache {
    /// Empty cache on `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// The entry for `url` if it has not expired.
    pub fn get_fresh(&self, url: &str) -> Option<Arc<PublicKeyCacheEntry>> {
        let entry = self.entries.get(url)?;
        if entry.expires_at_ms > self.clock.now_ms() {
            Some(Arc::clone(entry.value()))
        } else {
            None
        }
    }

    /// Store `keys` for `url` for `max_age_seconds` (`None`: always stale).
    pub fn insert(
        &self,
        url: &str,
        keys: Arc<KeySet>,
        max_age_seconds: Option<u64>,
    ) -> Arc<PublicKeyCacheEntry> {
        let expires_at_ms = max_age_seconds.map_or(0, |secs| {
            self.clock
                .now_ms()
                .saturating_add(secs.saturating_mul(1000))
        });
        let entry = Arc::new(PublicKeyCacheEntry {
            keys,
            expires_at_ms,
        });
        self.entries.insert(url.to_string(), Arc::clone(&entry));
        entry
    }

    /// Drop the entry for `url`.
    pub fn invalidate(&self, url: &str) {
        self.entries.remove(url);
    }

    /// Number of stored entries, fresh or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Where verification keys come from.
#[derive(Debug, Clone)]
pub enum KeySource {
    /// A JWKS endpoint.
    Jwks(String),
    /// A JSON map of key id to X.509 PEM certificate.
    X509(String),
    /// A fixed set, never fetched.
    Static(Arc<KeySet>),
}

impl KeySource {
    fn url(&self) -> Option<&str> {
        match self {
            KeySource::Jwks(url) | KeySource::X509(url) => Some(url),
            KeySource::Static(_) => None,
        }
    }
}

/// Fetches and caches keys for one [`KeySource`].
#[derive(Debug, Clone)]
pub struct KeyResolver {
    source: KeySource,
    cache: Arc<PublicKeyCache>,
    http: reqwest::Client,
}

impl KeyResolver {
    /// Resolver for `source` backed by `cache`.
    pub fn new(source: KeySource, cache: Arc<PublicKeyCache>, http: reqwest::Client) -> Self {
        Self {
            source,
            cache,
            http,
        }
    }

    /// The configured source.
    pub fn source(&self) -> &KeySource {
        &self.source
    }

    /// Current keys and their expiry, fetching on a miss or stale entry.
    ///
    /// # Errors
    /// Network failures and malformed bodies propagate as operational errors.
    #[instrument(skip(self), fields(url = self.source.url().unwrap_or("static")))]
    pub async fn fetch_keys(&self) -> Result<PublicKeyCacheEntry> {
        let url = match &self.source {
            KeySource::Static(keys) => {
                return Ok(PublicKeyCacheEntry {
                    keys: Arc::clone(keys),
                    expires_at_ms: u64::MAX,
                });
            }
            KeySource::Jwks(url) | KeySource::X509(url) => url,
        };

        if let Some(entry) = self.cache.get_fresh(url) {
            debug!("key cache hit");
            return Ok((*entry).clone());
        }

        let (body, max_age) = fetch_with_cache_control(&self.http, url).await?;
        let keys = match &self.source {
            KeySource::X509(_) => KeySet::from_x509_json(&body)?,
            _ => KeySet::from_jwks_json(&body)?,
        };
        debug!(keys = keys.len(), max_age = ?max_age, "fetched public keys");

        let entry = self.cache.insert(url, Arc::new(keys), max_age);
        Ok((*entry).clone())
    }
}

async fn fetch_with_cache_control(
    http: &reqwest::Client,
    url: &str,
) -> Result<(String, Option<u64>)> {
    use reqwest::header;

    let resp = http.get(url).send().await?;
    if !resp.status().is_success() {
        return Err(Error::Keys(format!("fetch failed: {}", resp.status())));
    }

    let max_age = resp
        .headers()
        .get(header::CACHE_CONTROL)
        .and_then(|h| h.to_str().ok())
        .and_then(parse_cache_control_max_age);

    let text = resp.text().await?;
    Ok((text, max_age))
}

fn parse_cache_control_max_age(cc: &str) -> Option<u64> {
    for part in cc.split(',') {
        let p = part.trim();
        if let Some(rest) = p.strip_prefix("max-age=") {
            if let Ok(n) = rest.trim().parse::<u64>() {
                return Some(n);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;

    const JWKS: &str = include_str!("../tests/fixtures/jwks.json");
    const CERT_PEM: &str = include_str!("../tests/fixtures/signing_cert.pem");

    #[test]
    fn cache_control_parser() {
        assert_eq!(parse_cache_control_max_age("public, max-age=60"), Some(60));
        assert_eq!(parse_cache_control_max_age("max-age=0"), Some(0));
        assert_eq!(parse_cache_control_max_age("no-store"), None);
    }

    #[test]
    fn jwks_parsing_keeps_kids() {
        let set = KeySet::from_jwks_json(JWKS).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.get("key-1").is_some());
        assert!(set.get("key-3").is_none());
    }

    #[test]
    fn jwks_skips_non_rsa() {
        let json = r#"{"keys":[{"kty":"EC","kid":"ec","crv":"P-256","x":"a","y":"b"}]}"#;
        assert!(KeySet::from_jwks_json(json).unwrap().is_empty());
    }

    #[test]
    fn x509_map_parsing() {
        let json = serde_json::json!({ "cert-1": CERT_PEM }).to_string();
        let set = KeySet::from_x509_json(&json).unwrap();
        assert!(set.get("cert-1").is_some());
    }

    #[test]
    fn x509_map_rejects_garbage_certificate() {
        let json = serde_json::json!({
            "bad": "-----BEGIN CERTIFICATE-----\nMAMCAQE=\n-----END CERTIFICATE-----\n"
        })
        .to_string();
        assert!(matches!(
            KeySet::from_x509_json(&json),
            Err(Error::Asn1(_))
        ));
    }

    #[test]
    fn cache_entry_expiry() {
        let clock = Arc::new(FixedClock::new(10_000));
        let cache = PublicKeyCache::new(clock.clone());
        let keys = Arc::new(KeySet::default());

        cache.insert("https://keys", Arc::clone(&keys), Some(60));
        assert!(cache.get_fresh("https://keys").is_some());

        clock.advance(std::time::Duration::from_secs(60));
        assert!(cache.get_fresh("https://keys").is_none());

        let entry = cache.insert("https://keys", keys, None);
        assert_eq!(entry.expires_at_ms, 0);
        assert!(cache.get_fresh("https://keys").is_none());
    }
}
