//! Token-set storage in cookies.
//!
//! Three layouts exist on the wire for a configured name `n`:
//!
//! - single: `n` holds one HS256 token whose payload is the [`CustomTokens`];
//! - multiple: `n.id`, `n.refresh`, `n.custom`, `n.metadata` hold the values
//!   in plain text and `n.sig` an HMAC over `id:refresh:custom:metadata`
//!   (absent values are empty);
//! - legacy: `n` holds `id:refresh` next to `n.custom` and `n.sig`.
//!
//! Legacy sets are read but never written. Responses always carry the
//! configured layout and expire every other name.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::cookie::{Cookie, RequestCookies, ResponseCookie};
use crate::error::InvalidTokenReason;
use crate::rotating::RotatingCredential;
use crate::{Error, Result};

/// The token set this crate protects.
///
/// Field order is the serialized member order of the single-cookie payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomTokens {
    /// Provider id token.
    pub id_token: String,
    /// Provider refresh token.
    pub refresh_token: String,
    /// Custom token minted for the same account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_token: Option<String>,
    /// Application data stored alongside the tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, Value>>,
}

impl CustomTokens {
    /// Id and refresh token only.
    pub fn new(id_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            id_token: id_token.into(),
            refresh_token: refresh_token.into(),
            custom_token: None,
            metadata: None,
        }
    }

    fn metadata_if_any(&self) -> Option<&BTreeMap<String, Value>> {
        self.metadata.as_ref().filter(|m| !m.is_empty())
    }
}

/// The layout a request's cookies are stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieLayout {
    /// One signed cookie.
    Single,
    /// Discrete cookies plus `.sig`.
    Multiple,
    /// `id:refresh` in the bare cookie.
    Legacy,
    /// Nothing usable.
    Absent,
}

const ID: &str = "id";
const REFRESH: &str = "refresh";
const CUSTOM: &str = "custom";
const METADATA: &str = "metadata";
const SIG: &str = "sig";
const SUFFIXES: [&str; 5] = [ID, REFRESH, CUSTOM, METADATA, SIG];

fn part(name: &str, suffix: &str) -> String {
    format!("{name}.{suffix}")
}

fn present<'a>(cookies: &'a RequestCookies, name: &str) -> Option<&'a str> {
    cookies.get(name).filter(|v| !v.is_empty())
}

impl CookieLayout {
    /// Which layout the cookies for `name` are in.
    ///
    /// Decided only by which names carry a non-empty value. When both a
    /// bare cookie and `.id`/`.refresh` are present the configured layout
    /// wins.
    pub fn detect(cookies: &RequestCookies, name: &str, prefer_multiple: bool) -> Self {
        let has_multiple = present(cookies, &part(name, ID)).is_some()
            || present(cookies, &part(name, REFRESH)).is_some();
        let bare = present(cookies, name).map(|v| {
            if v.contains(':') {
                CookieLayout::Legacy
            } else {
                CookieLayout::Single
            }
        });

        match (has_multiple, bare) {
            (true, Some(_)) if prefer_multiple => CookieLayout::Multiple,
            (_, Some(layout)) => layout,
            (true, None) => CookieLayout::Multiple,
            (false, None) => CookieLayout::Absent,
        }
    }
}

/// Writes the configured layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieBuilder {
    /// One signed cookie.
    Single,
    /// Discrete cookies plus `.sig`.
    Multiple,
}

impl CookieBuilder {
    /// The layout this builder writes.
    pub fn layout(self) -> CookieLayout {
        match self {
            CookieBuilder::Single => CookieLayout::Single,
            CookieBuilder::Multiple => CookieLayout::Multiple,
        }
    }

    /// Cookies holding `tokens`. Same input and key list, same bytes.
    ///
    /// # Errors
    /// Serialization or signing failure.
    pub fn build(
        self,
        name: &str,
        tokens: &CustomTokens,
        credential: &RotatingCredential,
    ) -> Result<Vec<Cookie>> {
        match self {
            CookieBuilder::Single => {
                let value = credential.sign(&CustomTokens {
                    metadata: tokens.metadata_if_any().cloned(),
                    ..tokens.clone()
                })?;
                Ok(vec![Cookie::new(name, value)])
            }
            CookieBuilder::Multiple => {
                let metadata = tokens
                    .metadata_if_any()
                    .map(encode_metadata)
                    .transpose()?;
                let custom = tokens.custom_token.as_deref();
                let signature = credential.create_signature(&signature_message(
                    &tokens.id_token,
                    &tokens.refresh_token,
                    custom,
                    metadata.as_deref(),
                ))?;

                let mut out = vec![
                    Cookie::new(part(name, ID), tokens.id_token.clone()),
                    Cookie::new(part(name, REFRESH), tokens.refresh_token.clone()),
                ];
                if let Some(custom) = custom {
                    out.push(Cookie::new(part(name, CUSTOM), custom));
                }
                if let Some(metadata) = metadata {
                    out.push(Cookie::new(part(name, METADATA), metadata));
                }
                out.push(Cookie::new(part(name, SIG), signature));
                Ok(out)
            }
        }
    }
}

/// Reads one detected layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieParser {
    /// One signed cookie.
    Single,
    /// Discrete cookies plus `.sig`.
    Multiple,
    /// `id:refresh` plus `.custom`/`.sig`, adapted into the multiple parser.
    Legacy,
}

/// Values the multiple-cookie parser consumes.
struct MultipleInput<'a> {
    id: Option<&'a str>,
    refresh: Option<&'a str>,
    custom: Option<&'a str>,
    metadata: Option<&'a str>,
    sig: Option<&'a str>,
}

impl CookieParser {
    /// Parser for `layout`; `None` when nothing is stored.
    pub fn for_layout(layout: CookieLayout) -> Option<Self> {
        match layout {
            CookieLayout::Single => Some(CookieParser::Single),
            CookieLayout::Multiple => Some(CookieParser::Multiple),
            CookieLayout::Legacy => Some(CookieParser::Legacy),
            CookieLayout::Absent => None,
        }
    }

    /// Parse and integrity-check the token set stored under `name`.
    ///
    /// # Errors
    /// `InvalidToken` with `Missing`, `Malformed` or `InvalidSignature`.
    pub fn parse(
        self,
        cookies: &RequestCookies,
        name: &str,
        credential: &RotatingCredential,
        require_custom: bool,
    ) -> Result<CustomTokens> {
        let tokens = match self {
            CookieParser::Single => {
                let value = present(cookies, name).ok_or(missing())?;
                credential.verify::<CustomTokens>(value).map_err(|e| match e {
                    Error::SignatureMismatch => {
                        Error::InvalidToken(InvalidTokenReason::InvalidSignature)
                    }
                    other => other,
                })?
            }
            CookieParser::Multiple => parse_multiple(
                &MultipleInput {
                    id: present(cookies, &part(name, ID)),
                    refresh: present(cookies, &part(name, REFRESH)),
                    custom: present(cookies, &part(name, CUSTOM)),
                    metadata: present(cookies, &part(name, METADATA)),
                    sig: present(cookies, &part(name, SIG)),
                },
                credential,
            )?,
            CookieParser::Legacy => {
                let value = present(cookies, name).ok_or(missing())?;
                let (id, refresh) = value
                    .split_once(':')
                    .filter(|(id, refresh)| !id.is_empty() && !refresh.is_empty())
                    .ok_or(Error::InvalidToken(InvalidTokenReason::Malformed))?;
                debug!(cookie = name, "reading legacy cookie layout");
                parse_multiple(
                    &MultipleInput {
                        id: Some(id),
                        refresh: Some(refresh),
                        custom: present(cookies, &part(name, CUSTOM)),
                        metadata: None,
                        sig: present(cookies, &part(name, SIG)),
                    },
                    credential,
                )?
            }
        };

        if require_custom && tokens.custom_token.is_none() {
            return Err(missing());
        }
        Ok(tokens)
    }
}

fn missing() -> Error {
    Error::InvalidToken(InvalidTokenReason::Missing)
}

fn parse_multiple(
    input: &MultipleInput<'_>,
    credential: &RotatingCredential,
) -> Result<CustomTokens> {
    let (Some(id), Some(refresh), Some(sig)) = (input.id, input.refresh, input.sig) else {
        return Err(missing());
    };

    let message = signature_message(id, refresh, input.custom, input.metadata);
    credential
        .verify_signature(&message, sig)
        .map_err(|_| Error::InvalidToken(InvalidTokenReason::InvalidSignature))?;

    let metadata = input.metadata.map(decode_metadata).transpose()?;

    Ok(CustomTokens {
        id_token: id.to_string(),
        refresh_token: refresh.to_string(),
        custom_token: input.custom.map(str::to_string),
        metadata,
    })
}

fn signature_message(
    id: &str,
    refresh: &str,
    custom: Option<&str>,
    metadata: Option<&str>,
) -> String {
    [
        id,
        refresh,
        custom.unwrap_or_default(),
        metadata.unwrap_or_default(),
    ]
    .join(":")
}

fn encode_metadata(metadata: &BTreeMap<String, Value>) -> Result<String> {
    Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(metadata)?))
}

fn decode_metadata(value: &str) -> Result<BTreeMap<String, Value>> {
    let malformed = || Error::InvalidToken(InvalidTokenReason::Malformed);
    let bytes = URL_SAFE_NO_PAD.decode(value).map_err(|_| malformed())?;
    serde_json::from_slice(&bytes).map_err(|_| malformed())
}

/// Reads and writes token sets for one cookie name.
#[derive(Debug, Clone)]
pub struct CookieCodec {
    name: String,
    credential: RotatingCredential,
    builder: CookieBuilder,
    require_custom: bool,
}

impl CookieCodec {
    /// Codec for `name` writing `builder`'s layout.
    ///
    /// With `require_custom`, sets without a custom token count as missing.
    pub fn new(
        name: impl Into<String>,
        credential: RotatingCredential,
        builder: CookieBuilder,
        require_custom: bool,
    ) -> Self {
        Self {
            name: name.into(),
            credential,
            builder,
            require_custom,
        }
    }

    /// Configured cookie name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The signing credential.
    pub fn credential(&self) -> &RotatingCredential {
        &self.credential
    }

    /// Layout of the stored set in `cookies`.
    pub fn layout(&self, cookies: &RequestCookies) -> CookieLayout {
        CookieLayout::detect(cookies, &self.name, self.builder == CookieBuilder::Multiple)
    }

    /// True when `cookies` hold a set in a layout other than the written one.
    pub fn needs_migration(&self, cookies: &RequestCookies) -> bool {
        let layout = self.layout(cookies);
        layout != CookieLayout::Absent && layout != self.builder.layout()
    }

    /// Parse the stored token set.
    ///
    /// # Errors
    /// `InvalidToken` with `Missing`, `Malformed` or `InvalidSignature`.
    pub fn parse(&self, cookies: &RequestCookies) -> Result<CustomTokens> {
        let parser = CookieParser::for_layout(self.layout(cookies)).ok_or(missing())?;
        parser.parse(cookies, &self.name, &self.credential, self.require_custom)
    }

    /// Response cookies storing `tokens` and expiring every other name.
    ///
    /// # Errors
    /// Serialization or signing failure.
    pub fn response_cookies(&self, tokens: &CustomTokens) -> Result<Vec<ResponseCookie>> {
        let set = self.builder.build(&self.name, tokens, &self.credential)?;
        let mut out: Vec<ResponseCookie> = Vec::with_capacity(self.all_names().len());
        for name in self.all_names() {
            if !set.iter().any(|c| c.name == name) {
                out.push(ResponseCookie::Expire(name));
            }
        }
        let mut live: Vec<ResponseCookie> = set.into_iter().map(ResponseCookie::Set).collect();
        live.append(&mut out);
        Ok(live)
    }

    /// Expire every name any layout uses (logout).
    pub fn expire_all(&self) -> Vec<ResponseCookie> {
        self.all_names()
            .into_iter()
            .map(ResponseCookie::Expire)
            .collect()
    }

    fn all_names(&self) -> Vec<String> {
        std::iter::once(self.name.clone())
            .chain(SUFFIXES.iter().map(|s| part(&self.name, s)))
            .collect()
    }
}
