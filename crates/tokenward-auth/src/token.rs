//! Decoded JWTs and per-call verification policy.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::AuthErrorCode;
use crate::{Error, Result};

/// Claims a provider sets on every id token. Everything else is a custom claim.
const STANDARD_CLAIMS: &[&str] = &[
    "aud",
    "auth_time",
    "email",
    "email_verified",
    "exp",
    "firebase",
    "iat",
    "iss",
    "name",
    "nbf",
    "phone_number",
    "picture",
    "sub",
    "uid",
    "user_id",
];

/// JOSE header fields this crate reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtHeader {
    /// Algorithm; kept as a string so `none` survives in emulator mode.
    pub alg: Option<String>,
    /// Key id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    /// Token type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
}

/// A compact JWS split into its parts, nothing verified yet.
#[derive(Debug, Clone)]
pub struct UnverifiedToken {
    /// Parsed header.
    pub header: JwtHeader,
    /// Parsed claims.
    pub claims: Map<String, Value>,
    /// `<header>.<payload>` as it appeared on the wire.
    pub signing_input: String,
    /// Base64url signature segment (empty for unsigned tokens).
    pub signature: String,
}

impl UnverifiedToken {
    /// Split and decode `token` without checking anything but shape.
    ///
    /// # Errors
    /// `INVALID_ARGUMENT` if the token is not a three-part compact JWS with
    /// JSON header and payload.
    pub fn decode(token: &str) -> Result<Self> {
        let malformed = |what: &str| {
            Error::auth(
                AuthErrorCode::InvalidArgument,
                format!("decoding failed: {what}"),
            )
        };

        let mut parts = token.split('.');
        let (Some(header_segment), Some(payload_segment), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed("token must have three segments"));
        };

        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let header_bytes = engine
            .decode(header_segment)
            .map_err(|_| malformed("header is not base64url"))?;
        let payload_bytes = engine
            .decode(payload_segment)
            .map_err(|_| malformed("payload is not base64url"))?;

        let header: JwtHeader =
            serde_json::from_slice(&header_bytes).map_err(|_| malformed("header is not JSON"))?;
        let claims: Map<String, Value> = serde_json::from_slice(&payload_bytes)
            .map_err(|_| malformed("payload is not a JSON object"))?;

        Ok(Self {
            header,
            claims,
            signing_input: format!("{header_segment}.{payload_segment}"),
            signature: signature.to_string(),
        })
    }

    /// Claim by name.
    pub fn claim(&self, key: &str) -> Option<&Value> {
        self.claims.get(key)
    }

    /// `sub` if it is a string.
    pub fn subject(&self) -> Option<&str> {
        self.claim("sub").and_then(Value::as_str)
    }
}

/// A verified id token.
///
/// Produced only by [`crate::TokenVerifier`]; never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedToken {
    /// Header as received.
    pub header: JwtHeader,
    /// `sub`, the account id.
    pub uid: String,
    /// `iss`.
    pub issuer: String,
    /// `aud`.
    pub audience: String,
    /// `exp`, epoch seconds.
    pub expires_at: u64,
    /// `iat`, epoch seconds.
    pub issued_at: u64,
    /// `auth_time`, epoch seconds.
    pub auth_time: Option<u64>,
    /// `firebase.tenant`.
    pub tenant: Option<String>,
    /// Every claim of the token.
    pub claims: Map<String, Value>,
}

impl DecodedToken {
    /// Claim by name.
    pub fn claim(&self, key: &str) -> Option<&Value> {
        self.claims.get(key)
    }

    /// `email`, when present.
    pub fn email(&self) -> Option<&str> {
        self.claim("email").and_then(Value::as_str)
    }

    /// Claims the application added on top of the provider's standard set.
    pub fn custom_claims(&self) -> Map<String, Value> {
        self.claims
            .iter()
            .filter(|(k, _)| !STANDARD_CLAIMS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Per-call verification policy. Built by the caller, never mutated here.
#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    /// Evaluate time claims at this epoch second instead of the clock.
    pub current_time: Option<u64>,
    /// Sent as `Referer` on upstream calls (API key restrictions).
    pub referer: Option<String>,
    /// Sent as `X-Firebase-AppCheck` on upstream calls.
    pub app_check_token: Option<String>,
    /// Compare `auth_time` against the account's revocation instant.
    pub check_revoked: bool,
    /// Report an unknown `kid` as an expired token so the caller refreshes.
    ///
    /// A key rotation race then heals through a refresh instead of a hard
    /// failure, at the cost of treating a key-resolution miss as expiry.
    pub unsafe_expire_on_invalid_kid: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(v: &Value) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(serde_json::to_vec(v).unwrap())
    }

    #[test]
    fn decode_splits_segments() {
        let header = encode(&serde_json::json!({"alg":"RS256","kid":"k1"}));
        let payload = encode(&serde_json::json!({"sub":"u1","exp":10}));
        let token = format!("{header}.{payload}.c2ln");

        let t = UnverifiedToken::decode(&token).unwrap();
        assert_eq!(t.header.alg.as_deref(), Some("RS256"));
        assert_eq!(t.header.kid.as_deref(), Some("k1"));
        assert_eq!(t.subject(), Some("u1"));
        assert_eq!(t.signing_input, format!("{header}.{payload}"));
        assert_eq!(t.signature, "c2ln");
    }

    #[test]
    fn decode_rejects_wrong_shape() {
        for bad in ["", "a.b", "a.b.c.d", "!!.e30.x", "e30.bm90IGpzb24.x"] {
            let err = UnverifiedToken::decode(bad).unwrap_err();
            assert!(err.is_auth_code(AuthErrorCode::InvalidArgument), "{bad}");
        }
    }

    #[test]
    fn custom_claims_exclude_standard_ones() {
        let claims = serde_json::json!({
            "sub": "u1", "iss": "x", "aud": "p", "role": "admin", "firebase": {}
        });
        let token = DecodedToken {
            header: JwtHeader {
                alg: Some("RS256".into()),
                kid: None,
                typ: None,
            },
            uid: "u1".into(),
            issuer: "x".into(),
            audience: "p".into(),
            expires_at: 0,
            issued_at: 0,
            auth_time: None,
            tenant: None,
            claims: claims.as_object().cloned().unwrap(),
        };
        let custom = token.custom_claims();
        assert_eq!(custom.len(), 1);
        assert_eq!(custom["role"], "admin");
    }
}
