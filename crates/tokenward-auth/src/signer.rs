//! Custom token minting.

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, EncodingKey};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::clock::Clock;
use crate::credential::ServiceAccount;
use crate::error::AuthErrorCode;
use crate::verifier::CUSTOM_TOKEN_AUDIENCE;
use crate::{Error, Result};

/// Custom token lifetime in seconds.
pub const CUSTOM_TOKEN_LIFETIME_SECS: u64 = 30 * 60;

const MAX_UID_LEN: usize = 128;
const MAX_CLAIMS_LEN: usize = 1000;

/// Claim names a caller may not set as developer claims.
pub const RESERVED_CLAIMS: &[&str] = &[
    "acr", "amr", "at_hash", "aud", "auth_time", "azp", "cnf", "c_hash", "exp", "firebase",
    "iat", "iss", "jti", "nbf", "nonce", "sub",
];

const EMULATOR_ACCOUNT: &str = "firebase-auth-emulator@example.com";

#[derive(Serialize)]
struct CustomTokenClaims<'a> {
    aud: &'a str,
    iat: u64,
    exp: u64,
    iss: &'a str,
    sub: &'a str,
    uid: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    claims: Option<&'a Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tenant_id: Option<&'a str>,
}

/// Produces signatures for custom tokens.
#[derive(Clone)]
pub enum CryptoSigner {
    /// RS256 with a service account key.
    ServiceAccount {
        /// Issuer and subject of minted tokens.
        client_email: String,
        /// Signing key.
        key: EncodingKey,
    },
    /// Unsigned tokens accepted by the local emulator.
    Emulator {
        /// Issuer and subject of minted tokens.
        account: String,
    },
}

impl fmt::Debug for CryptoSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoSigner")
            .field("account", &self.account())
            .field("algorithm", &self.algorithm())
            .finish()
    }
}

impl CryptoSigner {
    /// Signer for `account`.
    ///
    /// # Errors
    /// The private key does not parse.
    pub fn from_service_account(account: &ServiceAccount) -> Result<Self> {
        Ok(CryptoSigner::ServiceAccount {
            client_email: account.client_email.clone(),
            key: account.encoding_key()?,
        })
    }

    /// Signer producing emulator tokens.
    pub fn emulator() -> Self {
        CryptoSigner::Emulator {
            account: EMULATOR_ACCOUNT.to_string(),
        }
    }

    /// The account tokens are issued by.
    pub fn account(&self) -> &str {
        match self {
            CryptoSigner::ServiceAccount { client_email, .. } => client_email,
            CryptoSigner::Emulator { account } => account,
        }
    }

    /// JOSE `alg` of produced tokens.
    pub fn algorithm(&self) -> &'static str {
        match self {
            CryptoSigner::ServiceAccount { .. } => "RS256",
            CryptoSigner::Emulator { .. } => "none",
        }
    }

    /// Base64url signature of `message`; empty for the emulator.
    ///
    /// # Errors
    /// Signing failure.
    pub fn sign(&self, message: &[u8]) -> Result<String> {
        match self {
            CryptoSigner::ServiceAccount { key, .. } => {
                Ok(jsonwebtoken::crypto::sign(message, key, Algorithm::RS256)?)
            }
            CryptoSigner::Emulator { .. } => Ok(String::new()),
        }
    }

    /// Mint a custom token for `uid` carrying developer `claims`.
    ///
    /// # Errors
    /// `INVALID_ARGUMENT` for an empty or overlong uid, oversized claims or a
    /// reserved claim name.
    pub fn create_custom_token(
        &self,
        uid: &str,
        claims: Option<&Map<String, Value>>,
        tenant_id: Option<&str>,
        clock: &Arc<dyn Clock>,
    ) -> Result<String> {
        validate_uid(uid)?;
        let claims = claims.filter(|c| !c.is_empty());
        if let Some(claims) = claims {
            validate_claims(claims)?;
        }

        let iat = clock.now_secs();
        let account = self.account();
        let payload = CustomTokenClaims {
            aud: CUSTOM_TOKEN_AUDIENCE,
            iat,
            exp: iat + CUSTOM_TOKEN_LIFETIME_SECS,
            iss: account,
            sub: account,
            uid,
            claims,
            tenant_id,
        };

        let header = format!(r#"{{"alg":"{}","typ":"JWT"}}"#, self.algorithm());
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload)?)
        );
        let signature = self.sign(signing_input.as_bytes())?;
        Ok(format!("{signing_input}.{signature}"))
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::auth(AuthErrorCode::InvalidArgument, message)
}

fn validate_uid(uid: &str) -> Result<()> {
    if uid.is_empty() {
        return Err(invalid("uid must be a non-empty string"));
    }
    if uid.chars().count() > MAX_UID_LEN {
        return Err(invalid(format!("uid must not exceed {MAX_UID_LEN} characters")));
    }
    Ok(())
}

fn validate_claims(claims: &Map<String, Value>) -> Result<()> {
    if serde_json::to_string(claims)?.len() > MAX_CLAIMS_LEN {
        return Err(invalid(format!(
            "developer claims must not exceed {MAX_CLAIMS_LEN} characters"
        )));
    }
    if let Some(reserved) = claims.keys().find(|k| RESERVED_CLAIMS.contains(&k.as_str())) {
        return Err(invalid(format!(
            "developer claim \"{reserved}\" is reserved and cannot be specified"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::token::UnverifiedToken;
    use serde_json::json;

    const SIGNING_KEY: &str = include_str!("../tests/fixtures/signing_key.pem");

    fn clock() -> Arc<dyn Clock> {
        Arc::new(FixedClock::new(1_700_000_000_000))
    }

    fn signer() -> CryptoSigner {
        CryptoSigner::from_service_account(&ServiceAccount {
            project_id: "demo".into(),
            client_email: "sa@demo.iam.gserviceaccount.com".into(),
            private_key: SIGNING_KEY.into(),
        })
        .unwrap()
    }

    #[test]
    fn mints_signed_custom_token() {
        let claims = json!({ "role": "admin" });
        let token = signer()
            .create_custom_token("user-1", claims.as_object(), Some("tenant-a"), &clock())
            .unwrap();

        let t = UnverifiedToken::decode(&token).unwrap();
        assert_eq!(t.header.alg.as_deref(), Some("RS256"));
        assert_eq!(t.claim("aud").unwrap(), CUSTOM_TOKEN_AUDIENCE);
        assert_eq!(t.claim("uid").unwrap(), "user-1");
        assert_eq!(t.claim("sub").unwrap(), "sa@demo.iam.gserviceaccount.com");
        assert_eq!(t.claim("exp").unwrap(), 1_700_000_000 + 1800);
        assert_eq!(t.claim("claims").unwrap()["role"], "admin");
        assert_eq!(t.claim("tenant_id").unwrap(), "tenant-a");
        assert!(!t.signature.is_empty());
    }

    #[test]
    fn emulator_tokens_are_unsigned() {
        let token = CryptoSigner::emulator()
            .create_custom_token("user-1", None, None, &clock())
            .unwrap();
        assert!(token.ends_with('.'));
        let t = UnverifiedToken::decode(&token).unwrap();
        assert_eq!(t.header.alg.as_deref(), Some("none"));
        assert!(t.claim("claims").is_none());
    }

    #[test]
    fn rejects_reserved_claims() {
        for name in ["aud", "exp", "iat", "iss", "sub", "nbf", "jti", "firebase"] {
            let mut claims = Map::new();
            claims.insert(name.to_string(), json!("x"));
            let err = signer()
                .create_custom_token("user-1", Some(&claims), None, &clock())
                .unwrap_err();
            assert!(err.is_auth_code(AuthErrorCode::InvalidArgument), "{name}");
        }
    }

    #[test]
    fn rejects_bad_uid_and_large_claims() {
        let s = signer();
        assert!(s.create_custom_token("", None, None, &clock()).is_err());
        assert!(s
            .create_custom_token(&"u".repeat(129), None, None, &clock())
            .is_err());

        let mut claims = Map::new();
        claims.insert("blob".into(), json!("x".repeat(1000)));
        assert!(s
            .create_custom_token("user-1", Some(&claims), None, &clock())
            .is_err());
    }
}
