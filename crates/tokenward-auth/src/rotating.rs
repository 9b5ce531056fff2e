//! HMAC signing with an ordered list of rotation keys.
//!
//! Signing always uses the first key. Verification walks the list in order,
//! so a token signed with an older key stays valid while that key is listed.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::InvalidTokenReason;
use crate::{Error, Result};

/// `{"alg":"HS256","typ":"JWT"}`, in that member order.
const HS256_HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

/// Signs with the newest key, verifies with any configured key.
#[derive(Clone)]
pub struct RotatingCredential {
    keys: Vec<Vec<u8>>,
}

impl std::fmt::Debug for RotatingCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotatingCredential")
            .field("keys", &self.keys.len())
            .finish()
    }
}

impl RotatingCredential {
    /// Credential over `keys`; index 0 is the current key.
    ///
    /// # Errors
    /// `Config` when the list is empty or contains an empty key.
    pub fn new<S: AsRef<str>>(keys: &[S]) -> Result<Self> {
        if keys.is_empty() {
            return Err(Error::Config("signature key list is empty".to_string()));
        }
        if keys.iter().any(|k| k.as_ref().is_empty()) {
            return Err(Error::Config("signature keys must not be empty".to_string()));
        }
        Ok(Self {
            keys: keys.iter().map(|k| k.as_ref().as_bytes().to_vec()).collect(),
        })
    }

    /// Number of configured keys.
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Sign `payload` as a compact HS256 token.
    ///
    /// The output depends only on the payload and the current key.
    ///
    /// # Errors
    /// Serialization or signing failure.
    pub fn sign<T: Serialize>(&self, payload: &T) -> Result<String> {
        let header = URL_SAFE_NO_PAD.encode(HS256_HEADER);
        let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload)?);
        let signing_input = format!("{header}.{body}");
        let signature = self.create_signature(&signing_input)?;
        Ok(format!("{signing_input}.{signature}"))
    }

    /// Verify a token produced by [`Self::sign`] and return its payload.
    ///
    /// # Errors
    /// `InvalidToken(Malformed)` for a token that is not three segments or
    /// whose payload does not decode; `SignatureMismatch` when no key
    /// verifies it.
    pub fn verify<T: DeserializeOwned>(&self, token: &str) -> Result<T> {
        let malformed = || Error::InvalidToken(InvalidTokenReason::Malformed);

        let mut parts = token.rsplitn(2, '.');
        let (Some(signature), Some(signing_input)) = (parts.next(), parts.next()) else {
            return Err(malformed());
        };
        let Some((_, body)) = signing_input.split_once('.') else {
            return Err(malformed());
        };
        if body.contains('.') {
            return Err(malformed());
        }

        self.verify_signature(signing_input, signature)?;

        let bytes = URL_SAFE_NO_PAD.decode(body).map_err(|_| malformed())?;
        serde_json::from_slice(&bytes).map_err(|_| malformed())
    }

    /// Base64url HMAC-SHA256 of `message` under the current key.
    ///
    /// # Errors
    /// Signing failure.
    pub fn create_signature(&self, message: &str) -> Result<String> {
        let key = EncodingKey::from_secret(&self.keys[0]);
        Ok(jsonwebtoken::crypto::sign(
            message.as_bytes(),
            &key,
            Algorithm::HS256,
        )?)
    }

    /// Check `signature` over `message` against each key in order.
    ///
    /// # Errors
    /// `SignatureMismatch` when no key matches.
    pub fn verify_signature(&self, message: &str, signature: &str) -> Result<()> {
        for (index, secret) in self.keys.iter().enumerate() {
            let key = DecodingKey::from_secret(secret);
            let ok = jsonwebtoken::crypto::verify(
                signature,
                message.as_bytes(),
                &key,
                Algorithm::HS256,
            )
            .unwrap_or(false);
            if ok {
                if index > 0 {
                    debug!(key_index = index, "signature matched a rotated key");
                }
                return Ok(());
            }
        }
        Err(Error::SignatureMismatch)
    }
}
