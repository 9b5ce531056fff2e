//! Error types.
//!
//! Two families live here. [`InvalidTokenReason`] covers the expected,
//! user-facing outcomes a caller turns into a re-authentication prompt.
//! Everything else (network, malformed upstream payloads, DER parse
//! failures, misconfiguration) is operational and must reach the caller.

use std::fmt;

use thiserror::Error;

use crate::asn1::Asn1Error;

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a token verification failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthErrorCode {
    /// A claim or header field has the wrong shape or value.
    InvalidArgument,
    /// The upstream provider rejected the presented credential.
    InvalidCredential,
    /// `exp` is in the past (or `nbf` in the future).
    TokenExpired,
    /// The header carries no `kid`.
    NoKidInHeader,
    /// No published key matches the header `kid`.
    NoMatchingKid,
    /// The signature does not verify against any candidate key.
    InvalidSignature,
    /// The token tenant differs from the configured tenant.
    MismatchingTenantId,
    /// The account referenced by the token does not exist.
    UserNotFound,
    /// The account referenced by the token is disabled.
    UserDisabled,
    /// The token was issued before the account's revocation instant.
    TokenRevoked,
}

impl AuthErrorCode {
    /// Stable wire name for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            AuthErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            AuthErrorCode::InvalidCredential => "INVALID_CREDENTIAL",
            AuthErrorCode::TokenExpired => "TOKEN_EXPIRED",
            AuthErrorCode::NoKidInHeader => "NO_KID_IN_HEADER",
            AuthErrorCode::NoMatchingKid => "NO_MATCHING_KID",
            AuthErrorCode::InvalidSignature => "INVALID_SIGNATURE",
            AuthErrorCode::MismatchingTenantId => "MISMATCHING_TENANT_ID",
            AuthErrorCode::UserNotFound => "USER_NOT_FOUND",
            AuthErrorCode::UserDisabled => "USER_DISABLED",
            AuthErrorCode::TokenRevoked => "TOKEN_REVOKED",
        }
    }
}

impl fmt::Display for AuthErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified token failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct AuthError {
    /// Classification.
    pub code: AuthErrorCode,
    /// Human readable detail.
    pub message: String,
}

impl AuthError {
    /// Build a new classified error.
    pub fn new(code: AuthErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Why a request's stored credentials were not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidTokenReason {
    /// No usable token set was found in the request.
    Missing,
    /// Token set is partially present or unreadable.
    Malformed,
    /// Cookie integrity check failed.
    InvalidSignature,
    /// Tokens were rejected by verification or by the upstream provider.
    InvalidCredentials,
    /// The id token references a key id that is not published.
    InvalidKid,
}

impl InvalidTokenReason {
    /// Stable wire name for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            InvalidTokenReason::Missing => "MISSING_CREDENTIALS",
            InvalidTokenReason::Malformed => "MALFORMED_CREDENTIALS",
            InvalidTokenReason::InvalidSignature => "INVALID_SIGNATURE",
            InvalidTokenReason::InvalidCredentials => "INVALID_CREDENTIALS",
            InvalidTokenReason::InvalidKid => "INVALID_KID",
        }
    }
}

impl fmt::Display for InvalidTokenReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A token failed verification.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Stored credentials are unusable.
    #[error("invalid token: {0}")]
    InvalidToken(InvalidTokenReason),

    /// A rotating-key signature did not verify under any configured key.
    #[error("signature verification failed")]
    SignatureMismatch,

    /// DER decoding failed.
    #[error(transparent)]
    Asn1(#[from] Asn1Error),

    /// Configuration is missing or inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// An upstream endpoint answered with an unclassified failure.
    #[error("upstream error ({status}): {message}")]
    Upstream {
        /// HTTP status code.
        status: u16,
        /// Upstream message, if any.
        message: String,
    },

    /// Key material could not be fetched or used.
    #[error("key error: {0}")]
    Keys(String),

    /// An error occurred while performing HTTP requests.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// JSON parsing error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// jsonwebtoken error.
    #[error(transparent)]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// base64 decoding error.
    #[error(transparent)]
    Base64(#[from] base64::DecodeError),
}

impl Error {
    pub(crate) fn auth(code: AuthErrorCode, message: impl Into<String>) -> Self {
        Error::Auth(AuthError::new(code, message))
    }

    /// The classification, when this is a token verification failure.
    pub fn auth_code(&self) -> Option<AuthErrorCode> {
        match self {
            Error::Auth(e) => Some(e.code),
            _ => None,
        }
    }

    /// True if this is a token verification failure with `code`.
    pub fn is_auth_code(&self, code: AuthErrorCode) -> bool {
        self.auth_code() == Some(code)
    }

    /// The cookie-level reason, when this is a stored-credential failure.
    pub fn invalid_reason(&self) -> Option<InvalidTokenReason> {
        match self {
            Error::InvalidToken(reason) => Some(*reason),
            _ => None,
        }
    }
}
