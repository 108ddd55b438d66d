//! Error taxonomy shared by every broker operation.
//!
//! Collaborator failures are wrapped with context for central logging but the
//! `Display` form stays safe to surface: provider bodies and storage error
//! strings never reach a user-facing message.

use axum::http::StatusCode;
use thiserror::Error;

use crate::store::StoreError;
use crate::token;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Missing, invalid or expired credential.
    #[error("unauthenticated")]
    Unauthenticated,
    /// Valid credential, insufficient role or permission.
    #[error("forbidden")]
    Forbidden,
    /// Too many attempts; `retry_after_seconds` is a hint, not a promise.
    #[error("rate limited, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },
    /// A duplicate account would be created (e.g. a provider email already
    /// owned by a different local account).
    #[error("account already exists")]
    Conflict,
    /// Provider or validation authority timed out or answered non-2xx.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    /// Malformed input: bad destination, bad code shape, unknown provider.
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Token(#[from] token::Error),
    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

impl AuthError {
    /// Generic verification failure for 2FA and OTP codes. Wrong, expired and
    /// never-issued codes all read the same to prevent enumeration.
    #[must_use]
    pub fn invalid_code() -> Self {
        Self::Invalid("invalid or expired code".to_string())
    }

    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthenticated | Self::Token(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Conflict => StatusCode::CONFLICT,
            Self::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Invalid(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate => Self::Conflict,
            StoreError::Other(inner) => Self::Internal(inner),
        }
    }
}

impl From<anyhow::Error> for AuthError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}
