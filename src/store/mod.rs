//! Collaborator contracts for persistence, delivery and rate limiting.
//!
//! The broker core never talks SQL or SMS APIs directly; it consumes these
//! traits. `memory` provides in-process implementations used by tests and
//! single-node deployments. Implementations must keep the `consume`-style
//! operations (mark an OTP used, consume a backup code) atomic per record:
//! the test-and-set is the enforcement point for single-use semantics.

pub mod memory;

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::User;
use crate::otp::OtpPurpose;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record already exists")]
    Duplicate,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Rotation record for a refresh token. Only a one-way digest of the raw
/// value is ever stored.
#[derive(Clone, Debug)]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

/// Link entity between a local user and an external provider identity.
/// `(provider, provider_user_id)` is the dedup key.
#[derive(Clone, Debug)]
pub struct OAuthAccountRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: String,
    pub provider_user_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub profile_json: String,
}

/// One-time code record; `code_hash` is an HMAC digest, never the raw code.
#[derive(Clone, Debug)]
pub struct OtpRecord {
    pub id: Uuid,
    pub destination: String,
    pub purpose: OtpPurpose,
    pub code_hash: String,
    pub used: bool,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct BackupCodeRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub code_hash: String,
    pub used: bool,
}

pub trait UserStore: Send + Sync {
    fn get_by_id(&self, id: Uuid) -> StoreResult<Option<User>>;
    fn get_by_email(&self, email: &str) -> StoreResult<Option<User>>;
    fn get_by_phone(&self, phone: &str) -> StoreResult<Option<User>>;
    fn username_exists(&self, username: &str) -> StoreResult<bool>;
    /// Fails with [`StoreError::Duplicate`] when the email or username is taken.
    fn create(&self, user: &User) -> StoreResult<()>;
    fn update_password_hash(&self, id: Uuid, password_hash: &str) -> StoreResult<()>;
    /// Stores a pending TOTP secret without enabling the second factor.
    fn update_totp_secret(&self, id: Uuid, secret: &str) -> StoreResult<()>;
    fn enable_totp(&self, id: Uuid) -> StoreResult<()>;
    /// Clears the secret and the enabled flag together.
    fn disable_totp(&self, id: Uuid) -> StoreResult<()>;
    fn mark_email_verified(&self, id: Uuid) -> StoreResult<()>;
    fn mark_phone_verified(&self, id: Uuid) -> StoreResult<()>;
}

pub trait RefreshTokenStore: Send + Sync {
    fn create(&self, record: &RefreshTokenRecord) -> StoreResult<()>;
    fn lookup(&self, token_hash: &str) -> StoreResult<Option<RefreshTokenRecord>>;
    fn revoke(&self, token_hash: &str) -> StoreResult<()>;
    fn revoke_all_for_user(&self, user_id: Uuid) -> StoreResult<()>;
}

pub trait OAuthAccountStore: Send + Sync {
    fn get(&self, provider: &str, provider_user_id: &str)
        -> StoreResult<Option<OAuthAccountRecord>>;
    fn create(&self, record: &OAuthAccountRecord) -> StoreResult<()>;
    /// Refreshes cached provider tokens and the raw profile snapshot.
    fn update_tokens(
        &self,
        id: Uuid,
        access_token: &str,
        refresh_token: Option<&str>,
        token_expires_at: Option<DateTime<Utc>>,
        profile_json: &str,
    ) -> StoreResult<()>;
}

pub trait OtpStore: Send + Sync {
    fn create(&self, record: &OtpRecord) -> StoreResult<()>;
    /// Returns the unused record for `(destination, purpose)`, if any.
    /// Expiry is checked by the caller.
    fn get_live(&self, destination: &str, purpose: OtpPurpose) -> StoreResult<Option<OtpRecord>>;
    fn invalidate_all_for(&self, destination: &str, purpose: OtpPurpose) -> StoreResult<()>;
    /// Marks the record used. Returns false when it was already consumed, so
    /// only one of two racing verifications wins.
    fn mark_used(&self, id: Uuid) -> StoreResult<bool>;
}

pub trait BackupCodeStore: Send + Sync {
    /// Deletes every code for the user and stores the new batch.
    fn replace_all(&self, user_id: Uuid, code_hashes: &[String]) -> StoreResult<()>;
    fn unused_for(&self, user_id: Uuid) -> StoreResult<Vec<BackupCodeRecord>>;
    /// Marks a code used. Returns false when it was already consumed.
    fn consume(&self, id: Uuid) -> StoreResult<bool>;
    fn delete_all(&self, user_id: Uuid) -> StoreResult<()>;
    fn count_unused(&self, user_id: Uuid) -> StoreResult<usize>;
}

/// Atomic counter with per-key expiry. The increment itself is the rate-limit
/// enforcement point; callers compare the returned count against a limit.
pub trait RateLimitStore: Send + Sync {
    fn increment_with_expiry(&self, key: &str, window: Duration) -> StoreResult<u64>;
}

/// Outbound delivery abstraction; SMS and email are interchangeable here.
pub trait MessageSender: Send + Sync {
    /// Delivers `body` to `destination` and returns a provider message id.
    fn send(&self, destination: &str, body: &str) -> anyhow::Result<String>;
}
