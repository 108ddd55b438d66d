//! Second-factor engine: time-based codes and single-use backup codes.
//!
//! Every destructive or security-relevant operation here requires a fresh
//! proof of possession (the password, and for disable also a live code). A
//! bearer token alone — which could be a stolen short-lived credential — must
//! never be enough to downgrade account security.

pub mod backup;

use std::sync::Arc;

use anyhow::anyhow;
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;

use crate::auth::verify_password;
use crate::error::AuthError;
use crate::store::{BackupCodeStore, UserStore};

pub use backup::BackupCodeBatch;

const TOTP_DIGITS: usize = 6;
const TOTP_SKEW: u8 = 1;
const TOTP_STEP: u64 = 30;

/// Returned exactly once from [`TwoFactorService::setup_totp`]; the plaintext
/// backup codes cannot be recovered later, only regenerated.
#[derive(Debug)]
pub struct TwoFactorSetup {
    pub secret: String,
    pub provisioning_uri: String,
    pub backup_codes: Vec<String>,
}

#[derive(Clone, Copy, Debug)]
pub struct TwoFactorStatus {
    pub enabled: bool,
    pub backup_codes_remaining: usize,
}

pub struct TwoFactorService {
    users: Arc<dyn UserStore>,
    backup_codes: Arc<dyn BackupCodeStore>,
    issuer: String,
}

impl TwoFactorService {
    #[must_use]
    pub fn new(
        users: Arc<dyn UserStore>,
        backup_codes: Arc<dyn BackupCodeStore>,
        issuer: String,
    ) -> Self {
        Self {
            users,
            backup_codes,
            issuer,
        }
    }

    /// Begins enrollment: step-up password check, new random secret (pending,
    /// not yet active) and a fresh backup-code batch.
    ///
    /// # Errors
    /// Fails with `Unauthenticated` on a wrong password and `Invalid` for
    /// accounts without a password.
    pub fn setup_totp(&self, user_id: Uuid, password: &str) -> Result<TwoFactorSetup, AuthError> {
        let user = self.require_user(user_id)?;
        self.require_password(&user, password)?;

        let secret = Secret::generate_secret();
        let secret_bytes = secret
            .to_bytes()
            .map_err(|e| AuthError::Internal(anyhow!("secret generation error: {e:?}")))?;
        let totp = self.build_totp(secret_bytes, &user.email)?;
        let secret_base32 = totp.get_secret_base32();
        let provisioning_uri = totp.get_url();

        let batch = BackupCodeBatch::generate()?;
        self.users.update_totp_secret(user.id, &secret_base32)?;
        self.backup_codes
            .replace_all(user.id, &batch.code_hashes)?;

        Ok(TwoFactorSetup {
            secret: secret_base32,
            provisioning_uri,
            backup_codes: batch.codes,
        })
    }

    /// Validates the first code against the pending secret; only then does
    /// the second factor take effect.
    ///
    /// # Errors
    /// Fails with `Invalid` when no setup is pending or the code is wrong.
    pub fn confirm_totp_setup(&self, user_id: Uuid, code: &str) -> Result<(), AuthError> {
        let user = self.require_user(user_id)?;
        let Some(secret) = user.totp_secret.clone() else {
            return Err(AuthError::Invalid(
                "two-factor setup not initiated".to_string(),
            ));
        };
        if user.totp_enabled {
            return Ok(());
        }

        let totp = self.build_totp_from_base32(&secret, &user.email)?;
        if !totp.check_current(code).unwrap_or(false) {
            return Err(AuthError::invalid_code());
        }
        self.users.enable_totp(user.id)?;
        Ok(())
    }

    /// Time-window code check with a bounded fallback scan over unused backup
    /// codes. A matching backup code is consumed atomically; under racing
    /// verifications only one caller sees `true`.
    ///
    /// # Errors
    /// Fails with `Invalid` when the second factor is not enabled.
    pub fn verify_totp(&self, user_id: Uuid, code: &str) -> Result<bool, AuthError> {
        let user = self.require_user(user_id)?;
        let Some(secret) = user.totp_secret.clone() else {
            return Err(AuthError::Invalid(
                "two-factor authentication is not enabled".to_string(),
            ));
        };
        if !user.totp_enabled {
            return Err(AuthError::Invalid(
                "two-factor authentication is not enabled".to_string(),
            ));
        }

        let totp = self.build_totp_from_base32(&secret, &user.email)?;
        if totp.check_current(code).unwrap_or(false) {
            return Ok(true);
        }

        // Small set (ten or fewer), so a linear scan over the hashes is fine.
        for record in self.backup_codes.unused_for(user.id)? {
            if verify_password(&record.code_hash, code) {
                return Ok(self.backup_codes.consume(record.id)?);
            }
        }
        Ok(false)
    }

    /// Turning the factor off requires both the password and a currently
    /// valid code, so a stolen session cannot silently downgrade the account.
    ///
    /// # Errors
    /// Fails with `Unauthenticated`/`Invalid` when either proof is missing.
    pub fn disable_totp(&self, user_id: Uuid, password: &str, code: &str) -> Result<(), AuthError> {
        let user = self.require_user(user_id)?;
        self.require_password(&user, password)?;
        if !self.verify_totp(user_id, code)? {
            return Err(AuthError::invalid_code());
        }
        self.users.disable_totp(user.id)?;
        self.backup_codes.delete_all(user.id)?;
        Ok(())
    }

    /// Deletes every previous code (used or not) and issues ten new ones.
    ///
    /// # Errors
    /// Fails with `Unauthenticated` on a wrong password and `Invalid` when
    /// the second factor is not enabled.
    pub fn regenerate_backup_codes(
        &self,
        user_id: Uuid,
        password: &str,
    ) -> Result<Vec<String>, AuthError> {
        let user = self.require_user(user_id)?;
        self.require_password(&user, password)?;
        if !user.totp_enabled {
            return Err(AuthError::Invalid(
                "two-factor authentication is not enabled".to_string(),
            ));
        }

        let batch = BackupCodeBatch::generate()?;
        self.backup_codes
            .replace_all(user.id, &batch.code_hashes)?;
        Ok(batch.codes)
    }

    /// # Errors
    /// Returns an error if the user or backup-code store fails.
    pub fn status(&self, user_id: Uuid) -> Result<TwoFactorStatus, AuthError> {
        let user = self.require_user(user_id)?;
        Ok(TwoFactorStatus {
            enabled: user.totp_enabled,
            backup_codes_remaining: self.backup_codes.count_unused(user.id)?,
        })
    }

    fn require_user(&self, user_id: Uuid) -> Result<crate::models::User, AuthError> {
        self.users
            .get_by_id(user_id)?
            .ok_or(AuthError::Unauthenticated)
    }

    fn require_password(
        &self,
        user: &crate::models::User,
        password: &str,
    ) -> Result<(), AuthError> {
        if user.password_hash.is_empty() {
            return Err(AuthError::Invalid(
                "account has no password to verify".to_string(),
            ));
        }
        if !verify_password(&user.password_hash, password) {
            return Err(AuthError::Unauthenticated);
        }
        Ok(())
    }

    fn build_totp(&self, secret_bytes: Vec<u8>, account: &str) -> Result<TOTP, AuthError> {
        TOTP::new(
            Algorithm::SHA1,
            TOTP_DIGITS,
            TOTP_SKEW,
            TOTP_STEP,
            secret_bytes,
            Some(self.issuer.clone()),
            account.to_string(),
        )
        .map_err(|e| AuthError::Internal(anyhow!("totp init error: {e}")))
    }

    fn build_totp_from_base32(&self, secret_base32: &str, account: &str) -> Result<TOTP, AuthError> {
        let secret_bytes = Secret::Encoded(secret_base32.to_string())
            .to_bytes()
            .map_err(|e| AuthError::Internal(anyhow!("stored secret invalid: {e:?}")))?;
        self.build_totp(secret_bytes, account)
    }
}
