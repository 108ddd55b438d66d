//! Password sign-up/sign-in orchestration.
//!
//! Chains the credential issuer, the second-factor engine and the out-of-band
//! dispatcher: a successful attempt through any channel ends in
//! [`TokenService::issue_pair`]. Password checks against unknown accounts are
//! run against a process-wide dummy hash computed once at startup, so response
//! timing does not reveal whether an email is registered.

use std::sync::{Arc, LazyLock};

use anyhow::anyhow;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use rand::rngs::OsRng;
use regex::Regex;
use uuid::Uuid;

use crate::error::AuthError;
use crate::models::{TokenPair, User};
use crate::otp::{Destination, OtpPurpose, OtpService};
use crate::store::UserStore;
use crate::token::TokenService;
use crate::twofa::TwoFactorService;

const USERNAME_MIN_LENGTH: usize = 3;
const USERNAME_MAX_LENGTH: usize = 32;
const PASSWORD_MIN_LENGTH: usize = 8;

/// Constant computed at boot and read-only thereafter; verified against when
/// the account does not exist so both paths pay the hash cost.
static DUMMY_PASSWORD_HASH: LazyLock<String> = LazyLock::new(|| {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(b"peranto.dummy.password", &salt)
        .map(|hash| hash.to_string())
        .unwrap_or_default()
});

/// # Errors
/// Returns an error if the hasher rejects its parameters.
pub(crate) fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| AuthError::Internal(anyhow!("failed to hash password")))
}

pub(crate) fn verify_password(stored_hash: &str, password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Normalize an email for lookup/uniqueness checks.
pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic email format check on already-normalized input.
pub(crate) fn valid_email(email_normalized: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email_normalized))
}

pub(crate) fn valid_username(username: &str) -> bool {
    (USERNAME_MIN_LENGTH..=USERNAME_MAX_LENGTH).contains(&username.len())
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Outcome of a password sign-in attempt.
#[derive(Debug)]
pub enum SigninOutcome {
    Complete {
        pair: TokenPair,
        user: User,
    },
    /// The account owes a second factor; the pending token must be exchanged
    /// via [`AuthService::complete_two_factor_signin`].
    TwoFactorRequired {
        two_factor_token: String,
    },
}

pub struct AuthService {
    users: Arc<dyn UserStore>,
    tokens: Arc<TokenService>,
    twofa: Arc<TwoFactorService>,
    otp: Arc<OtpService>,
}

impl AuthService {
    #[must_use]
    pub fn new(
        users: Arc<dyn UserStore>,
        tokens: Arc<TokenService>,
        twofa: Arc<TwoFactorService>,
        otp: Arc<OtpService>,
    ) -> Self {
        Self {
            users,
            tokens,
            twofa,
            otp,
        }
    }

    /// # Errors
    /// Fails with `Invalid` on malformed input and `Conflict` when the email
    /// or username is already taken.
    pub fn signup(&self, email: &str, username: &str, password: &str) -> Result<User, AuthError> {
        let email_normalized = normalize_email(email);
        if !valid_email(&email_normalized) {
            return Err(AuthError::Invalid("invalid email".to_string()));
        }
        let username = username.trim();
        if !valid_username(username) {
            return Err(AuthError::Invalid("invalid username".to_string()));
        }
        if password.len() < PASSWORD_MIN_LENGTH {
            return Err(AuthError::Invalid(format!(
                "password must be at least {PASSWORD_MIN_LENGTH} characters"
            )));
        }

        let mut user = User::new(email_normalized, username.to_string());
        user.password_hash = hash_password(password)?;
        self.users.create(&user)?;
        Ok(user)
    }

    /// # Errors
    /// Fails with `Unauthenticated` for an unknown account, a wrong password
    /// or a deactivated user; the three are indistinguishable to the caller.
    pub fn signin(&self, email: &str, password: &str) -> Result<SigninOutcome, AuthError> {
        let email_normalized = normalize_email(email);
        let user = self.users.get_by_email(&email_normalized)?;

        let Some(user) = user else {
            // Unknown account: burn the same hash cost before failing.
            let _ = verify_password(&DUMMY_PASSWORD_HASH, password);
            return Err(AuthError::Unauthenticated);
        };

        // Federation-only accounts have no password; keep their timing in
        // line with the dummy path as well.
        let stored_hash = if user.password_hash.is_empty() {
            DUMMY_PASSWORD_HASH.as_str()
        } else {
            user.password_hash.as_str()
        };
        if !verify_password(stored_hash, password) || user.password_hash.is_empty() {
            return Err(AuthError::Unauthenticated);
        }
        if !user.active {
            return Err(AuthError::Unauthenticated);
        }

        if user.totp_enabled {
            let two_factor_token = self.tokens.issue_two_factor_token(&user)?;
            return Ok(SigninOutcome::TwoFactorRequired { two_factor_token });
        }

        let pair = self.tokens.issue_pair(&user)?;
        Ok(SigninOutcome::Complete { pair, user })
    }

    /// Exchange a pending two-factor token plus a live TOTP/backup code for a
    /// full credential pair.
    ///
    /// # Errors
    /// Fails with `Unauthenticated`/`Invalid` on a bad pending token or code.
    pub fn complete_two_factor_signin(
        &self,
        two_factor_token: &str,
        code: &str,
    ) -> Result<(TokenPair, User), AuthError> {
        let claims = self.tokens.verify_two_factor(two_factor_token)?;
        let user = self
            .users
            .get_by_id(claims.user_id)?
            .ok_or(AuthError::Unauthenticated)?;
        if !self.twofa.verify_totp(user.id, code)? {
            return Err(AuthError::invalid_code());
        }
        let pair = self.tokens.issue_pair(&user)?;
        Ok((pair, user))
    }

    /// Passwordless sign-in: a verified `login`-purpose OTP stands in for the
    /// password.
    ///
    /// # Errors
    /// Fails with the generic code error when the OTP does not verify or the
    /// destination has no account.
    pub fn signin_with_otp(
        &self,
        destination: &Destination,
        code: &str,
    ) -> Result<(TokenPair, User), AuthError> {
        let verification = self
            .otp
            .verify_code(destination, OtpPurpose::Login, code)?;
        let user = verification.user.ok_or_else(AuthError::invalid_code)?;
        if !user.active {
            return Err(AuthError::Unauthenticated);
        }
        let pair = self.tokens.issue_pair(&user)?;
        Ok((pair, user))
    }

    /// Use-once rotation: the presented refresh token is revoked and a fresh
    /// pair is minted from the user's current record.
    ///
    /// # Errors
    /// Fails with `Revoked`/`Expired` wrapped as `Token` on a bad token.
    pub fn refresh(&self, refresh_raw: &str) -> Result<(TokenPair, User), AuthError> {
        let claims = self.tokens.verify_refresh(refresh_raw)?;
        self.tokens.revoke(refresh_raw)?;
        let user = self
            .users
            .get_by_id(claims.user_id)?
            .ok_or(AuthError::Unauthenticated)?;
        if !user.active {
            return Err(AuthError::Unauthenticated);
        }
        let pair = self.tokens.issue_pair(&user)?;
        Ok((pair, user))
    }

    /// # Errors
    /// Returns an error if the refresh-token store fails.
    pub fn logout(&self, refresh_raw: &str) -> Result<(), AuthError> {
        self.tokens.revoke(refresh_raw)?;
        Ok(())
    }

    /// Changes the password and revokes every refresh token, forcing other
    /// sessions to sign in again.
    ///
    /// # Errors
    /// Fails with `Unauthenticated` on a wrong current password.
    pub fn change_password(
        &self,
        user_id: Uuid,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        let user = self
            .users
            .get_by_id(user_id)?
            .ok_or(AuthError::Unauthenticated)?;
        if user.password_hash.is_empty() || !verify_password(&user.password_hash, current_password)
        {
            return Err(AuthError::Unauthenticated);
        }
        if new_password.len() < PASSWORD_MIN_LENGTH {
            return Err(AuthError::Invalid(format!(
                "password must be at least {PASSWORD_MIN_LENGTH} characters"
            )));
        }
        self.users
            .update_password_hash(user.id, &hash_password(new_password)?)?;
        self.tokens.revoke_all_for_user(user.id)?;
        Ok(())
    }
}
