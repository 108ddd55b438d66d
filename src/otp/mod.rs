//! Out-of-band one-time codes delivered by SMS or email.
//!
//! A 6-digit code has only a million possibilities, far below what a slow
//! password hash protects against. The defense here is delivery throttling:
//! three independent counters (per-destination-per-hour, per-destination-
//! per-day, global-per-hour) are incremented before anything is generated.
//! Codes themselves are stored as fast constant-time HMAC digests keyed by a
//! server-side pepper, which is enough for a ten-minute secret.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::Rng;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::error;
use uuid::Uuid;

use crate::auth::{normalize_email, valid_email};
use crate::error::AuthError;
use crate::models::User;
use crate::store::{MessageSender, OtpRecord, OtpStore, RateLimitStore, UserStore};

type HmacSha256 = Hmac<Sha256>;

const OTP_CODE_LENGTH: usize = 6;
const DEFAULT_CODE_TTL_SECONDS: i64 = 10 * 60;
const DEFAULT_MAX_PER_DESTINATION_HOUR: u64 = 3;
const DEFAULT_MAX_PER_DESTINATION_DAY: u64 = 10;
const DEFAULT_MAX_GLOBAL_HOUR: u64 = 1000;

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpPurpose {
    Verification,
    PasswordReset,
    #[serde(rename = "2fa")]
    TwoFactor,
    Login,
}

impl OtpPurpose {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Verification => "verification",
            Self::PasswordReset => "password_reset",
            Self::TwoFactor => "2fa",
            Self::Login => "login",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "verification" => Some(Self::Verification),
            "password_reset" => Some(Self::PasswordReset),
            "2fa" => Some(Self::TwoFactor),
            "login" => Some(Self::Login),
            _ => None,
        }
    }
}

/// A validated, normalized delivery destination. Phone numbers are reduced to
/// `+` followed only by digits before any storage or rate-limit keying.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Destination {
    Email(String),
    Phone(String),
}

impl Destination {
    /// # Errors
    /// Fails with `Invalid` on a malformed address.
    pub fn email(raw: &str) -> Result<Self, AuthError> {
        let normalized = normalize_email(raw);
        if !valid_email(&normalized) {
            return Err(AuthError::Invalid("invalid email address".to_string()));
        }
        Ok(Self::Email(normalized))
    }

    /// # Errors
    /// Fails with `Invalid` on a malformed phone number.
    pub fn phone(raw: &str) -> Result<Self, AuthError> {
        let normalized = normalize_phone(raw);
        if !valid_phone(&normalized) {
            return Err(AuthError::Invalid("invalid phone number".to_string()));
        }
        Ok(Self::Phone(normalized))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Email(value) | Self::Phone(value) => value,
        }
    }
}

/// Strip everything but digits and `+`, then ensure a leading `+`.
pub(crate) fn normalize_phone(raw: &str) -> String {
    let normalized: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();
    match normalized.bytes().next() {
        Some(b'0'..=b'9') => format!("+{normalized}"),
        _ => normalized,
    }
}

fn valid_phone(normalized: &str) -> bool {
    Regex::new(r"^\+[0-9]{8,15}$").is_ok_and(|regex| regex.is_match(normalized))
}

#[derive(Clone, Copy, Debug)]
pub struct OtpConfig {
    code_ttl_seconds: i64,
    max_per_destination_hour: u64,
    max_per_destination_day: u64,
    max_global_hour: u64,
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self {
            code_ttl_seconds: DEFAULT_CODE_TTL_SECONDS,
            max_per_destination_hour: DEFAULT_MAX_PER_DESTINATION_HOUR,
            max_per_destination_day: DEFAULT_MAX_PER_DESTINATION_DAY,
            max_global_hour: DEFAULT_MAX_GLOBAL_HOUR,
        }
    }
}

impl OtpConfig {
    #[must_use]
    pub fn with_code_ttl_seconds(mut self, seconds: i64) -> Self {
        self.code_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_max_per_destination_hour(mut self, limit: u64) -> Self {
        self.max_per_destination_hour = limit;
        self
    }

    #[must_use]
    pub fn with_max_per_destination_day(mut self, limit: u64) -> Self {
        self.max_per_destination_day = limit;
        self
    }

    #[must_use]
    pub fn with_max_global_hour(mut self, limit: u64) -> Self {
        self.max_global_hour = limit;
        self
    }
}

/// Result of a successful verification; `user` is present when the
/// destination maps to an account, so login/reset flows can chain into the
/// credential issuer.
#[derive(Debug)]
pub struct OtpVerification {
    pub purpose: OtpPurpose,
    pub user: Option<User>,
}

pub struct OtpService {
    otps: Arc<dyn OtpStore>,
    users: Arc<dyn UserStore>,
    rate_limits: Arc<dyn RateLimitStore>,
    sender: Arc<dyn MessageSender>,
    secret: SecretString,
    config: OtpConfig,
}

impl OtpService {
    #[must_use]
    pub fn new(
        otps: Arc<dyn OtpStore>,
        users: Arc<dyn UserStore>,
        rate_limits: Arc<dyn RateLimitStore>,
        sender: Arc<dyn MessageSender>,
        secret: SecretString,
        config: OtpConfig,
    ) -> Self {
        Self {
            otps,
            users,
            rate_limits,
            sender,
            secret,
            config,
        }
    }

    /// Generates, stores and dispatches a fresh code, invalidating any code
    /// still live for the same `(destination, purpose)` pair. Returns the new
    /// code's expiry.
    ///
    /// Dispatch failure after the record exists leaves the code valid — the
    /// user may still receive it through an out-of-band retry — and surfaces
    /// `UpstreamUnavailable`.
    ///
    /// # Errors
    /// Fails with `RateLimited` before anything is generated when any of the
    /// three counters is over its limit.
    pub fn send_code(
        &self,
        destination: &Destination,
        purpose: OtpPurpose,
    ) -> Result<DateTime<Utc>, AuthError> {
        self.check_rate_limits(destination)?;

        let code = generate_code();
        let code_hash = self.code_digest(&code)?;
        self.otps.invalidate_all_for(destination.as_str(), purpose)?;

        let expires_at = Utc::now() + chrono::Duration::seconds(self.config.code_ttl_seconds);
        let record = OtpRecord {
            id: Uuid::new_v4(),
            destination: destination.as_str().to_string(),
            purpose,
            code_hash,
            used: false,
            expires_at,
        };
        self.otps.create(&record)?;

        let body = self.format_message(&code, purpose);
        if let Err(err) = self.sender.send(destination.as_str(), &body) {
            error!(attempt = %record.id, error = %err, "one-time code dispatch failed");
            return Err(AuthError::UpstreamUnavailable(
                "message dispatch failed".to_string(),
            ));
        }
        Ok(expires_at)
    }

    /// Verifies and consumes the live code for `(destination, purpose)`.
    ///
    /// Wrong, expired and never-issued codes all fail with the same generic
    /// error. On success the record is marked used (single-shot, also under
    /// races) and the purpose side effect runs: `verification` flips the
    /// destination's verified flag, the other purposes hand back the user.
    ///
    /// # Errors
    /// Fails with `Invalid` on a bad code shape or the generic code error.
    pub fn verify_code(
        &self,
        destination: &Destination,
        purpose: OtpPurpose,
        code: &str,
    ) -> Result<OtpVerification, AuthError> {
        if code.len() != OTP_CODE_LENGTH || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AuthError::Invalid(format!(
                "code must be exactly {OTP_CODE_LENGTH} digits"
            )));
        }

        let record = self
            .otps
            .get_live(destination.as_str(), purpose)?
            .ok_or_else(AuthError::invalid_code)?;
        if record.expires_at <= Utc::now() {
            return Err(AuthError::invalid_code());
        }
        if !self.verify_digest(code, &record.code_hash) {
            return Err(AuthError::invalid_code());
        }
        if !self.otps.mark_used(record.id)? {
            return Err(AuthError::invalid_code());
        }

        let mut user = self.lookup_user(destination)?;
        if purpose == OtpPurpose::Verification {
            if let Some(found) = &user {
                match destination {
                    Destination::Phone(_) => self.users.mark_phone_verified(found.id)?,
                    Destination::Email(_) => self.users.mark_email_verified(found.id)?,
                }
                user = self.lookup_user(destination)?;
            }
        }

        Ok(OtpVerification { purpose, user })
    }

    fn lookup_user(&self, destination: &Destination) -> Result<Option<User>, AuthError> {
        let user = match destination {
            Destination::Email(email) => self.users.get_by_email(email)?,
            Destination::Phone(phone) => self.users.get_by_phone(phone)?,
        };
        Ok(user)
    }

    fn check_rate_limits(&self, destination: &Destination) -> Result<(), AuthError> {
        let dest = destination.as_str();

        let hourly = self
            .rate_limits
            .increment_with_expiry(&format!("otp:limit:dest:{dest}:hour"), HOUR)?;
        if hourly > self.config.max_per_destination_hour {
            return Err(AuthError::RateLimited {
                retry_after_seconds: HOUR.as_secs(),
            });
        }

        let daily = self
            .rate_limits
            .increment_with_expiry(&format!("otp:limit:dest:{dest}:day"), DAY)?;
        if daily > self.config.max_per_destination_day {
            return Err(AuthError::RateLimited {
                retry_after_seconds: DAY.as_secs(),
            });
        }

        let global = self
            .rate_limits
            .increment_with_expiry("otp:limit:global:hour", HOUR)?;
        if global > self.config.max_global_hour {
            return Err(AuthError::RateLimited {
                retry_after_seconds: HOUR.as_secs(),
            });
        }

        Ok(())
    }

    fn code_digest(&self, code: &str) -> Result<String, AuthError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|_| AuthError::Internal(anyhow!("invalid otp pepper")))?;
        mac.update(code.as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }

    fn verify_digest(&self, code: &str, stored: &str) -> bool {
        let Ok(expected) = URL_SAFE_NO_PAD.decode(stored) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
        else {
            return false;
        };
        mac.update(code.as_bytes());
        mac.verify_slice(&expected).is_ok()
    }

    fn format_message(&self, code: &str, purpose: OtpPurpose) -> String {
        let minutes = self.config.code_ttl_seconds / 60;
        let label = match purpose {
            OtpPurpose::Verification => "verification",
            OtpPurpose::PasswordReset => "password reset",
            OtpPurpose::TwoFactor => "2FA",
            OtpPurpose::Login => "login",
        };
        format!(
            "Your {label} code is: {code}\n\nThis code will expire in {minutes} minutes.\n\nPeranto"
        )
    }
}

/// Exactly six ASCII digits, zero-padded.
fn generate_code() -> String {
    let n: u32 = OsRng.gen_range(0..1_000_000);
    format!("{n:06}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryOtpStore, MemoryRateLimitStore, MemoryUserStore};
    use std::sync::Mutex;

    /// Test sender that captures every dispatched message.
    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl MessageSender for RecordingSender {
        fn send(&self, destination: &str, body: &str) -> anyhow::Result<String> {
            self.sent
                .lock()
                .expect("sender lock")
                .push((destination.to_string(), body.to_string()));
            Ok("msg-1".to_string())
        }
    }

    impl RecordingSender {
        fn last_code(&self) -> String {
            let sent = self.sent.lock().expect("sender lock");
            let (_, body) = sent.last().expect("at least one message");
            body.chars().filter(char::is_ascii_digit).take(6).collect()
        }
    }

    struct FailingSender;

    impl MessageSender for FailingSender {
        fn send(&self, _destination: &str, _body: &str) -> anyhow::Result<String> {
            Err(anyhow::anyhow!("provider rejected the message"))
        }
    }

    struct Fixture {
        service: OtpService,
        sender: Arc<RecordingSender>,
        users: Arc<MemoryUserStore>,
    }

    fn fixture() -> Fixture {
        fixture_with(OtpConfig::default())
    }

    fn fixture_with(config: OtpConfig) -> Fixture {
        let sender = Arc::new(RecordingSender::default());
        let users = Arc::new(MemoryUserStore::new());
        let service = OtpService::new(
            Arc::new(MemoryOtpStore::new()),
            users.clone(),
            Arc::new(MemoryRateLimitStore::new()),
            sender.clone(),
            SecretString::from("otp-pepper"),
            config,
        );
        Fixture {
            service,
            sender,
            users,
        }
    }

    #[test]
    fn normalize_phone_strips_and_prefixes() {
        assert_eq!(normalize_phone("8 (912) 345-67-89"), "+89123456789");
        assert_eq!(normalize_phone("+1 234-567-8901"), "+12345678901");
        assert_eq!(normalize_phone("abc"), "");
    }

    #[test]
    fn destination_phone_validates_normalized_form() {
        let dest = Destination::phone("+1 (234) 567-8901").unwrap();
        assert_eq!(dest.as_str(), "+12345678901");
        assert!(Destination::phone("12345").is_err());
        assert!(Destination::phone("not-a-phone").is_err());
    }

    #[test]
    fn destination_email_normalizes() {
        let dest = Destination::email(" User@Example.COM ").unwrap();
        assert_eq!(dest.as_str(), "user@example.com");
        assert!(Destination::email("nope").is_err());
    }

    #[test]
    fn send_then_verify_round_trip() {
        let fx = fixture();
        let dest = Destination::phone("+12345678901").unwrap();
        fx.service.send_code(&dest, OtpPurpose::Login).unwrap();

        let code = fx.sender.last_code();
        assert_eq!(code.len(), 6);

        let verification = fx
            .service
            .verify_code(&dest, OtpPurpose::Login, &code)
            .unwrap();
        assert_eq!(verification.purpose, OtpPurpose::Login);

        // Single use: the same code fails the second time.
        let err = fx
            .service
            .verify_code(&dest, OtpPurpose::Login, &code)
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid or expired code");
    }

    #[test]
    fn resend_leaves_only_the_newest_code_live() {
        let fx = fixture();
        let dest = Destination::phone("+12345678901").unwrap();

        fx.service.send_code(&dest, OtpPurpose::Login).unwrap();
        let first = fx.sender.last_code();
        fx.service.send_code(&dest, OtpPurpose::Login).unwrap();
        let second = fx.sender.last_code();

        if first != second {
            assert!(fx
                .service
                .verify_code(&dest, OtpPurpose::Login, &first)
                .is_err());
        }
        assert!(fx
            .service
            .verify_code(&dest, OtpPurpose::Login, &second)
            .is_ok());
    }

    #[test]
    fn fourth_send_within_the_hour_is_rate_limited() {
        let fx = fixture();
        let dest = Destination::phone("+12345678901").unwrap();

        for _ in 0..3 {
            fx.service.send_code(&dest, OtpPurpose::Login).unwrap();
        }
        let err = fx.service.send_code(&dest, OtpPurpose::Login).unwrap_err();
        assert!(matches!(err, AuthError::RateLimited { .. }));

        // A different destination is unaffected.
        let other = Destination::phone("+19876543210").unwrap();
        assert!(fx.service.send_code(&other, OtpPurpose::Login).is_ok());
    }

    #[test]
    fn global_limit_applies_across_destinations() {
        let fx = fixture_with(OtpConfig::default().with_max_global_hour(2));
        let first = Destination::phone("+12345678901").unwrap();
        let second = Destination::phone("+19876543210").unwrap();
        let third = Destination::phone("+15551234567").unwrap();

        fx.service.send_code(&first, OtpPurpose::Login).unwrap();
        fx.service.send_code(&second, OtpPurpose::Login).unwrap();
        let err = fx.service.send_code(&third, OtpPurpose::Login).unwrap_err();
        assert!(matches!(err, AuthError::RateLimited { .. }));
    }

    #[test]
    fn expired_code_fails_closed() {
        let fx = fixture_with(OtpConfig::default().with_code_ttl_seconds(-1));
        let dest = Destination::phone("+12345678901").unwrap();
        fx.service.send_code(&dest, OtpPurpose::Login).unwrap();
        let code = fx.sender.last_code();

        let err = fx
            .service
            .verify_code(&dest, OtpPurpose::Login, &code)
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid or expired code");
    }

    #[test]
    fn malformed_code_shape_is_rejected() {
        let fx = fixture();
        let dest = Destination::phone("+12345678901").unwrap();
        assert!(fx
            .service
            .verify_code(&dest, OtpPurpose::Login, "12345")
            .is_err());
        assert!(fx
            .service
            .verify_code(&dest, OtpPurpose::Login, "12345a")
            .is_err());
    }

    #[test]
    fn verification_purpose_marks_phone_verified() {
        let fx = fixture();
        let mut user = User::new("a@example.com".to_string(), "alice".to_string());
        user.phone = Some("+12345678901".to_string());
        fx.users.create(&user).unwrap();

        let dest = Destination::phone("+12345678901").unwrap();
        fx.service
            .send_code(&dest, OtpPurpose::Verification)
            .unwrap();
        let code = fx.sender.last_code();

        let verification = fx
            .service
            .verify_code(&dest, OtpPurpose::Verification, &code)
            .unwrap();
        assert!(verification.user.unwrap().phone_verified);
    }

    #[test]
    fn dispatch_failure_keeps_the_stored_code_valid() {
        let otps: Arc<MemoryOtpStore> = Arc::new(MemoryOtpStore::new());
        let service = OtpService::new(
            otps.clone(),
            Arc::new(MemoryUserStore::new()),
            Arc::new(MemoryRateLimitStore::new()),
            Arc::new(FailingSender),
            SecretString::from("otp-pepper"),
            OtpConfig::default(),
        );
        let dest = Destination::phone("+12345678901").unwrap();

        let err = service.send_code(&dest, OtpPurpose::Login).unwrap_err();
        assert!(matches!(err, AuthError::UpstreamUnavailable(_)));

        assert!(otps
            .get_live("+12345678901", OtpPurpose::Login)
            .unwrap()
            .is_some());
    }

    #[test]
    fn generated_codes_are_six_digits() {
        for _ in 0..32 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            assert!(code.bytes().all(|b| b.is_ascii_digit()));
        }
    }
}
