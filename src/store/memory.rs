//! In-process store implementations.
//!
//! Backs tests and single-node deployments. Every mutating operation takes the
//! store's single lock, so test-and-set operations (`mark_used`, `consume`,
//! uniqueness checks in `create`) are atomic without any extra coordination.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use super::{
    BackupCodeRecord, BackupCodeStore, MessageSender, OAuthAccountRecord, OAuthAccountStore,
    OtpRecord, OtpStore, RateLimitStore, RefreshTokenRecord, RefreshTokenStore, StoreResult,
    UserStore,
};
use crate::models::User;
use crate::otp::OtpPurpose;

#[derive(Default)]
pub struct MemoryUserStore {
    users: RwLock<HashMap<Uuid, User>>,
}

impl MemoryUserStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl UserStore for MemoryUserStore {
    fn get_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.users.read().expect("user store lock").get(&id).cloned())
    }

    fn get_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        Ok(self
            .users
            .read()
            .expect("user store lock")
            .values()
            .find(|user| user.email == email)
            .cloned())
    }

    fn get_by_phone(&self, phone: &str) -> StoreResult<Option<User>> {
        Ok(self
            .users
            .read()
            .expect("user store lock")
            .values()
            .find(|user| user.phone.as_deref() == Some(phone))
            .cloned())
    }

    fn username_exists(&self, username: &str) -> StoreResult<bool> {
        Ok(self
            .users
            .read()
            .expect("user store lock")
            .values()
            .any(|user| user.username == username))
    }

    fn create(&self, user: &User) -> StoreResult<()> {
        let mut users = self.users.write().expect("user store lock");
        let taken = users
            .values()
            .any(|existing| existing.email == user.email || existing.username == user.username);
        if taken {
            return Err(super::StoreError::Duplicate);
        }
        users.insert(user.id, user.clone());
        Ok(())
    }

    fn update_password_hash(&self, id: Uuid, password_hash: &str) -> StoreResult<()> {
        self.with_user(id, |user| password_hash.clone_into(&mut user.password_hash))
    }

    fn update_totp_secret(&self, id: Uuid, secret: &str) -> StoreResult<()> {
        self.with_user(id, |user| user.totp_secret = Some(secret.to_string()))
    }

    fn enable_totp(&self, id: Uuid) -> StoreResult<()> {
        self.with_user(id, |user| user.totp_enabled = true)
    }

    fn disable_totp(&self, id: Uuid) -> StoreResult<()> {
        self.with_user(id, |user| {
            user.totp_enabled = false;
            user.totp_secret = None;
        })
    }

    fn mark_email_verified(&self, id: Uuid) -> StoreResult<()> {
        self.with_user(id, |user| user.email_verified = true)
    }

    fn mark_phone_verified(&self, id: Uuid) -> StoreResult<()> {
        self.with_user(id, |user| user.phone_verified = true)
    }
}

impl MemoryUserStore {
    fn with_user(&self, id: Uuid, mutate: impl FnOnce(&mut User)) -> StoreResult<()> {
        let mut users = self.users.write().expect("user store lock");
        let user = users
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("user {id} not found"))?;
        mutate(user);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryRefreshTokenStore {
    records: Mutex<HashMap<String, RefreshTokenRecord>>,
}

impl MemoryRefreshTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RefreshTokenStore for MemoryRefreshTokenStore {
    fn create(&self, record: &RefreshTokenRecord) -> StoreResult<()> {
        self.records
            .lock()
            .expect("refresh store lock")
            .insert(record.token_hash.clone(), record.clone());
        Ok(())
    }

    fn lookup(&self, token_hash: &str) -> StoreResult<Option<RefreshTokenRecord>> {
        Ok(self
            .records
            .lock()
            .expect("refresh store lock")
            .get(token_hash)
            .cloned())
    }

    fn revoke(&self, token_hash: &str) -> StoreResult<()> {
        if let Some(record) = self
            .records
            .lock()
            .expect("refresh store lock")
            .get_mut(token_hash)
        {
            record.revoked = true;
        }
        Ok(())
    }

    fn revoke_all_for_user(&self, user_id: Uuid) -> StoreResult<()> {
        for record in self
            .records
            .lock()
            .expect("refresh store lock")
            .values_mut()
        {
            if record.user_id == user_id {
                record.revoked = true;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryOAuthAccountStore {
    accounts: Mutex<Vec<OAuthAccountRecord>>,
}

impl MemoryOAuthAccountStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl OAuthAccountStore for MemoryOAuthAccountStore {
    fn get(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> StoreResult<Option<OAuthAccountRecord>> {
        Ok(self
            .accounts
            .lock()
            .expect("oauth store lock")
            .iter()
            .find(|acct| acct.provider == provider && acct.provider_user_id == provider_user_id)
            .cloned())
    }

    fn create(&self, record: &OAuthAccountRecord) -> StoreResult<()> {
        let mut accounts = self.accounts.lock().expect("oauth store lock");
        let exists = accounts.iter().any(|acct| {
            acct.provider == record.provider && acct.provider_user_id == record.provider_user_id
        });
        if exists {
            return Err(super::StoreError::Duplicate);
        }
        accounts.push(record.clone());
        Ok(())
    }

    fn update_tokens(
        &self,
        id: Uuid,
        access_token: &str,
        refresh_token: Option<&str>,
        token_expires_at: Option<DateTime<Utc>>,
        profile_json: &str,
    ) -> StoreResult<()> {
        let mut accounts = self.accounts.lock().expect("oauth store lock");
        let account = accounts
            .iter_mut()
            .find(|acct| acct.id == id)
            .ok_or_else(|| anyhow::anyhow!("oauth account {id} not found"))?;
        access_token.clone_into(&mut account.access_token);
        if let Some(refresh) = refresh_token {
            account.refresh_token = Some(refresh.to_string());
        }
        account.token_expires_at = token_expires_at;
        profile_json.clone_into(&mut account.profile_json);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryOtpStore {
    records: Mutex<Vec<OtpRecord>>,
}

impl MemoryOtpStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl OtpStore for MemoryOtpStore {
    fn create(&self, record: &OtpRecord) -> StoreResult<()> {
        self.records
            .lock()
            .expect("otp store lock")
            .push(record.clone());
        Ok(())
    }

    fn get_live(&self, destination: &str, purpose: OtpPurpose) -> StoreResult<Option<OtpRecord>> {
        Ok(self
            .records
            .lock()
            .expect("otp store lock")
            .iter()
            .rev()
            .find(|rec| rec.destination == destination && rec.purpose == purpose && !rec.used)
            .cloned())
    }

    fn invalidate_all_for(&self, destination: &str, purpose: OtpPurpose) -> StoreResult<()> {
        for record in self.records.lock().expect("otp store lock").iter_mut() {
            if record.destination == destination && record.purpose == purpose {
                record.used = true;
            }
        }
        Ok(())
    }

    fn mark_used(&self, id: Uuid) -> StoreResult<bool> {
        let mut records = self.records.lock().expect("otp store lock");
        match records.iter_mut().find(|rec| rec.id == id) {
            Some(record) if !record.used => {
                record.used = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[derive(Default)]
pub struct MemoryBackupCodeStore {
    records: Mutex<Vec<BackupCodeRecord>>,
}

impl MemoryBackupCodeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BackupCodeStore for MemoryBackupCodeStore {
    fn replace_all(&self, user_id: Uuid, code_hashes: &[String]) -> StoreResult<()> {
        let mut records = self.records.lock().expect("backup store lock");
        records.retain(|rec| rec.user_id != user_id);
        for hash in code_hashes {
            records.push(BackupCodeRecord {
                id: Uuid::new_v4(),
                user_id,
                code_hash: hash.clone(),
                used: false,
            });
        }
        Ok(())
    }

    fn unused_for(&self, user_id: Uuid) -> StoreResult<Vec<BackupCodeRecord>> {
        Ok(self
            .records
            .lock()
            .expect("backup store lock")
            .iter()
            .filter(|rec| rec.user_id == user_id && !rec.used)
            .cloned()
            .collect())
    }

    fn consume(&self, id: Uuid) -> StoreResult<bool> {
        let mut records = self.records.lock().expect("backup store lock");
        match records.iter_mut().find(|rec| rec.id == id) {
            Some(record) if !record.used => {
                record.used = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn delete_all(&self, user_id: Uuid) -> StoreResult<()> {
        self.records
            .lock()
            .expect("backup store lock")
            .retain(|rec| rec.user_id != user_id);
        Ok(())
    }

    fn count_unused(&self, user_id: Uuid) -> StoreResult<usize> {
        Ok(self
            .records
            .lock()
            .expect("backup store lock")
            .iter()
            .filter(|rec| rec.user_id == user_id && !rec.used)
            .count())
    }
}

/// Counter with per-key expiry; the increment happens under the lock so two
/// concurrent requests cannot both observe the pre-increment count.
#[derive(Default)]
pub struct MemoryRateLimitStore {
    counters: Mutex<HashMap<String, (u64, Instant)>>,
}

impl MemoryRateLimitStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RateLimitStore for MemoryRateLimitStore {
    fn increment_with_expiry(&self, key: &str, window: Duration) -> StoreResult<u64> {
        let mut counters = self.counters.lock().expect("rate limit lock");
        let now = Instant::now();
        let entry = counters
            .entry(key.to_string())
            .and_modify(|(count, expires_at)| {
                if *expires_at <= now {
                    *count = 0;
                    *expires_at = now + window;
                }
                *count += 1;
            })
            .or_insert((1, now + window));
        Ok(entry.0)
    }
}

/// Local dev sender that logs instead of dispatching a real message.
#[derive(Clone, Debug)]
pub struct LogMessageSender;

impl MessageSender for LogMessageSender {
    fn send(&self, destination: &str, body: &str) -> anyhow::Result<String> {
        info!(destination = %destination, body = %body, "message send stub");
        Ok(Uuid::new_v4().to_string())
    }
}
