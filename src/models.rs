//! Core identity records shared across the broker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_USER: &str = "user";

/// Identity record. Created on sign-up or first federation login.
///
/// `password_hash` is empty for federation-only accounts; `totp_secret` holds
/// a pending secret until [`crate::twofa`] confirms enrollment and flips
/// `totp_enabled`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub full_name: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub roles: Vec<String>,
    pub phone: Option<String>,
    pub email_verified: bool,
    pub phone_verified: bool,
    pub totp_enabled: bool,
    #[serde(skip_serializing, default)]
    pub totp_secret: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    #[must_use]
    pub fn new(email: String, username: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            email,
            username,
            full_name: String::new(),
            password_hash: String::new(),
            roles: vec![ROLE_USER.to_string()],
            phone: None,
            email_verified: false,
            phone_verified: false,
            totp_enabled: false,
            totp_secret: None,
            active: true,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Access/refresh pair handed back after a completed sign-in.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Access-token lifetime in seconds.
    pub expires_in: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_user_defaults() {
        let user = User::new("a@example.com".to_string(), "alice".to_string());
        assert_eq!(user.roles, vec![ROLE_USER.to_string()]);
        assert!(user.active);
        assert!(!user.totp_enabled);
        assert!(user.password_hash.is_empty());
    }

    #[test]
    fn has_role_matches_exactly() {
        let mut user = User::new("a@example.com".to_string(), "alice".to_string());
        user.roles.push(ROLE_ADMIN.to_string());
        assert!(user.has_role(ROLE_ADMIN));
        assert!(!user.has_role("operator"));
    }

    #[test]
    fn password_hash_not_serialized() {
        let mut user = User::new("a@example.com".to_string(), "alice".to_string());
        user.password_hash = "secret-hash".to_string();
        let json = serde_json::to_string(&user).expect("serialize user");
        assert!(!json.contains("secret-hash"));
    }
}
