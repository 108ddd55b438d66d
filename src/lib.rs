//! # Peranto (Identity Broker Core)
//!
//! `peranto` authenticates end users through independent channels (password,
//! federated identity providers, time-based one-time codes, out-of-band
//! SMS/email codes) and issues short-lived, signed credentials that
//! downstream services verify without a database round trip.
//!
//! ## Credential lifecycle
//!
//! A successful sign-in attempt, whatever the channel, produces a [`models::User`];
//! the [`token`] module turns that into an access/refresh pair. Every protected
//! request then passes through the [`middleware`] validation layer, which caches
//! recent verdicts for a short TTL and populates request-scoped identity.
//!
//! ## Collaborators
//!
//! Persistence, message transport and permission evaluation are external
//! collaborators behind the traits in [`store`]. The in-process implementations
//! in `store::memory` back tests and single-node deployments.
//!
//! ## Security boundaries
//!
//! - Raw tokens, OTP codes and backup codes are never persisted; only one-way
//!   digests are stored.
//! - Security-relevant 2FA operations require a fresh proof of possession
//!   (password and/or a live code); a bearer credential alone is not enough.
//! - OTP and 2FA verification failures are deliberately generic to prevent
//!   account enumeration.

pub mod api;
pub mod auth;
pub mod cli;
pub mod error;
pub mod federation;
pub mod middleware;
pub mod models;
pub mod otp;
pub mod store;
pub mod token;
pub mod twofa;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
