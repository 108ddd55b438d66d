//! Federation broker: external-provider authorization-code exchange and
//! account linking.
//!
//! One login attempt walks a fixed ladder — state issued, code received,
//! tokens exchanged, profile fetched, account resolved, credential issued —
//! and no step may be skipped. The `state` echo check is a structural CSRF
//! defense, not an option. Failures abort with no partial account mutation.

pub mod profile;
pub mod providers;

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use reqwest::header::ACCEPT;
use reqwest::Client;
use serde::Deserialize;
use tracing::error;
use url::Url;
use uuid::Uuid;

use crate::auth::{normalize_email, valid_email};
use crate::error::AuthError;
use crate::models::{TokenPair, User};
use crate::store::{OAuthAccountRecord, OAuthAccountStore, UserStore};
use crate::token::TokenService;

pub use profile::NormalizedProfile;
pub use providers::{ProviderConfig, ProviderRegistry};

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);
const USERNAME_SUFFIX_ID_CHARS: usize = 8;

/// Token material returned by a provider's token endpoint.
#[derive(Clone, Debug, Deserialize)]
pub struct ProviderTokenSet {
    pub access_token: String,
    pub token_type: Option<String>,
    pub expires_in: Option<i64>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
}

/// Result of a completed federation login.
#[derive(Debug)]
pub struct FederationLogin {
    pub pair: TokenPair,
    pub user: User,
    pub is_new_user: bool,
}

pub struct FederationService {
    registry: ProviderRegistry,
    users: Arc<dyn UserStore>,
    accounts: Arc<dyn OAuthAccountStore>,
    tokens: Arc<TokenService>,
    client: Client,
}

impl FederationService {
    /// # Errors
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(
        registry: ProviderRegistry,
        users: Arc<dyn UserStore>,
        accounts: Arc<dyn OAuthAccountStore>,
        tokens: Arc<TokenService>,
    ) -> Result<Self, AuthError> {
        let client = Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(EXCHANGE_TIMEOUT)
            .build()
            .map_err(|err| AuthError::Internal(anyhow!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            registry,
            users,
            accounts,
            tokens,
            client,
        })
    }

    /// Cryptographically random opaque token bound to the browser session;
    /// the callback must echo it back.
    #[must_use]
    pub fn generate_state() -> String {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// # Errors
    /// Fails with `Invalid` for an unknown/unconfigured provider or an empty
    /// state.
    pub fn build_authorization_url(&self, provider: &str, state: &str) -> Result<String, AuthError> {
        if state.is_empty() {
            return Err(AuthError::Invalid("state must not be empty".to_string()));
        }
        let config = self.provider(provider)?;
        let mut url = Url::parse(&config.auth_url).map_err(|_| {
            AuthError::Invalid(format!("provider {provider} has an invalid authorization URL"))
        })?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("client_id", &config.client_id);
            pairs.append_pair("redirect_uri", &config.callback_url);
            pairs.append_pair("response_type", "code");
            pairs.append_pair("state", state);
            pairs.append_pair("scope", &config.scopes.join(" "));
            for (key, value) in &config.extra_auth_params {
                pairs.append_pair(key, value);
            }
        }
        Ok(url.into())
    }

    /// One round trip to the provider's token endpoint. Non-2xx fails closed.
    ///
    /// # Errors
    /// Fails with `UpstreamUnavailable` on timeout, transport error or a
    /// non-success status.
    pub async fn exchange_code(
        &self,
        provider: &str,
        code: &str,
    ) -> Result<ProviderTokenSet, AuthError> {
        use secrecy::ExposeSecret;

        let config = self.provider(provider)?;
        let params = [
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.expose_secret()),
            ("code", code),
            ("redirect_uri", config.callback_url.as_str()),
            ("grant_type", "authorization_code"),
        ];

        let response = self
            .client
            .post(&config.token_url)
            .header(ACCEPT, "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|err| {
                error!(provider = provider, error = %err, "token exchange transport failure");
                AuthError::UpstreamUnavailable("token exchange failed".to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            error!(provider = provider, status = %status, "token exchange rejected");
            return Err(AuthError::UpstreamUnavailable(format!(
                "token exchange failed with status {status}"
            )));
        }

        response.json::<ProviderTokenSet>().await.map_err(|err| {
            error!(provider = provider, error = %err, "token exchange returned bad payload");
            AuthError::UpstreamUnavailable("token exchange returned an invalid payload".to_string())
        })
    }

    /// One round trip to the provider's user-info endpoint, then the pure
    /// per-provider field mapping.
    ///
    /// # Errors
    /// Fails with `UpstreamUnavailable` on transport problems and `Invalid`
    /// when the payload cannot be mapped.
    pub async fn fetch_profile(
        &self,
        provider: &str,
        provider_access_token: &str,
    ) -> Result<NormalizedProfile, AuthError> {
        let config = self.provider(provider)?;
        let response = self
            .client
            .get(&config.user_info_url)
            .bearer_auth(provider_access_token)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|err| {
                error!(provider = provider, error = %err, "profile fetch transport failure");
                AuthError::UpstreamUnavailable("profile fetch failed".to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            error!(provider = provider, status = %status, "profile fetch rejected");
            return Err(AuthError::UpstreamUnavailable(format!(
                "profile fetch failed with status {status}"
            )));
        }

        let raw = response.json::<serde_json::Value>().await.map_err(|err| {
            error!(provider = provider, error = %err, "profile fetch returned bad payload");
            AuthError::UpstreamUnavailable("profile fetch returned an invalid payload".to_string())
        })?;
        profile::parse(provider, &raw)
    }

    /// Look up or synthesize the local account for a normalized profile.
    ///
    /// On revisit the cached provider tokens and the profile snapshot are
    /// refreshed. On first visit a local user is created: a missing email
    /// becomes a deterministic placeholder so the uniqueness constraint
    /// holds, and the username is lowercased and suffixed until unique. A
    /// real provider email already owned by a different local account is a
    /// `Conflict` — no silent merge.
    ///
    /// # Errors
    /// Fails with `Conflict` on the email collision described above.
    pub fn resolve_account(
        &self,
        profile: &NormalizedProfile,
        token_set: &ProviderTokenSet,
    ) -> Result<(User, bool), AuthError> {
        let token_expires_at = token_set
            .expires_in
            .filter(|seconds| *seconds > 0)
            .map(|seconds| Utc::now() + chrono::Duration::seconds(seconds));
        let profile_json = serde_json::to_string(profile)
            .map_err(|err| AuthError::Internal(anyhow!("profile snapshot: {err}")))?;

        if let Some(account) = self
            .accounts
            .get(&profile.provider, &profile.provider_user_id)?
        {
            self.accounts.update_tokens(
                account.id,
                &token_set.access_token,
                token_set.refresh_token.as_deref(),
                token_expires_at,
                &profile_json,
            )?;
            let user = self.users.get_by_id(account.user_id)?.ok_or_else(|| {
                AuthError::Internal(anyhow!(
                    "federated account {} points at a missing user",
                    account.id
                ))
            })?;
            return Ok((user, false));
        }

        let real_email = profile
            .email
            .as_deref()
            .map(normalize_email)
            .filter(|email| valid_email(email));
        if let Some(email) = &real_email {
            if self.users.get_by_email(email)?.is_some() {
                return Err(AuthError::Conflict);
            }
        }
        let email = real_email.clone().unwrap_or_else(|| {
            format!(
                "{}_{}@oauth.local",
                profile.provider, profile.provider_user_id
            )
        });

        let mut user = User::new(email, self.unique_username(profile)?);
        user.full_name = profile.name.clone().unwrap_or_default();
        user.email_verified = real_email.is_some();
        self.users.create(&user)?;

        let record = OAuthAccountRecord {
            id: Uuid::new_v4(),
            user_id: user.id,
            provider: profile.provider.clone(),
            provider_user_id: profile.provider_user_id.clone(),
            access_token: token_set.access_token.clone(),
            refresh_token: token_set.refresh_token.clone(),
            token_expires_at,
            profile_json,
        };
        self.accounts.create(&record)?;

        Ok((user, true))
    }

    /// Chains the full ladder and ends in the credential issuer.
    ///
    /// # Errors
    /// Fails with `Invalid` on a state mismatch before any provider call.
    pub async fn complete_login(
        &self,
        provider: &str,
        code: &str,
        state: &str,
        expected_state: &str,
    ) -> Result<FederationLogin, AuthError> {
        if expected_state.is_empty() || state != expected_state {
            return Err(AuthError::Invalid("state mismatch".to_string()));
        }
        let token_set = self.exchange_code(provider, code).await?;
        let profile = self.fetch_profile(provider, &token_set.access_token).await?;
        let (user, is_new_user) = self.resolve_account(&profile, &token_set)?;
        let pair = self.tokens.issue_pair(&user)?;
        Ok(FederationLogin {
            pair,
            user,
            is_new_user,
        })
    }

    fn provider(&self, name: &str) -> Result<&ProviderConfig, AuthError> {
        self.registry
            .get(name)
            .ok_or_else(|| AuthError::Invalid(format!("unknown or unconfigured provider {name}")))
    }

    fn unique_username(&self, profile: &NormalizedProfile) -> Result<String, AuthError> {
        let fallback = || {
            let id_prefix: String = profile
                .provider_user_id
                .chars()
                .take(USERNAME_SUFFIX_ID_CHARS)
                .collect();
            format!("{}_{}", profile.provider, id_prefix)
        };
        let base = profile
            .username
            .clone()
            .or_else(|| profile.name.clone())
            .map(|raw| normalize_username(&raw))
            .filter(|candidate| candidate.len() >= 3)
            .unwrap_or_else(fallback);

        let mut candidate = base.clone();
        let mut counter = 1u32;
        while self.users.username_exists(&candidate)? {
            candidate = format!("{base}{counter}");
            counter += 1;
        }
        Ok(candidate)
    }
}

/// Lowercase and strip anything that is not letter, digit, `.`, `_` or `-`.
fn normalize_username(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect()
}
