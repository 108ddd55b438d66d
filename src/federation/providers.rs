//! External identity provider registry.
//!
//! Providers differ only in data: endpoints, scopes and a handful of extra
//! authorization parameters. One immutable config value per provider, keyed
//! by name, populated at startup; field-mapping differences live in
//! [`super::profile`].

use std::collections::HashMap;
use std::env;

use secrecy::SecretString;

pub const PROVIDER_GOOGLE: &str = "google";
pub const PROVIDER_GITHUB: &str = "github";
pub const PROVIDER_YANDEX: &str = "yandex";
pub const PROVIDER_INSTAGRAM: &str = "instagram";

#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub name: String,
    pub client_id: String,
    pub client_secret: SecretString,
    pub callback_url: String,
    pub auth_url: String,
    pub token_url: String,
    pub user_info_url: String,
    pub scopes: Vec<String>,
    /// Appended to the authorization URL, e.g. Google's offline access.
    pub extra_auth_params: Vec<(String, String)>,
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, ProviderConfig>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, config: ProviderConfig) {
        self.providers.insert(config.name.clone(), config);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    /// Seed the registry from `{PROVIDER}_CLIENT_ID` / `_CLIENT_SECRET` /
    /// `_CALLBACK_URL` environment variables. A provider without a client id
    /// is left out entirely, so looking it up later fails as unconfigured.
    #[must_use]
    pub fn from_env() -> Self {
        let mut registry = Self::new();
        for name in [
            PROVIDER_GOOGLE,
            PROVIDER_GITHUB,
            PROVIDER_YANDEX,
            PROVIDER_INSTAGRAM,
        ] {
            if let Some(config) = provider_from_env(name) {
                registry.register(config);
            }
        }
        registry
    }
}

fn provider_from_env(name: &str) -> Option<ProviderConfig> {
    let prefix = name.to_uppercase();
    let client_id = env::var(format!("{prefix}_CLIENT_ID"))
        .ok()
        .filter(|value| !value.is_empty())?;
    let client_secret = env::var(format!("{prefix}_CLIENT_SECRET")).unwrap_or_default();
    let callback_url = env::var(format!("{prefix}_CALLBACK_URL")).unwrap_or_default();
    Some(provider_defaults(
        name,
        client_id,
        SecretString::from(client_secret),
        callback_url,
    ))
}

/// Endpoint and scope table per supported provider.
#[must_use]
pub fn provider_defaults(
    name: &str,
    client_id: String,
    client_secret: SecretString,
    callback_url: String,
) -> ProviderConfig {
    let (auth_url, token_url, user_info_url, scopes, extra_auth_params): (
        &str,
        &str,
        &str,
        &[&str],
        &[(&str, &str)],
    ) = match name {
        PROVIDER_GITHUB => (
            "https://github.com/login/oauth/authorize",
            "https://github.com/login/oauth/access_token",
            "https://api.github.com/user",
            &["user:email"],
            &[],
        ),
        PROVIDER_YANDEX => (
            "https://oauth.yandex.ru/authorize",
            "https://oauth.yandex.ru/token",
            "https://login.yandex.ru/info",
            &["login:email", "login:info"],
            &[],
        ),
        PROVIDER_INSTAGRAM => (
            "https://api.instagram.com/oauth/authorize",
            "https://api.instagram.com/oauth/access_token",
            "https://graph.instagram.com/me",
            &["user_profile"],
            &[],
        ),
        // Google is also the fallback shape for unknown names so tests can
        // register synthetic providers through `register`.
        _ => (
            "https://accounts.google.com/o/oauth2/v2/auth",
            "https://oauth2.googleapis.com/token",
            "https://www.googleapis.com/oauth2/v2/userinfo",
            &["openid", "profile", "email"],
            &[("access_type", "offline"), ("prompt", "consent")],
        ),
    };

    ProviderConfig {
        name: name.to_string(),
        client_id,
        client_secret,
        callback_url,
        auth_url: auth_url.to_string(),
        token_url: token_url.to_string(),
        user_info_url: user_info_url.to_string(),
        scopes: scopes.iter().map(ToString::to_string).collect(),
        extra_auth_params: extra_auth_params
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect(),
    }
}
