//! Per-provider profile mapping.
//!
//! Every provider names its fields differently and some omit email or
//! username entirely. Each mapping is a pure function from the provider's raw
//! JSON payload to one normalized shape, testable without any network access.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::providers::{
    PROVIDER_GITHUB, PROVIDER_GOOGLE, PROVIDER_INSTAGRAM, PROVIDER_YANDEX,
};
use crate::error::AuthError;

/// Provider-independent profile shape consumed by account resolution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedProfile {
    pub provider: String,
    pub provider_user_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
}

/// Map a raw user-info payload into the normalized shape.
///
/// # Errors
/// Fails with `Invalid` for an unsupported provider or a payload without a
/// usable user id.
pub fn parse(provider: &str, raw: &Value) -> Result<NormalizedProfile, AuthError> {
    let profile = match provider {
        PROVIDER_GOOGLE => parse_google(raw),
        PROVIDER_GITHUB => parse_github(raw),
        PROVIDER_YANDEX => parse_yandex(raw),
        PROVIDER_INSTAGRAM => parse_instagram(raw),
        other => {
            return Err(AuthError::Invalid(format!(
                "no profile mapping for provider {other}"
            )))
        }
    };
    if profile.provider_user_id.is_empty() {
        return Err(AuthError::Invalid(
            "provider profile is missing a user id".to_string(),
        ));
    }
    Ok(profile)
}

fn parse_google(raw: &Value) -> NormalizedProfile {
    NormalizedProfile {
        provider: PROVIDER_GOOGLE.to_string(),
        provider_user_id: id_field(raw, "id"),
        email: string_field(raw, "email"),
        name: string_field(raw, "name"),
        username: None,
        avatar_url: string_field(raw, "picture"),
    }
}

fn parse_github(raw: &Value) -> NormalizedProfile {
    NormalizedProfile {
        provider: PROVIDER_GITHUB.to_string(),
        // GitHub ids are numeric in the payload.
        provider_user_id: id_field(raw, "id"),
        email: string_field(raw, "email"),
        name: string_field(raw, "name"),
        username: string_field(raw, "login"),
        avatar_url: string_field(raw, "avatar_url"),
    }
}

fn parse_yandex(raw: &Value) -> NormalizedProfile {
    NormalizedProfile {
        provider: PROVIDER_YANDEX.to_string(),
        provider_user_id: id_field(raw, "id"),
        email: string_field(raw, "default_email"),
        name: string_field(raw, "real_name"),
        username: string_field(raw, "login"),
        avatar_url: None,
    }
}

fn parse_instagram(raw: &Value) -> NormalizedProfile {
    // Instagram has no email and no display name beyond the handle.
    let username = string_field(raw, "username");
    NormalizedProfile {
        provider: PROVIDER_INSTAGRAM.to_string(),
        provider_user_id: id_field(raw, "id"),
        email: None,
        name: username.clone(),
        username,
        avatar_url: None,
    }
}

fn string_field(raw: &Value, key: &str) -> Option<String> {
    raw.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

/// Ids may arrive as strings or numbers; empty means missing.
fn id_field(raw: &Value, key: &str) -> String {
    match raw.get(key) {
        Some(Value::String(value)) => value.trim().to_string(),
        Some(Value::Number(value)) => value.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn google_maps_picture_and_email() {
        let raw = json!({
            "id": "108357",
            "email": "alice@example.com",
            "name": "Alice Example",
            "picture": "https://lh3.example/photo.jpg"
        });
        let profile = parse("google", &raw).unwrap();
        assert_eq!(profile.provider_user_id, "108357");
        assert_eq!(profile.email.as_deref(), Some("alice@example.com"));
        assert_eq!(profile.name.as_deref(), Some("Alice Example"));
        assert_eq!(profile.username, None);
        assert_eq!(
            profile.avatar_url.as_deref(),
            Some("https://lh3.example/photo.jpg")
        );
    }

    #[test]
    fn github_accepts_numeric_id_and_null_email() {
        let raw = json!({
            "id": 583231,
            "login": "octocat",
            "name": "The Octocat",
            "email": null,
            "avatar_url": "https://avatars.example/583231"
        });
        let profile = parse("github", &raw).unwrap();
        assert_eq!(profile.provider_user_id, "583231");
        assert_eq!(profile.email, None);
        assert_eq!(profile.username.as_deref(), Some("octocat"));
    }

    #[test]
    fn yandex_reads_default_email_and_login() {
        let raw = json!({
            "id": "1000034426",
            "login": "alisa",
            "default_email": "alisa@yandex.ru",
            "real_name": "Alisa Petrova"
        });
        let profile = parse("yandex", &raw).unwrap();
        assert_eq!(profile.email.as_deref(), Some("alisa@yandex.ru"));
        assert_eq!(profile.username.as_deref(), Some("alisa"));
        assert_eq!(profile.name.as_deref(), Some("Alisa Petrova"));
    }

    #[test]
    fn instagram_has_no_email() {
        let raw = json!({"id": "17841400", "username": "alice.gram"});
        let profile = parse("instagram", &raw).unwrap();
        assert_eq!(profile.email, None);
        assert_eq!(profile.username.as_deref(), Some("alice.gram"));
        assert_eq!(profile.name.as_deref(), Some("alice.gram"));
    }

    #[test]
    fn missing_id_is_rejected() {
        let raw = json!({"email": "alice@example.com"});
        assert!(parse("google", &raw).is_err());
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let raw = json!({"id": "1"});
        assert!(parse("myspace", &raw).is_err());
    }

    #[test]
    fn empty_strings_count_as_absent() {
        let raw = json!({"id": "9", "email": "", "name": "  "});
        let profile = parse("google", &raw).unwrap();
        assert_eq!(profile.email, None);
        assert_eq!(profile.name, None);
    }
}
