//! Validation cache middleware: the entry point for every protected request.
//!
//! A bearer credential is pulled from configurable sources (first non-empty
//! wins), checked against a short-TTL verdict cache keyed by the credential's
//! digest, and on a miss handed to a validation authority — local signature
//! verification or a remote endpoint. A positive verdict populates the
//! request-scoped [`AuthContext`]; an authority outage fails closed and is
//! never cached, so recovery is immediate once the authority returns.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::{HeaderMap, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::error::AuthError;
use crate::models::ROLE_ADMIN;
use crate::token::{self, Claims, TokenService};

const DEFAULT_POSITIVE_TTL: Duration = Duration::from_secs(30);
const DEFAULT_NEGATIVE_TTL: Duration = Duration::from_secs(30);
const DEFAULT_MAX_ENTRIES: usize = 10_000;
const REMOTE_TIMEOUT: Duration = Duration::from_secs(5);

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Where to look for the bearer credential, tried in order.
#[derive(Clone, Debug)]
pub enum TokenSource {
    BearerHeader,
    Header(String),
    Cookie(String),
    Query(String),
}

/// Request-scoped identity populated after a positive verdict.
#[derive(Clone, Debug, Serialize)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub email: String,
    pub username: String,
    pub roles: Vec<String>,
    pub application_id: Option<Uuid>,
}

impl AuthContext {
    pub(crate) fn from_claims(claims: &Claims) -> Self {
        Self {
            user_id: claims.user_id,
            email: claims.email.clone(),
            username: claims.username.clone(),
            roles: claims.roles.clone(),
            application_id: claims.application_id,
        }
    }

    /// `admin` passes every role check.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles
            .iter()
            .any(|held| held == role || held == ROLE_ADMIN)
    }

    #[must_use]
    pub fn has_any_role(&self, roles: &[&str]) -> bool {
        roles.iter().any(|role| self.has_role(role))
    }
}

/// # Errors
/// Fails with `Forbidden` when the role is not held.
pub fn require_role(context: &AuthContext, role: &str) -> Result<(), AuthError> {
    if context.has_role(role) {
        Ok(())
    } else {
        Err(AuthError::Forbidden)
    }
}

/// # Errors
/// Fails with `Forbidden` when none of the roles are held.
pub fn require_any_role(context: &AuthContext, roles: &[&str]) -> Result<(), AuthError> {
    if context.has_any_role(roles) {
        Ok(())
    } else {
        Err(AuthError::Forbidden)
    }
}

/// Cacheable outcome of a validation call.
#[derive(Clone, Debug)]
pub enum Verdict {
    Valid(AuthContext),
    Invalid,
}

/// Opaque validity oracle; local signature verification or a remote service.
pub trait ValidationAuthority: Send + Sync {
    fn validate<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<Verdict, AuthError>>;
}

/// Verifies locally against the in-process [`TokenService`].
pub struct LocalAuthority {
    tokens: Arc<TokenService>,
}

impl LocalAuthority {
    #[must_use]
    pub fn new(tokens: Arc<TokenService>) -> Self {
        Self { tokens }
    }
}

impl ValidationAuthority for LocalAuthority {
    fn validate<'a>(&'a self, raw: &'a str) -> BoxFuture<'a, Result<Verdict, AuthError>> {
        Box::pin(async move {
            match self.tokens.verify_access(raw) {
                Ok(claims) => Ok(Verdict::Valid(AuthContext::from_claims(&claims))),
                Err(token::Error::Store(err)) => Err(AuthError::Internal(err)),
                Err(_) => Ok(Verdict::Invalid),
            }
        })
    }
}

#[derive(Debug, Deserialize)]
struct RemoteVerdict {
    valid: bool,
    user_id: Option<Uuid>,
    email: Option<String>,
    username: Option<String>,
    roles: Option<Vec<String>>,
    application_id: Option<Uuid>,
}

/// Posts the raw token to a remote validation endpoint.
pub struct RemoteAuthority {
    client: Client,
    validate_url: String,
}

impl RemoteAuthority {
    /// # Errors
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(validate_url: String) -> Result<Self, AuthError> {
        let client = Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(REMOTE_TIMEOUT)
            .build()
            .map_err(|err| AuthError::Internal(anyhow!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            validate_url,
        })
    }
}

impl ValidationAuthority for RemoteAuthority {
    fn validate<'a>(&'a self, raw: &'a str) -> BoxFuture<'a, Result<Verdict, AuthError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.validate_url)
                .json(&serde_json::json!({ "token": raw }))
                .send()
                .await
                .map_err(|err| {
                    error!(error = %err, "validation authority unreachable");
                    AuthError::UpstreamUnavailable("validation authority unreachable".to_string())
                })?;

            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Ok(Verdict::Invalid);
            }
            if !status.is_success() {
                error!(status = %status, "validation authority error");
                return Err(AuthError::UpstreamUnavailable(format!(
                    "validation authority answered {status}"
                )));
            }

            let verdict = response.json::<RemoteVerdict>().await.map_err(|err| {
                error!(error = %err, "validation authority returned bad payload");
                AuthError::UpstreamUnavailable(
                    "validation authority returned an invalid payload".to_string(),
                )
            })?;

            let Some(user_id) = verdict.user_id.filter(|_| verdict.valid) else {
                return Ok(Verdict::Invalid);
            };
            Ok(Verdict::Valid(AuthContext {
                user_id,
                email: verdict.email.unwrap_or_default(),
                username: verdict.username.unwrap_or_default(),
                roles: verdict.roles.unwrap_or_default(),
                application_id: verdict.application_id,
            }))
        })
    }
}

struct CacheEntry {
    verdict: Verdict,
    expires_at: Instant,
}

/// Bounded-TTL concurrent verdict map. Expired entries are dropped on read;
/// a sweep runs when the map reaches its bound so it cannot grow without
/// limit.
pub struct ValidationCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    positive_ttl: Duration,
    negative_ttl: Duration,
    max_entries: usize,
}

impl ValidationCache {
    #[must_use]
    pub fn new(positive_ttl: Duration, negative_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            positive_ttl,
            negative_ttl,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }

    fn get(&self, key: &str) -> Option<Verdict> {
        let now = Instant::now();
        {
            let entries = self.entries.read().expect("validation cache lock");
            match entries.get(key) {
                Some(entry) if entry.expires_at > now => return Some(entry.verdict.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.entries
            .write()
            .expect("validation cache lock")
            .remove(key);
        None
    }

    fn insert(&self, key: &str, verdict: Verdict) {
        let ttl = match verdict {
            Verdict::Valid(_) => self.positive_ttl,
            Verdict::Invalid => self.negative_ttl,
        };
        let now = Instant::now();
        let mut entries = self.entries.write().expect("validation cache lock");
        if entries.len() >= self.max_entries {
            entries.retain(|_, entry| entry.expires_at > now);
        }
        entries.insert(
            key.to_string(),
            CacheEntry {
                verdict,
                expires_at: now + ttl,
            },
        );
    }
}

/// Everything the middleware needs: extraction order, cache and authority.
pub struct AuthLayer {
    sources: Vec<TokenSource>,
    cache: ValidationCache,
    authority: Arc<dyn ValidationAuthority>,
}

impl AuthLayer {
    #[must_use]
    pub fn new(authority: Arc<dyn ValidationAuthority>) -> Self {
        Self {
            sources: vec![TokenSource::BearerHeader],
            cache: ValidationCache::new(DEFAULT_POSITIVE_TTL, DEFAULT_NEGATIVE_TTL),
            authority,
        }
    }

    #[must_use]
    pub fn with_sources(mut self, sources: Vec<TokenSource>) -> Self {
        self.sources = sources;
        self
    }

    #[must_use]
    pub fn with_cache_ttl(mut self, positive_ttl: Duration, negative_ttl: Duration) -> Self {
        self.cache = ValidationCache::new(positive_ttl, negative_ttl);
        self
    }

    /// Extract, consult the cache, fall back to the authority.
    ///
    /// # Errors
    /// Fails with `Unauthenticated` for a missing or invalid credential and
    /// propagates authority outages uncached (fail closed).
    pub async fn check(&self, headers: &HeaderMap, uri: &Uri) -> Result<AuthContext, AuthError> {
        let Some(raw) = extract_token(&self.sources, headers, uri) else {
            return Err(AuthError::Unauthenticated);
        };
        let key = token::hash_token(&raw);

        if let Some(verdict) = self.cache.get(&key) {
            return verdict_to_context(verdict);
        }

        let verdict = self.authority.validate(&raw).await?;
        self.cache.insert(&key, verdict.clone());
        verdict_to_context(verdict)
    }
}

fn verdict_to_context(verdict: Verdict) -> Result<AuthContext, AuthError> {
    match verdict {
        Verdict::Valid(context) => Ok(context),
        Verdict::Invalid => Err(AuthError::Unauthenticated),
    }
}

/// axum middleware: on success the [`AuthContext`] lands in the request
/// extensions for handlers to pick up.
pub async fn authenticate(
    State(layer): State<Arc<AuthLayer>>,
    mut request: Request,
    next: Next,
) -> Response {
    match layer.check(request.headers(), request.uri()).await {
        Ok(context) => {
            request.extensions_mut().insert(context);
            next.run(request).await
        }
        Err(err) => err.status_code().into_response(),
    }
}

/// Out-of-band permission oracle. Permission verdicts are never cached:
/// permissions can change independently of token validity.
pub trait PermissionAuthority: Send + Sync {
    fn has_permission<'a>(
        &'a self,
        user_id: Uuid,
        resource: &'a str,
        action: &'a str,
    ) -> BoxFuture<'a, Result<bool, AuthError>>;
}

/// # Errors
/// Fails with `Forbidden` when the permission is not granted.
pub async fn require_permission(
    authority: &dyn PermissionAuthority,
    context: &AuthContext,
    resource: &str,
    action: &str,
) -> Result<(), AuthError> {
    if authority
        .has_permission(context.user_id, resource, action)
        .await?
    {
        Ok(())
    } else {
        Err(AuthError::Forbidden)
    }
}

fn extract_token(sources: &[TokenSource], headers: &HeaderMap, uri: &Uri) -> Option<String> {
    for source in sources {
        let token = match source {
            TokenSource::BearerHeader => bearer_token(headers),
            TokenSource::Header(name) => headers
                .get(name.as_str())
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string),
            TokenSource::Cookie(name) => cookie_value(headers, name),
            TokenSource::Query(name) => query_value(uri, name),
        };
        if token.is_some() {
            return token;
        }
    }
    None
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get(AUTHORIZATION)?.to_str().ok()?;
    if header.len() > 7 && header[..7].eq_ignore_ascii_case("bearer ") {
        let token = header[7..].trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    None
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            if parts.next() == Some(name) {
                let value = parts.next().unwrap_or("").trim();
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

fn query_value(uri: &Uri, name: &str) -> Option<String> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}
