use std::sync::Arc;

use anyhow::{Context, Result};
use secrecy::SecretString;

use crate::api;
use crate::auth::AuthService;
use crate::federation::{FederationService, ProviderRegistry};
use crate::middleware::{AuthLayer, LocalAuthority, TokenSource};
use crate::otp::{OtpConfig, OtpService};
use crate::store::memory::{
    LogMessageSender, MemoryBackupCodeStore, MemoryOAuthAccountStore, MemoryOtpStore,
    MemoryRateLimitStore, MemoryRefreshTokenStore, MemoryUserStore,
};
use crate::store::UserStore;
use crate::token::{SigningKey, TokenService};
use crate::twofa::TwoFactorService;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub token_secret: SecretString,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
    pub issuer: String,
    pub otp_secret: SecretString,
}

/// Handle the server action: wire the broker services over the in-process
/// stores and start serving. Swapping the stores for database-backed
/// implementations happens behind the same traits.
///
/// # Errors
/// Returns an error if the signing key is misconfigured — fatal here, before
/// any request is served — or if the server fails to start.
pub async fn handle(args: Args) -> Result<()> {
    let key = SigningKey::hs256(args.token_secret).context("invalid token signing secret")?;

    let users: Arc<dyn UserStore> = Arc::new(MemoryUserStore::new());
    let tokens = Arc::new(
        TokenService::new(key, Arc::new(MemoryRefreshTokenStore::new()))
            .with_access_ttl_seconds(args.access_ttl_seconds)
            .with_refresh_ttl_seconds(args.refresh_ttl_seconds),
    );

    let twofa = Arc::new(TwoFactorService::new(
        users.clone(),
        Arc::new(MemoryBackupCodeStore::new()),
        args.issuer,
    ));
    let otp = Arc::new(OtpService::new(
        Arc::new(MemoryOtpStore::new()),
        users.clone(),
        Arc::new(MemoryRateLimitStore::new()),
        Arc::new(LogMessageSender),
        args.otp_secret,
        OtpConfig::default(),
    ));
    let auth = Arc::new(AuthService::new(
        users.clone(),
        tokens.clone(),
        twofa.clone(),
        otp.clone(),
    ));
    let federation = Arc::new(
        FederationService::new(
            ProviderRegistry::from_env(),
            users.clone(),
            Arc::new(MemoryOAuthAccountStore::new()),
            tokens.clone(),
        )
        .context("failed to initialize federation broker")?,
    );

    let layer = Arc::new(
        AuthLayer::new(Arc::new(LocalAuthority::new(tokens))).with_sources(vec![
            TokenSource::BearerHeader,
            TokenSource::Query("access_token".to_string()),
        ]),
    );

    let state = api::AppState {
        layer,
        auth,
        federation,
        otp,
        twofa,
    };
    api::new(args.port, &state).await
}
