//! End-to-end credential lifecycle over the in-process stores: password
//! sign-up, second-factor enrollment, token rotation, out-of-band login and
//! the validation middleware in front of real routes.

use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::header::AUTHORIZATION;
use axum::http::{Request, StatusCode};
use secrecy::SecretString;
use totp_rs::{Algorithm, Secret, TOTP};
use tower::ServiceExt;

use peranto::api::{self, AppState};
use peranto::auth::{AuthService, SigninOutcome};
use peranto::error::AuthError;
use peranto::federation::{FederationService, ProviderRegistry};
use peranto::middleware::{AuthLayer, LocalAuthority};
use peranto::models::User;
use peranto::otp::{Destination, OtpConfig, OtpPurpose, OtpService};
use peranto::store::memory::{
    MemoryBackupCodeStore, MemoryOAuthAccountStore, MemoryOtpStore, MemoryRateLimitStore,
    MemoryRefreshTokenStore, MemoryUserStore,
};
use peranto::store::{MessageSender, UserStore};
use peranto::token::{SigningKey, TokenService};
use peranto::twofa::TwoFactorService;

/// Captures outbound messages so tests can read delivered codes.
#[derive(Default)]
struct RecordingSender {
    sent: Mutex<Vec<String>>,
}

impl MessageSender for RecordingSender {
    fn send(&self, _destination: &str, body: &str) -> anyhow::Result<String> {
        self.sent.lock().expect("sender lock").push(body.to_string());
        Ok("msg-1".to_string())
    }
}

impl RecordingSender {
    fn last_code(&self) -> String {
        let sent = self.sent.lock().expect("sender lock");
        sent.last()
            .expect("a dispatched message")
            .chars()
            .filter(char::is_ascii_digit)
            .take(6)
            .collect()
    }
}

struct Broker {
    users: Arc<MemoryUserStore>,
    tokens: Arc<TokenService>,
    twofa: Arc<TwoFactorService>,
    otp: Arc<OtpService>,
    auth: Arc<AuthService>,
    sender: Arc<RecordingSender>,
}

fn broker() -> Broker {
    let users: Arc<MemoryUserStore> = Arc::new(MemoryUserStore::new());
    let sender = Arc::new(RecordingSender::default());
    let tokens = Arc::new(TokenService::new(
        SigningKey::hs256(SecretString::from("integration-signing-secret"))
            .expect("non-empty secret"),
        Arc::new(MemoryRefreshTokenStore::new()),
    ));
    let twofa = Arc::new(TwoFactorService::new(
        users.clone(),
        Arc::new(MemoryBackupCodeStore::new()),
        "Peranto".to_string(),
    ));
    let otp = Arc::new(OtpService::new(
        Arc::new(MemoryOtpStore::new()),
        users.clone(),
        Arc::new(MemoryRateLimitStore::new()),
        sender.clone(),
        SecretString::from("integration-otp-pepper"),
        OtpConfig::default(),
    ));
    let auth = Arc::new(AuthService::new(
        users.clone(),
        tokens.clone(),
        twofa.clone(),
        otp.clone(),
    ));
    Broker {
        users,
        tokens,
        twofa,
        otp,
        auth,
        sender,
    }
}

fn current_totp_code(secret_base32: &str) -> String {
    let totp = TOTP::new(
        Algorithm::SHA1,
        6,
        1,
        30,
        Secret::Encoded(secret_base32.to_string())
            .to_bytes()
            .expect("valid base32 secret"),
        Some("Peranto".to_string()),
        "a@example.com".to_string(),
    )
    .expect("valid totp parameters");
    totp.generate_current().expect("system time")
}

#[test]
fn password_signup_through_two_factor_login() {
    let broker = broker();

    // Sign up and sign in with the password alone.
    let user = broker
        .auth
        .signup("a@example.com", "alice", "Secret123")
        .expect("signup");
    let SigninOutcome::Complete { pair, .. } = broker
        .auth
        .signin("a@example.com", "Secret123")
        .expect("signin")
    else {
        panic!("2FA must not be required before enrollment");
    };

    // Enroll the second factor; the pending secret has no effect until the
    // first code is confirmed.
    let setup = broker
        .twofa
        .setup_totp(user.id, "Secret123")
        .expect("totp setup");
    assert_eq!(setup.backup_codes.len(), 10);
    let refreshed = broker.users.get_by_id(user.id).expect("store").expect("user");
    assert!(!refreshed.totp_enabled);

    broker
        .twofa
        .confirm_totp_setup(user.id, &current_totp_code(&setup.secret))
        .expect("confirm enrollment");
    let refreshed = broker.users.get_by_id(user.id).expect("store").expect("user");
    assert!(refreshed.totp_enabled);

    // A fresh sign-in now stops at the pending step.
    let SigninOutcome::TwoFactorRequired { two_factor_token } = broker
        .auth
        .signin("a@example.com", "Secret123")
        .expect("signin")
    else {
        panic!("2FA must be required after enrollment");
    };

    // A wrong code does not mint tokens.
    let err = broker
        .auth
        .complete_two_factor_signin(&two_factor_token, "000000")
        .expect_err("wrong code");
    assert_eq!(err.to_string(), "invalid or expired code");

    // A current TOTP code completes the login; a backup code works too.
    let (pair_after_totp, _) = broker
        .auth
        .complete_two_factor_signin(&two_factor_token, &current_totp_code(&setup.secret))
        .expect("totp login");
    assert!(broker
        .tokens
        .verify_access(&pair_after_totp.access_token)
        .is_ok());

    let (pair_after_backup, _) = broker
        .auth
        .complete_two_factor_signin(&two_factor_token, &setup.backup_codes[0])
        .expect("backup login");
    assert!(broker
        .tokens
        .verify_access(&pair_after_backup.access_token)
        .is_ok());

    // That backup code is now spent.
    let err = broker
        .auth
        .complete_two_factor_signin(&two_factor_token, &setup.backup_codes[0])
        .expect_err("spent backup code");
    assert_eq!(err.to_string(), "invalid or expired code");

    // The original pre-enrollment pair still refreshes fine.
    broker.auth.refresh(&pair.refresh_token).expect("refresh");
}

#[test]
fn refresh_rotation_detects_reuse() {
    let broker = broker();
    broker
        .auth
        .signup("a@example.com", "alice", "Secret123")
        .expect("signup");
    let SigninOutcome::Complete { pair, .. } = broker
        .auth
        .signin("a@example.com", "Secret123")
        .expect("signin")
    else {
        panic!("unexpected 2FA challenge");
    };

    let (rotated, _) = broker.auth.refresh(&pair.refresh_token).expect("rotate");

    // Replaying the rotated-out token is treated as theft: the whole family
    // dies, including the fresh pair.
    let err = broker
        .auth
        .refresh(&pair.refresh_token)
        .expect_err("reuse must fail");
    assert!(matches!(err, AuthError::Token(_)));
    assert!(broker.auth.refresh(&rotated.refresh_token).is_err());
}

#[test]
fn otp_passwordless_login() {
    let broker = broker();
    let mut user = User::new("p@example.com".to_string(), "phoebe".to_string());
    user.phone = Some("+12345678901".to_string());
    broker.users.create(&user).expect("create user");

    let destination = Destination::phone("+1 (234) 567-8901").expect("valid phone");
    broker
        .otp
        .send_code(&destination, OtpPurpose::Login)
        .expect("send code");
    let code = broker.sender.last_code();

    let (pair, signed_in) = broker
        .auth
        .signin_with_otp(&destination, &code)
        .expect("otp login");
    assert_eq!(signed_in.id, user.id);
    assert!(broker.tokens.verify_access(&pair.access_token).is_ok());

    // The code was consumed by the login.
    assert!(broker.auth.signin_with_otp(&destination, &code).is_err());
}

#[tokio::test]
async fn middleware_guards_routes_end_to_end() {
    let broker = broker();
    let user = broker
        .auth
        .signup("a@example.com", "alice", "Secret123")
        .expect("signup");
    let access = broker
        .tokens
        .issue_access_token(&user)
        .expect("access token");

    let layer = Arc::new(AuthLayer::new(Arc::new(LocalAuthority::new(
        broker.tokens.clone(),
    ))));
    let federation = Arc::new(
        FederationService::new(
            ProviderRegistry::new(),
            broker.users.clone() as Arc<dyn UserStore>,
            Arc::new(MemoryOAuthAccountStore::new()),
            broker.tokens.clone(),
        )
        .expect("federation service"),
    );
    let state = AppState {
        layer,
        auth: broker.auth.clone(),
        federation,
        otp: broker.otp.clone(),
        twofa: broker.twofa.clone(),
    };
    let app = api::router(&state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/me")
                .header(AUTHORIZATION, format!("Bearer {access}"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/me")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/me")
                .header(AUTHORIZATION, "Bearer not-a-real-token")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
