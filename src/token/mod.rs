//! Signed credential minting, verification, rotation and revocation.
//!
//! Tokens are compact JWTs assembled by hand over base64url segments so the
//! signature algorithm stays injectable: HMAC-SHA256 for single-service
//! deployments, RSASSA-PKCS1-v1.5/SHA-256 when remote validators only hold
//! the public key. Refresh tokens are additionally tracked server-side by a
//! SHA-256 digest of the raw value; the raw value is never stored.

use std::fmt::Write as _;
use std::sync::Arc;

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::Utc;
use hmac::{Hmac, Mac};
use rsa::errors::Error as RsaError;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::{Signature, SigningKey as RsaSigningKey, VerifyingKey};
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::RsaPrivateKey;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{TokenPair, User};
use crate::store::{RefreshTokenRecord, RefreshTokenStore};

const DEFAULT_ACCESS_TTL_SECONDS: i64 = 15 * 60;
const DEFAULT_REFRESH_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;
const DEFAULT_TWO_FACTOR_TTL_SECONDS: i64 = 5 * 60;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),
    #[error("failed to parse signing key")]
    KeyParse,
    #[error("rsa error")]
    Rsa(#[from] RsaError),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("wrong token kind")]
    WrongKind,
    #[error("token revoked")]
    Revoked,
    #[error("refresh token store error")]
    Store(#[source] anyhow::Error),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
    /// Short-lived pending credential minted after a password check when the
    /// account still owes a second factor.
    TwoFactor,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenHeader {
    pub alg: String,
    pub typ: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub kind: TokenKind,
    pub sub: String,
    pub user_id: Uuid,
    pub email: String,
    pub username: String,
    pub roles: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_id: Option<Uuid>,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

/// Injectable signing key. Parsing happens once at construction so a
/// misconfigured key fails at startup, not on the first request.
pub enum SigningKey {
    Hs256 { secret: SecretString },
    Rs256 { key: Box<RsaPrivateKey>, kid: String },
}

impl SigningKey {
    /// # Errors
    /// Returns an error for an empty secret.
    pub fn hs256(secret: SecretString) -> Result<Self, Error> {
        if secret.expose_secret().is_empty() {
            return Err(Error::KeyParse);
        }
        Ok(Self::Hs256 { secret })
    }

    /// Accepts PKCS#8 or PKCS#1, PEM or DER.
    ///
    /// # Errors
    /// Returns an error if the private key cannot be parsed.
    pub fn rs256(pem_or_der: &[u8], kid: impl Into<String>) -> Result<Self, Error> {
        let key = decode_private_key(pem_or_der)?;
        Ok(Self::Rs256 {
            key: Box::new(key),
            kid: kid.into(),
        })
    }

    fn alg(&self) -> &'static str {
        match self {
            Self::Hs256 { .. } => "HS256",
            Self::Rs256 { .. } => "RS256",
        }
    }

    fn kid(&self) -> Option<String> {
        match self {
            Self::Hs256 { .. } => None,
            Self::Rs256 { kid, .. } => Some(kid.clone()),
        }
    }

    fn sign(&self, signing_input: &str) -> Result<Vec<u8>, Error> {
        match self {
            Self::Hs256 { secret } => {
                let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
                    .map_err(|_| Error::KeyParse)?;
                mac.update(signing_input.as_bytes());
                Ok(mac.finalize().into_bytes().to_vec())
            }
            Self::Rs256 { key, .. } => {
                let signing_key = RsaSigningKey::<Sha256>::new(key.as_ref().clone());
                let signature: Signature = signing_key.sign(signing_input.as_bytes());
                Ok(signature.to_vec())
            }
        }
    }

    fn verify(&self, signing_input: &str, signature: &[u8]) -> Result<(), Error> {
        match self {
            Self::Hs256 { secret } => {
                let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
                    .map_err(|_| Error::KeyParse)?;
                mac.update(signing_input.as_bytes());
                mac.verify_slice(signature)
                    .map_err(|_| Error::InvalidSignature)
            }
            Self::Rs256 { key, .. } => {
                let verifying_key = VerifyingKey::<Sha256>::new(key.to_public_key());
                let signature =
                    Signature::try_from(signature).map_err(|_| Error::InvalidSignature)?;
                verifying_key
                    .verify(signing_input.as_bytes(), &signature)
                    .map_err(|_| Error::InvalidSignature)
            }
        }
    }
}

fn decode_private_key(pem_or_der: &[u8]) -> Result<RsaPrivateKey, Error> {
    if pem_or_der.starts_with(b"-----BEGIN") {
        let s = std::str::from_utf8(pem_or_der).map_err(|_| Error::KeyParse)?;
        if let Ok(k) = RsaPrivateKey::from_pkcs8_pem(s) {
            return Ok(k);
        }
        if let Ok(k) = RsaPrivateKey::from_pkcs1_pem(s) {
            return Ok(k);
        }
        return Err(Error::KeyParse);
    }

    if let Ok(k) = RsaPrivateKey::from_pkcs8_der(pem_or_der) {
        return Ok(k);
    }
    if let Ok(k) = RsaPrivateKey::from_pkcs1_der(pem_or_der) {
        return Ok(k);
    }
    Err(Error::KeyParse)
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, Error> {
    let json = serde_json::to_vec(value)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T, Error> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| Error::Base64)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// SHA-256 hex digest of a raw token; the storage key for refresh records.
#[must_use]
pub fn hash_token(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    digest.iter().fold(String::with_capacity(64), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Mints and verifies signed credentials and owns refresh-token rotation.
pub struct TokenService {
    key: SigningKey,
    access_ttl_seconds: i64,
    refresh_ttl_seconds: i64,
    two_factor_ttl_seconds: i64,
    refresh_store: Arc<dyn RefreshTokenStore>,
}

impl TokenService {
    #[must_use]
    pub fn new(key: SigningKey, refresh_store: Arc<dyn RefreshTokenStore>) -> Self {
        Self {
            key,
            access_ttl_seconds: DEFAULT_ACCESS_TTL_SECONDS,
            refresh_ttl_seconds: DEFAULT_REFRESH_TTL_SECONDS,
            two_factor_ttl_seconds: DEFAULT_TWO_FACTOR_TTL_SECONDS,
            refresh_store,
        }
    }

    #[must_use]
    pub fn with_access_ttl_seconds(mut self, seconds: i64) -> Self {
        self.access_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_refresh_ttl_seconds(mut self, seconds: i64) -> Self {
        self.refresh_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn access_ttl_seconds(&self) -> i64 {
        self.access_ttl_seconds
    }

    fn make_claims(&self, user: &User, kind: TokenKind, ttl_seconds: i64, now: i64) -> Claims {
        Claims {
            kind,
            sub: user.id.to_string(),
            user_id: user.id,
            email: user.email.clone(),
            username: user.username.clone(),
            roles: user.roles.clone(),
            application_id: None,
            jti: Uuid::new_v4().to_string(),
            iat: now,
            exp: now + ttl_seconds,
        }
    }

    fn sign_claims(&self, claims: &Claims) -> Result<String, Error> {
        let header = TokenHeader {
            alg: self.key.alg().to_string(),
            typ: "JWT".to_string(),
            kid: self.key.kid(),
        };
        let header_b64 = b64e_json(&header)?;
        let claims_b64 = b64e_json(claims)?;
        let signing_input = format!("{header_b64}.{claims_b64}");
        let signature = self.key.sign(&signing_input)?;
        let signature_b64 = Base64UrlUnpadded::encode_string(&signature);
        Ok(format!("{signing_input}.{signature_b64}"))
    }

    /// # Errors
    /// Returns an error if signing fails.
    pub fn issue_access_token(&self, user: &User) -> Result<String, Error> {
        let now = Utc::now().timestamp();
        self.sign_claims(&self.make_claims(user, TokenKind::Access, self.access_ttl_seconds, now))
    }

    /// # Errors
    /// Returns an error if signing fails.
    pub fn issue_two_factor_token(&self, user: &User) -> Result<String, Error> {
        let now = Utc::now().timestamp();
        self.sign_claims(&self.make_claims(
            user,
            TokenKind::TwoFactor,
            self.two_factor_ttl_seconds,
            now,
        ))
    }

    /// Mints a refresh token and persists its digest for later revocation.
    ///
    /// # Errors
    /// Returns an error if signing or the refresh-token store fails.
    pub fn issue_refresh_token(&self, user: &User) -> Result<String, Error> {
        let now = Utc::now().timestamp();
        let claims = self.make_claims(user, TokenKind::Refresh, self.refresh_ttl_seconds, now);
        let raw = self.sign_claims(&claims)?;
        let record = RefreshTokenRecord {
            id: Uuid::new_v4(),
            user_id: user.id,
            token_hash: hash_token(&raw),
            expires_at: Utc::now() + chrono::Duration::seconds(self.refresh_ttl_seconds),
            revoked: false,
        };
        self.refresh_store
            .create(&record)
            .map_err(|err| Error::Store(err.into()))?;
        Ok(raw)
    }

    /// # Errors
    /// Returns an error if signing or the refresh-token store fails.
    pub fn issue_pair(&self, user: &User) -> Result<TokenPair, Error> {
        Ok(TokenPair {
            access_token: self.issue_access_token(user)?,
            refresh_token: self.issue_refresh_token(user)?,
            expires_in: self.access_ttl_seconds,
        })
    }

    /// # Errors
    /// Fails with `TokenFormat`/`Base64`/`Json` on structural problems,
    /// `InvalidSignature`, `Expired`, or `WrongKind`.
    pub fn verify_access(&self, token: &str) -> Result<Claims, Error> {
        self.verify_at(token, TokenKind::Access, Utc::now().timestamp())
    }

    /// # Errors
    /// Same failure modes as [`Self::verify_access`].
    pub fn verify_two_factor(&self, token: &str) -> Result<Claims, Error> {
        self.verify_at(token, TokenKind::TwoFactor, Utc::now().timestamp())
    }

    /// Structural verification plus the server-side rotation record check.
    ///
    /// A record that is missing or past its stored expiry fails with
    /// `Revoked`. A record already marked revoked is treated as replay of a
    /// rotated-out token: every live refresh token for that user is revoked
    /// before the error is returned.
    ///
    /// # Errors
    /// Same failure modes as [`Self::verify_access`], plus `Revoked`.
    pub fn verify_refresh(&self, raw: &str) -> Result<Claims, Error> {
        let claims = self.verify_at(raw, TokenKind::Refresh, Utc::now().timestamp())?;
        let record = self
            .refresh_store
            .lookup(&hash_token(raw))
            .map_err(|err| Error::Store(err.into()))?
            .ok_or(Error::Revoked)?;
        if record.revoked {
            self.refresh_store
                .revoke_all_for_user(record.user_id)
                .map_err(|err| Error::Store(err.into()))?;
            return Err(Error::Revoked);
        }
        if record.expires_at <= Utc::now() {
            return Err(Error::Revoked);
        }
        Ok(claims)
    }

    /// Marks the stored record revoked; no later `verify_refresh` on the same
    /// raw value succeeds.
    ///
    /// # Errors
    /// Returns an error if the refresh-token store fails.
    pub fn revoke(&self, raw: &str) -> Result<(), Error> {
        self.refresh_store
            .revoke(&hash_token(raw))
            .map_err(|err| Error::Store(err.into()))
    }

    /// # Errors
    /// Returns an error if the refresh-token store fails.
    pub fn revoke_all_for_user(&self, user_id: Uuid) -> Result<(), Error> {
        self.refresh_store
            .revoke_all_for_user(user_id)
            .map_err(|err| Error::Store(err.into()))
    }

    fn verify_at(
        &self,
        token: &str,
        expected_kind: TokenKind,
        now_unix_seconds: i64,
    ) -> Result<Claims, Error> {
        let mut parts = token.split('.');
        let header_b64 = parts.next().ok_or(Error::TokenFormat)?;
        let claims_b64 = parts.next().ok_or(Error::TokenFormat)?;
        let sig_b64 = parts.next().ok_or(Error::TokenFormat)?;
        if parts.next().is_some() {
            return Err(Error::TokenFormat);
        }

        let header: TokenHeader = b64d_json(header_b64)?;
        if header.alg != self.key.alg() {
            return Err(Error::UnsupportedAlg(header.alg));
        }

        let signing_input = format!("{header_b64}.{claims_b64}");
        let signature_bytes = Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| Error::Base64)?;
        self.key.verify(&signing_input, &signature_bytes)?;

        let claims: Claims = b64d_json(claims_b64)?;
        if claims.exp <= now_unix_seconds {
            return Err(Error::Expired);
        }
        if claims.kind != expected_kind {
            return Err(Error::WrongKind);
        }
        Ok(claims)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryRefreshTokenStore;

    fn service() -> TokenService {
        let key = SigningKey::hs256(SecretString::from("test-signing-secret")).unwrap();
        TokenService::new(key, Arc::new(MemoryRefreshTokenStore::new()))
    }

    fn test_user() -> User {
        let mut user = User::new("a@example.com".to_string(), "alice".to_string());
        user.roles.push("admin".to_string());
        user
    }

    #[test]
    fn hs256_access_round_trip() {
        let service = service();
        let user = test_user();
        let token = service.issue_access_token(&user).unwrap();

        let claims = service.verify_access(&token).unwrap();
        assert_eq!(claims.user_id, user.id);
        assert_eq!(claims.email, "a@example.com");
        assert_eq!(claims.roles, user.roles);
        assert_eq!(claims.kind, TokenKind::Access);
    }

    #[test]
    fn refresh_token_is_not_an_access_token() {
        let service = service();
        let token = service.issue_refresh_token(&test_user()).unwrap();
        assert!(matches!(
            service.verify_access(&token),
            Err(Error::WrongKind)
        ));
    }

    #[test]
    fn tampered_payload_fails_signature() {
        let service = service();
        let token = service.issue_access_token(&test_user()).unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = b64e_json(&serde_json::json!({"kind": "access"})).unwrap();
        parts[1] = &forged;
        let tampered = parts.join(".");
        assert!(matches!(
            service.verify_access(&tampered),
            Err(Error::InvalidSignature)
        ));
    }

    #[test]
    fn expired_token_rejected() {
        let key = SigningKey::hs256(SecretString::from("test-signing-secret")).unwrap();
        let service = TokenService::new(key, Arc::new(MemoryRefreshTokenStore::new()))
            .with_access_ttl_seconds(-30);
        let token = service.issue_access_token(&test_user()).unwrap();
        assert!(matches!(service.verify_access(&token), Err(Error::Expired)));
    }

    #[test]
    fn malformed_tokens_rejected() {
        let service = service();
        assert!(matches!(
            service.verify_access("definitely-not-a-jwt"),
            Err(Error::TokenFormat)
        ));
        assert!(matches!(
            service.verify_access("a.b.c.d"),
            Err(Error::TokenFormat)
        ));
        assert!(matches!(
            service.verify_access("!!.!!.!!"),
            Err(Error::Base64)
        ));
    }

    #[test]
    fn refresh_verify_then_revoke() {
        let service = service();
        let raw = service.issue_refresh_token(&test_user()).unwrap();

        assert!(service.verify_refresh(&raw).is_ok());
        service.revoke(&raw).unwrap();
        assert!(matches!(service.verify_refresh(&raw), Err(Error::Revoked)));
    }

    #[test]
    fn revoked_reuse_revokes_the_family() {
        let service = service();
        let user = test_user();
        let first = service.issue_refresh_token(&user).unwrap();
        let second = service.issue_refresh_token(&user).unwrap();

        // Rotation revoked `first`; presenting it again is treated as theft.
        service.revoke(&first).unwrap();
        assert!(matches!(
            service.verify_refresh(&first),
            Err(Error::Revoked)
        ));
        assert!(matches!(
            service.verify_refresh(&second),
            Err(Error::Revoked)
        ));
    }

    #[test]
    fn empty_hs256_secret_rejected_at_construction() {
        assert!(SigningKey::hs256(SecretString::from("")).is_err());
    }

    #[test]
    fn rs256_sign_and_verify() {
        let mut rng = rand::rngs::OsRng;
        let private = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let key = SigningKey::Rs256 {
            key: Box::new(private),
            kid: "k1".to_string(),
        };
        let service = TokenService::new(key, Arc::new(MemoryRefreshTokenStore::new()));
        let token = service.issue_access_token(&test_user()).unwrap();

        let claims = service.verify_access(&token).unwrap();
        assert_eq!(claims.username, "alice");

        let mut corrupted = token.clone();
        corrupted.pop();
        assert!(service.verify_access(&corrupted).is_err());
    }

    #[test]
    fn hash_token_is_stable_hex() {
        let first = hash_token("raw-token");
        let second = hash_token("raw-token");
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(first, hash_token("other-token"));
    }
}
