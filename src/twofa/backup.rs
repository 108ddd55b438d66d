//! Backup code generation for second-factor recovery.
//!
//! Ten codes per batch, each a fixed-length URL-safe alphanumeric string.
//! Codes are hashed like passwords before storage and the plaintext is shown
//! exactly once; losing them means regenerating the whole batch.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::auth::hash_password;
use crate::error::AuthError;

pub(crate) const BACKUP_CODE_COUNT: usize = 10;
pub(crate) const BACKUP_CODE_LENGTH: usize = 8;

/// A freshly generated batch: plaintext codes for the user, hashes for the
/// store.
#[derive(Debug)]
pub struct BackupCodeBatch {
    pub codes: Vec<String>,
    pub code_hashes: Vec<String>,
}

impl BackupCodeBatch {
    /// # Errors
    /// Returns an error if randomness or hashing fails.
    pub fn generate() -> Result<Self, AuthError> {
        let mut rng = OsRng;
        let mut codes = Vec::with_capacity(BACKUP_CODE_COUNT);
        let mut code_hashes = Vec::with_capacity(BACKUP_CODE_COUNT);
        for _ in 0..BACKUP_CODE_COUNT {
            let code = generate_code(&mut rng);
            code_hashes.push(hash_password(&code)?);
            codes.push(code);
        }
        Ok(Self { codes, code_hashes })
    }
}

fn generate_code<R: RngCore + ?Sized>(rng: &mut R) -> String {
    let mut raw = [0u8; BACKUP_CODE_LENGTH];
    rng.fill_bytes(&mut raw);
    let mut encoded = URL_SAFE_NO_PAD.encode(raw);
    encoded.truncate(BACKUP_CODE_LENGTH);
    encoded
}
