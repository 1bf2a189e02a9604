//! AES-256-GCM encryption for stored secrets (account tokens, API keys, keychain items).
//!
//! Key resolution: `OPTAD_ENCRYPTION_KEY` env (base64) → `<data_dir>/encryption.key` file → auto-generate.
//! Encrypted values carry an `enc:` prefix so reads can tell them apart from legacy plaintext.

use std::fs::{self, OpenOptions};
use std::io::Write as IoWrite;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;
use tracing::{info, warn};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

pub const ENC_PREFIX: &str = "enc:";
pub const KEY_ENV: &str = "OPTAD_ENCRYPTION_KEY";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("{KEY_ENV} must be base64 of {KEY_LEN} bytes")]
    InvalidEnvKey,
    #[error("encryption key file {0} has the wrong length")]
    InvalidKeyFile(String),
    #[error("failed to generate random bytes")]
    Random,
    #[error("failed to initialize AES-256-GCM key")]
    KeyInit,
    #[error("AES-256-GCM seal operation failed")]
    Seal,
    #[error("stored secret could not be decrypted (corrupt or encrypted with another key)")]
    Decrypt,
    #[error("key file I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Holds the daemon's secret key. Cheap to clone.
#[derive(Clone)]
pub struct SecretCipher {
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretCipher(..)")
    }
}

impl SecretCipher {
    pub fn from_key(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// Resolve the key from the environment, then the key file, generating the
    /// file (mode 0600) on first run.
    pub fn load_or_create(key_path: &Path) -> Result<Self, CryptoError> {
        if let Ok(env_val) = std::env::var(KEY_ENV) {
            let trimmed = env_val.trim();
            if !trimmed.is_empty() {
                let decoded = BASE64
                    .decode(trimmed)
                    .map_err(|_| CryptoError::InvalidEnvKey)?;
                let key: [u8; KEY_LEN] = decoded
                    .try_into()
                    .map_err(|_| CryptoError::InvalidEnvKey)?;
                return Ok(Self { key });
            }
        }

        match fs::read(key_path) {
            Ok(bytes) => {
                let key: [u8; KEY_LEN] = bytes
                    .try_into()
                    .map_err(|_| CryptoError::InvalidKeyFile(key_path.display().to_string()))?;
                Ok(Self { key })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::generate(key_path),
            Err(e) => Err(e.into()),
        }
    }

    fn generate(key_path: &Path) -> Result<Self, CryptoError> {
        let mut key = [0u8; KEY_LEN];
        SystemRandom::new()
            .fill(&mut key)
            .map_err(|_| CryptoError::Random)?;

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
        {
            Ok(mut file) => {
                file.write_all(&key)?;
                info!(
                    component = "crypto",
                    event = "crypto.key_generated",
                    path = %key_path.display(),
                    "Generated encryption key"
                );
                Ok(Self { key })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // Lost a race with another process; use its key.
                let bytes = fs::read(key_path)?;
                let key: [u8; KEY_LEN] = bytes
                    .try_into()
                    .map_err(|_| CryptoError::InvalidKeyFile(key_path.display().to_string()))?;
                Ok(Self { key })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Returns `enc:base64(nonce || ciphertext || tag)`.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.key).map_err(|_| CryptoError::KeyInit)?;
        let key = LessSafeKey::new(unbound);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| CryptoError::Random)?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.as_bytes().to_vec();
        key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::Seal)?;

        let mut result = Vec::with_capacity(NONCE_LEN + in_out.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&in_out);

        Ok(format!("{}{}", ENC_PREFIX, BASE64.encode(&result)))
    }

    /// Values without the `enc:` prefix pass through unchanged.
    pub fn decrypt(&self, value: &str) -> Result<String, CryptoError> {
        let Some(encoded) = value.strip_prefix(ENC_PREFIX) else {
            warn!(
                component = "crypto",
                event = "crypto.decrypt.plaintext",
                "Stored secret is not encrypted"
            );
            return Ok(value.to_string());
        };

        let unbound = UnboundKey::new(&AES_256_GCM, &self.key).map_err(|_| CryptoError::KeyInit)?;
        let key = LessSafeKey::new(unbound);

        let mut data = BASE64.decode(encoded).map_err(|_| CryptoError::Decrypt)?;
        if data.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(CryptoError::Decrypt);
        }

        let nonce_bytes: [u8; NONCE_LEN] = data[..NONCE_LEN]
            .try_into()
            .map_err(|_| CryptoError::Decrypt)?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let plaintext = key
            .open_in_place(nonce, Aad::empty(), &mut data[NONCE_LEN..])
            .map_err(|_| CryptoError::Decrypt)?;

        String::from_utf8(plaintext.to_vec()).map_err(|_| CryptoError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_cipher() -> SecretCipher {
        let mut key = [0u8; KEY_LEN];
        SystemRandom::new().fill(&mut key).unwrap();
        SecretCipher::from_key(key)
    }

    #[test]
    fn encrypts_with_prefix_and_decrypts() {
        let cipher = random_cipher();
        let encrypted = cipher.encrypt("sk-lmx-1234").unwrap();
        assert!(encrypted.starts_with(ENC_PREFIX));
        assert!(!encrypted.contains("sk-lmx"));
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), "sk-lmx-1234");
    }

    #[test]
    fn plaintext_passthrough() {
        let cipher = random_cipher();
        assert_eq!(cipher.decrypt("legacy-value").unwrap(), "legacy-value");
    }

    #[test]
    fn same_secret_encrypts_differently() {
        let cipher = random_cipher();
        let a = cipher.encrypt("same").unwrap();
        let b = cipher.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let cipher = random_cipher();
        let encrypted = cipher.encrypt("secret").unwrap();
        let mut data = BASE64
            .decode(encrypted.strip_prefix(ENC_PREFIX).unwrap())
            .unwrap();
        if let Some(byte) = data.last_mut() {
            *byte ^= 0xFF;
        }
        let tampered = format!("{}{}", ENC_PREFIX, BASE64.encode(&data));
        assert!(matches!(cipher.decrypt(&tampered), Err(CryptoError::Decrypt)));
    }

    #[test]
    fn wrong_key_fails() {
        let encrypted = random_cipher().encrypt("secret").unwrap();
        assert!(random_cipher().decrypt(&encrypted).is_err());
    }

    #[test]
    fn key_file_is_created_once_with_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        if std::env::var(KEY_ENV).is_ok() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("encryption.key");

        let first = SecretCipher::load_or_create(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let second = SecretCipher::load_or_create(&path).unwrap();
        let encrypted = first.encrypt("shared").unwrap();
        assert_eq!(second.decrypt(&encrypted).unwrap(), "shared");
    }
}
