//! Encryption at rest for provider secrets and provider-side tokens.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use secrecy::{ExposeSecret, Secret};
use service_core::error::AppError;
use std::path::Path;

use crate::config::KeyProviderConfig;

const KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;
const PREFIX: &str = "aesgcm:";

/// Seals and opens short secrets with AES-256-GCM under the root key.
#[derive(Clone)]
pub struct Sealer {
    cipher: Aes256Gcm,
}

impl Sealer {
    pub fn from_key(key: &Secret<Vec<u8>>) -> Result<Self, AppError> {
        let cipher = Aes256Gcm::new_from_slice(key.expose_secret()).map_err(|_| {
            AppError::ConfigError(anyhow::anyhow!(
                "root key must be {} bytes, got {}",
                KEY_LENGTH,
                key.expose_secret().len()
            ))
        })?;
        Ok(Self { cipher })
    }

    /// A sealer over a fresh random key. Data sealed with it does not survive
    /// a restart.
    pub fn ephemeral() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    pub fn load(provider: &KeyProviderConfig, is_prod: bool) -> Result<Self, AppError> {
        let key = match provider {
            KeyProviderConfig::Env { variable } => match std::env::var(variable) {
                Ok(encoded) => decode_key(&encoded)?,
                Err(_) if is_prod => {
                    return Err(AppError::ConfigError(anyhow::anyhow!(
                        "{} must hold the root key in production",
                        variable
                    )))
                }
                Err(_) => {
                    tracing::warn!(variable = %variable, "Root key not set, using an ephemeral key");
                    return Ok(Self::ephemeral());
                }
            },
            KeyProviderConfig::File { path } => load_or_create_key_file(Path::new(path))?,
        };
        Self::from_key(&key)
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, AppError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| AppError::InternalError(anyhow::anyhow!("failed to seal secret")))?;

        let mut out = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(format!("{}{}", PREFIX, STANDARD.encode(out)))
    }

    pub fn open(&self, sealed: &str) -> Result<String, AppError> {
        if sealed.is_empty() {
            return Ok(String::new());
        }
        let encoded = sealed
            .strip_prefix(PREFIX)
            .ok_or_else(|| AppError::InternalError(anyhow::anyhow!("unknown ciphertext format")))?;
        let raw = STANDARD
            .decode(encoded)
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("invalid ciphertext: {}", e)))?;
        if raw.len() <= NONCE_LENGTH {
            return Err(AppError::InternalError(anyhow::anyhow!("ciphertext too short")));
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LENGTH);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| AppError::InternalError(anyhow::anyhow!("failed to open secret")))?;
        String::from_utf8(plaintext)
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("sealed secret is not utf-8: {}", e)))
    }
}

fn decode_key(encoded: &str) -> Result<Secret<Vec<u8>>, AppError> {
    let key = STANDARD
        .decode(encoded.trim())
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!("root key is not base64: {}", e)))?;
    Ok(Secret::new(key))
}

fn load_or_create_key_file(path: &Path) -> Result<Secret<Vec<u8>>, AppError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => decode_key(&contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut key = vec![0u8; KEY_LENGTH];
            rand::rngs::OsRng.fill_bytes(&mut key);
            std::fs::write(path, STANDARD.encode(&key))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
            }
            tracing::info!(path = %path.display(), "Created root key");
            Ok(Secret::new(key))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_open() {
        let sealer = Sealer::ephemeral();
        let sealed = sealer.seal("client-secret").unwrap();
        assert!(sealed.starts_with(PREFIX));
        assert!(!sealed.contains("client-secret"));
        assert_eq!(sealer.open(&sealed).unwrap(), "client-secret");
    }

    #[test]
    fn empty_values_stay_empty() {
        let sealer = Sealer::ephemeral();
        assert_eq!(sealer.seal("").unwrap(), "");
        assert_eq!(sealer.open("").unwrap(), "");
    }

    #[test]
    fn other_keys_cannot_open() {
        let sealed = Sealer::ephemeral().seal("secret").unwrap();
        assert!(Sealer::ephemeral().open(&sealed).is_err());
    }

    #[test]
    fn file_provider_creates_and_reuses_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("root.key");
        let provider = KeyProviderConfig::File {
            path: path.to_string_lossy().to_string(),
        };

        let first = Sealer::load(&provider, false).unwrap();
        assert!(path.exists());
        let sealed = first.seal("token").unwrap();

        let second = Sealer::load(&provider, false).unwrap();
        assert_eq!(second.open(&sealed).unwrap(), "token");
    }

    #[test]
    fn wrong_key_length_is_a_config_error() {
        let err = Sealer::from_key(&Secret::new(vec![0u8; 16])).err().unwrap();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn missing_env_key_fails_in_production() {
        let provider = KeyProviderConfig::Env {
            variable: "CONTROL_PLANE_SURELY_UNSET_KEY".to_string(),
        };
        assert!(Sealer::load(&provider, true).is_err());
        assert!(Sealer::load(&provider, false).is_ok());
    }
}
