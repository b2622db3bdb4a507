//! Field-level encryption for token cache columns.
//!
//! Uses Argon2id for key derivation and ChaCha20-Poly1305 for AEAD. Every
//! encrypted value is a self-describing JSON envelope, so a column can be
//! decrypted without any side metadata.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::Path;

const VERSION: u8 = 1;
const KDF: &str = "argon2id";
/// Environment variable that overrides the key file
pub const ENV_KEY: &str = "AZURE_BROKER_AUTH_KEY";

#[derive(Debug, Serialize, Deserialize)]
struct EncryptedPayload {
    version: u8,
    kdf: String,
    salt: String,
    nonce: String,
    ciphertext: String,
}

/// Reversible transform applied to sensitive string fields before they hit disk
#[derive(Clone)]
pub struct FieldCipher {
    key_material: String,
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher").finish_non_exhaustive()
    }
}

impl FieldCipher {
    pub fn new(key_material: impl Into<String>) -> Self {
        Self {
            key_material: key_material.into(),
        }
    }

    /// Resolve key material from `AZURE_BROKER_AUTH_KEY`, else from `key_path`,
    /// generating and persisting a random key on first use.
    pub fn load_or_create(key_path: &Path) -> Result<Self> {
        if let Ok(key) = std::env::var(ENV_KEY) {
            if !key.trim().is_empty() {
                return Ok(Self::new(key));
            }
        }

        if key_path.exists() {
            let key = std::fs::read_to_string(key_path)
                .with_context(|| format!("Failed to read {}", key_path.display()))?;
            let key = key.trim();
            if key.is_empty() {
                anyhow::bail!("Encryption key file {} is empty", key_path.display());
            }
            return Ok(Self::new(key));
        }

        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let key = STANDARD_NO_PAD.encode(bytes);

        if let Some(parent) = key_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        std::fs::write(key_path, &key)
            .with_context(|| format!("Failed to write {}", key_path.display()))?;

        // Owner read/write only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(key_path, perms)
                .context("Failed to set encryption key permissions")?;
        }

        tracing::info!("Generated new encryption key at {}", key_path.display());
        Ok(Self::new(key))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        encrypt_string(plaintext, &self.key_material)
    }

    pub fn decrypt(&self, payload: &str) -> Result<String> {
        decrypt_string(payload, &self.key_material)
    }
}

pub fn encrypt_string(plaintext: &str, passphrase: &str) -> Result<String> {
    let mut salt = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    let key = derive_key(passphrase, &salt)?;

    let mut nonce_bytes = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
        .map_err(|err| anyhow!("Encryption failed: {}", err))?;

    let payload = EncryptedPayload {
        version: VERSION,
        kdf: KDF.to_string(),
        salt: STANDARD_NO_PAD.encode(salt),
        nonce: STANDARD_NO_PAD.encode(nonce_bytes),
        ciphertext: STANDARD_NO_PAD.encode(ciphertext),
    };

    Ok(serde_json::to_string(&payload)?)
}

pub fn decrypt_string(payload: &str, passphrase: &str) -> Result<String> {
    let enc: EncryptedPayload =
        serde_json::from_str(payload).context("Encrypted field is not a valid envelope")?;
    if enc.version != VERSION || enc.kdf != KDF {
        anyhow::bail!(
            "Unsupported encrypted field format (version {}, kdf {})",
            enc.version,
            enc.kdf
        );
    }
    let salt = STANDARD_NO_PAD
        .decode(enc.salt)
        .context("Invalid salt encoding")?;
    let nonce = STANDARD_NO_PAD
        .decode(enc.nonce)
        .context("Invalid nonce encoding")?;
    let ciphertext = STANDARD_NO_PAD
        .decode(enc.ciphertext)
        .context("Invalid ciphertext encoding")?;

    let key = derive_key(passphrase, &salt)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
        .map_err(|err| anyhow!("Decryption failed (wrong key?): {}", err))?;

    Ok(String::from_utf8(plaintext)?)
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Result<[u8; 32]> {
    let mut key = [0u8; 32];
    let params = argon2::Params::new(19456, 2, 1, Some(32))
        .map_err(|err| anyhow!("Invalid Argon2 parameters: {}", err))?;
    let argon2 = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|err| anyhow!("KDF failed: {}", err))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypted_field_reads_back() {
        let cipher = FieldCipher::new("unit-test-key");
        let sealed = cipher.encrypt(r#"{"accounts":{}}"#).unwrap();
        assert!(!sealed.contains("accounts"));
        assert_eq!(cipher.decrypt(&sealed).unwrap(), r#"{"accounts":{}}"#);
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let sealed = FieldCipher::new("right").encrypt("secret").unwrap();
        assert!(FieldCipher::new("wrong").decrypt(&sealed).is_err());
    }

    #[test]
    fn key_file_is_generated_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("encryption.key");

        let first = FieldCipher::load_or_create(&path).unwrap();
        assert!(path.exists());
        let sealed = first.encrypt("cache").unwrap();

        let second = FieldCipher::load_or_create(&path).unwrap();
        assert_eq!(second.decrypt(&sealed).unwrap(), "cache");
    }
}
