//! Token-at-rest encryption.
//!
//! Uses AES-256-GCM with a key read from `ENCRYPTION_KEY_FILE`. Encrypted
//! values are wrapped in `<encrypted v="1">BASE64(nonce||ciphertext)</encrypted>`
//! so ciphertext is unambiguously distinguishable from a plaintext token
//! (useful when importing legacy unencrypted rows).

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use std::path::Path;

const KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;
const ENCRYPTION_VERSION: &str = "1";
const ENCRYPTED_PREFIX: &str = "<encrypted v=\"";
const ENCRYPTED_SUFFIX: &str = "</encrypted>";

#[derive(Clone)]
pub struct TokenCipher {
    key: [u8; KEY_LENGTH],
}

impl TokenCipher {
    /// Load the key from `path`, generating and persisting a fresh random
    /// key on first run. The key file is written with `0600` permissions on
    /// Unix so it is never world-readable.
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        if path.exists() {
            let raw = tokio::fs::read(path)
                .await
                .with_context(|| format!("reading encryption key file {}", path.display()))?;
            let decoded = BASE64
                .decode(raw.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect::<Vec<u8>>())
                .context("encryption key file is not valid base64")?;
            if decoded.len() != KEY_LENGTH {
                return Err(anyhow!(
                    "encryption key file has {} bytes, expected {}",
                    decoded.len(),
                    KEY_LENGTH
                ));
            }
            let mut key = [0u8; KEY_LENGTH];
            key.copy_from_slice(&decoded);
            return Ok(Self { key });
        }

        let mut key = [0u8; KEY_LENGTH];
        rand::thread_rng().fill_bytes(&mut key);
        let encoded = BASE64.encode(key);
        tokio::fs::write(path, encoded.as_bytes())
            .await
            .with_context(|| format!("writing encryption key file {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(path, perms).await.ok();
        }
        Ok(Self { key })
    }

    pub fn is_encrypted(value: &str) -> bool {
        let trimmed = value.trim();
        trimmed.starts_with(ENCRYPTED_PREFIX) && trimmed.ends_with(ENCRYPTED_SUFFIX)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        if Self::is_encrypted(plaintext) {
            return Ok(plaintext.to_string());
        }

        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| anyhow!("failed to create cipher: {e}"))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("encryption failed: {e}"))?;

        let mut combined = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(format!(
            "{ENCRYPTED_PREFIX}{ENCRYPTION_VERSION}\">{}</encrypted>",
            BASE64.encode(&combined)
        ))
    }

    pub fn decrypt(&self, value: &str) -> Result<String> {
        let Some((version, payload)) = parse_encrypted(value) else {
            return Ok(value.to_string());
        };

        if version != ENCRYPTION_VERSION {
            return Err(anyhow!("unsupported encryption version: {version}"));
        }

        let combined = BASE64.decode(payload).context("invalid base64 payload")?;
        if combined.len() < NONCE_LENGTH {
            return Err(anyhow!("encrypted value too short"));
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LENGTH);

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| anyhow!("failed to create cipher: {e}"))?;
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| anyhow!("decryption failed: invalid key or corrupted data"))?;

        String::from_utf8(plaintext).context("decrypted value is not valid utf-8")
    }
}

fn parse_encrypted(value: &str) -> Option<(&str, &str)> {
    let trimmed = value.trim();
    if !trimmed.starts_with(ENCRYPTED_PREFIX) || !trimmed.ends_with(ENCRYPTED_SUFFIX) {
        return None;
    }
    let after_prefix = &trimmed[ENCRYPTED_PREFIX.len()..];
    let version_end = after_prefix.find("\">")?;
    let version = &after_prefix[..version_end];
    let payload_start = ENCRYPTED_PREFIX.len() + version_end + 2;
    let payload_end = trimmed.len() - ENCRYPTED_SUFFIX.len();
    Some((version, &trimmed[payload_start..payload_end]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_cipher() -> TokenCipher {
        TokenCipher { key: [7u8; KEY_LENGTH] }
    }

    #[test]
    fn round_trips_plaintext() {
        let cipher = fixed_cipher();
        let encrypted = cipher.encrypt("sk-abc-123").unwrap();
        assert!(TokenCipher::is_encrypted(&encrypted));
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), "sk-abc-123");
    }

    #[test]
    fn decrypt_is_noop_on_plaintext() {
        let cipher = fixed_cipher();
        assert_eq!(cipher.decrypt("not-encrypted").unwrap(), "not-encrypted");
    }

    #[test]
    fn double_encrypt_is_idempotent() {
        let cipher = fixed_cipher();
        let once = cipher.encrypt("token").unwrap();
        let twice = cipher.encrypt(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let cipher_a = fixed_cipher();
        let cipher_b = TokenCipher { key: [9u8; KEY_LENGTH] };
        let encrypted = cipher_a.encrypt("secret").unwrap();
        assert!(cipher_b.decrypt(&encrypted).is_err());
    }
}
