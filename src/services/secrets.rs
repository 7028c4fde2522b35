use crate::error::{Error, Result};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;
const DEFAULT_PASSPHRASE: &str = "ha-config-optimizer-default-key";

/// Encryption-at-rest for stored credentials.
///
/// `decrypt` and `is_ciphertext` never fail: values that are not ciphertext
/// are treated as plaintext, which lets legacy unencrypted keys keep working.
pub trait SecretStore: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String>;

    /// The plaintext, or `value` unchanged when it does not decrypt.
    fn decrypt(&self, value: &str) -> String;

    fn is_ciphertext(&self, value: &str) -> bool;
}

pub struct AesSecretStore {
    cipher: Aes256Gcm,
}

impl AesSecretStore {
    /// Derives the AES-256 key from `passphrase`, or a fixed default when none is set.
    pub fn new(passphrase: Option<&str>) -> Self {
        if passphrase.is_none() {
            tracing::warn!("No encryption key configured; using the built-in default");
        }
        let digest = Sha256::digest(passphrase.unwrap_or(DEFAULT_PASSPHRASE).as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(digest.as_slice());
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    fn try_decrypt(&self, value: &str) -> Option<String> {
        let raw = URL_SAFE_NO_PAD.decode(value.trim()).ok()?;
        if raw.len() <= NONCE_LEN {
            return None;
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .ok()?;
        String::from_utf8(plaintext).ok()
    }
}

impl SecretStore for AesSecretStore {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| Error::config("failed to encrypt credential"))?;

        let mut raw = nonce.to_vec();
        raw.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(raw))
    }

    fn decrypt(&self, value: &str) -> String {
        match self.try_decrypt(value) {
            Some(plaintext) => plaintext,
            None => {
                tracing::debug!("Value is not ciphertext; using it as plaintext");
                value.to_string()
            }
        }
    }

    fn is_ciphertext(&self, value: &str) -> bool {
        !value.is_empty() && self.try_decrypt(value).is_some()
    }
}
