//! Credential encryption at rest.
//!
//! Inbox secrets (IMAP/SMTP passwords, OAuth client secret and tokens) are
//! sealed with AES-256-GCM under a key derived from `app.encryptionKey`.
//! Sealed values look like `enc:<base64(nonce || ciphertext)>`; values
//! without the prefix are treated as legacy plaintext and passed through.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::models::EmailConfig;

/// Prefix marking a sealed value.
pub const SEALED_PREFIX: &str = "enc:";

/// Nonce size for AES-GCM (96 bits / 12 bytes)
const NONCE_SIZE: usize = 12;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("encryption key is empty")]
    EmptyKey,

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("invalid sealed value: {0}")]
    InvalidFormat(String),
}

/// Seals and opens individual secrets and whole email configs.
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialCipher(..)")
    }
}

impl CredentialCipher {
    pub fn new(key: &str) -> Result<Self, CipherError> {
        if key.trim().is_empty() {
            return Err(CipherError::EmptyKey);
        }
        let digest: [u8; 32] = Sha256::digest(key.as_bytes()).into();
        Ok(Self {
            cipher: Aes256Gcm::new(&digest.into()),
        })
    }

    pub fn is_sealed(value: &str) -> bool {
        value.starts_with(SEALED_PREFIX)
    }

    /// Seal a secret. Empty and already-sealed values are returned unchanged.
    pub fn seal(&self, plaintext: &str) -> Result<String, CipherError> {
        if plaintext.is_empty() || Self::is_sealed(plaintext) {
            return Ok(plaintext.to_string());
        }

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        use aes_gcm::aead::rand_core::RngCore;
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| CipherError::Encryption(e.to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(format!("{SEALED_PREFIX}{}", BASE64.encode(&combined)))
    }

    /// Open a sealed secret. Unsealed values are returned unchanged.
    pub fn open(&self, value: &str) -> Result<String, CipherError> {
        let Some(encoded) = value.strip_prefix(SEALED_PREFIX) else {
            return Ok(value.to_string());
        };

        let combined = BASE64
            .decode(encoded)
            .map_err(|e| CipherError::InvalidFormat(format!("invalid base64: {e}")))?;
        if combined.len() < NONCE_SIZE {
            return Err(CipherError::InvalidFormat(format!(
                "sealed data too short: {} bytes",
                combined.len()
            )));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CipherError::Decryption("wrong key or corrupted data".into()))?;

        String::from_utf8(plaintext).map_err(|e| CipherError::Decryption(e.to_string()))
    }

    /// Seal every secret in an email config.
    pub fn seal_email_config(&self, cfg: &EmailConfig) -> Result<EmailConfig, CipherError> {
        self.map_secrets(cfg, |s| self.seal(s))
    }

    /// Open every secret in an email config.
    pub fn open_email_config(&self, cfg: &EmailConfig) -> Result<EmailConfig, CipherError> {
        self.map_secrets(cfg, |s| self.open(s))
    }

    fn map_secrets<F>(&self, cfg: &EmailConfig, f: F) -> Result<EmailConfig, CipherError>
    where
        F: Fn(&str) -> Result<String, CipherError>,
    {
        let mut out = cfg.clone();
        for s in &mut out.smtp {
            s.password = f(&s.password)?;
        }
        for i in &mut out.imap {
            i.password = f(&i.password)?;
        }
        if let Some(o) = out.oauth.as_mut() {
            o.client_secret = f(&o.client_secret)?;
            o.access_token = f(&o.access_token)?;
            o.refresh_token = f(&o.refresh_token)?;
        }
        Ok(out)
    }
}
