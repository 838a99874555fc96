use std::fmt;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Result, VaultError};

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// IV size in bytes (one AES block).
pub const IV_LENGTH: usize = 16;
const KEY_LENGTH: usize = 32;

/// A decrypted password. Lives only for the duration of one run.
///
/// `Debug` is redacted so the value cannot leak through `tracing` fields.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct PlainSecret(String);

impl PlainSecret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for PlainSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PlainSecret(***)")
    }
}

/// Decrypts `"<ivHex>:<payloadHex>"` ciphertexts produced by the admin backend.
pub struct CredentialVault {
    key: [u8; KEY_LENGTH],
}

impl CredentialVault {
    /// Derive the cipher key from `passphrase`. Done once at startup.
    pub fn new(passphrase: &str) -> Self {
        Self {
            key: derive_key(passphrase),
        }
    }

    /// Decrypt a stored password.
    ///
    /// - empty input → empty secret
    /// - no `:` separator → returned unchanged (legacy plaintext rows)
    /// - IV not 16 bytes of hex → [`VaultError::MalformedCiphertext`]
    /// - bad payload hex, padding or UTF-8 → [`VaultError::Decryption`]
    pub fn decrypt(&self, ciphertext: &str) -> Result<PlainSecret> {
        if ciphertext.is_empty() {
            return Ok(PlainSecret::default());
        }

        let Some((iv_hex, payload_hex)) = ciphertext.split_once(':') else {
            debug!("secret has no IV separator, treating as legacy plaintext");
            return Ok(PlainSecret::new(ciphertext));
        };

        if iv_hex.len() != IV_LENGTH * 2 {
            return Err(VaultError::MalformedCiphertext(format!(
                "IV must be {IV_LENGTH} bytes, got {} hex chars",
                iv_hex.len()
            )));
        }
        let iv = hex::decode(iv_hex)
            .map_err(|e| VaultError::MalformedCiphertext(format!("IV is not valid hex: {e}")))?;
        let payload = hex::decode(payload_hex)
            .map_err(|e| VaultError::Decryption(format!("payload is not valid hex: {e}")))?;

        let plain = Aes256CbcDec::new_from_slices(&self.key, &iv)
            .map_err(|e| VaultError::Decryption(e.to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(&payload)
            .map_err(|_| {
                warn!(payload_len = payload.len(), "secret failed to unpad");
                VaultError::Decryption("invalid block length or padding".to_string())
            })?;

        String::from_utf8(plain)
            .map(PlainSecret)
            .map_err(|e| VaultError::Decryption(format!("plaintext is not UTF-8: {e}")))
    }
}

/// SHA-256 the passphrase, hex-encode, keep the first 32 hex characters and
/// use their ASCII bytes as the AES-256 key. Must match the encrypting side
/// byte for byte.
fn derive_key(passphrase: &str) -> [u8; KEY_LENGTH] {
    let digest = hex::encode(Sha256::digest(passphrase.as_bytes()));
    let mut key = [0u8; KEY_LENGTH];
    key.copy_from_slice(&digest.as_bytes()[..KEY_LENGTH]);
    key
}
