use thiserror::Error;

/// Errors raised while turning a stored ciphertext back into a password.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The ciphertext does not follow `<ivHex>:<payloadHex>`, or the IV is
    /// not exactly 16 bytes.
    #[error("Malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    /// Hex decoding, block decryption, unpadding or UTF-8 decoding failed.
    #[error("Decryption failed: {0}")]
    Decryption(String),
}

pub type Result<T> = std::result::Result<T, VaultError>;
