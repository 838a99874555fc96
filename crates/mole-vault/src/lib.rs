//! `mole-vault`: decrypts connection passwords stored by the admin backend.
//!
//! Ciphertexts are `"<ivHex>:<payloadHex>"`, AES-256-CBC with PKCS#7
//! padding. The key is derived once from a passphrase and never changes for
//! the lifetime of the process.

pub mod error;
pub mod vault;

pub use error::{Result, VaultError};
pub use vault::{CredentialVault, PlainSecret};
