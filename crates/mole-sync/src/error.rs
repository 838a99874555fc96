//! Error types for the mole-sync crate.
//!
//! The `Display` text of every variant ends up verbatim in the run ledger's
//! `message` column.

use mole_vault::VaultError;
use thiserror::Error;

use crate::postgres::Phase;

/// Everything that can abort a single run.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A stored password could not be decrypted.
    #[error("decrypt {side} password failed: {source}")]
    Decryption {
        side: &'static str,
        #[source]
        source: VaultError,
    },

    /// No transfer exists for this engine pair.
    #[error("unsupported pair: {source_engine} to {target_engine}")]
    UnsupportedPair {
        source_engine: String,
        target_engine: String,
    },

    /// An external tool exited non-zero.
    #[error("{phase} failed (exit {exit_code}): {stderr}")]
    ExternalTool {
        phase: Phase,
        exit_code: i32,
        stderr: String,
    },

    /// An external tool ran past the phase timeout and was killed.
    #[error("{phase} timed out after {secs}s")]
    Timeout { phase: Phase, secs: u64 },

    /// An external tool could not be started.
    #[error("{phase}: failed to start {program}: {source}")]
    Spawn {
        phase: Phase,
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Local file handling failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Short machine-readable code, used as a structured log field.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Decryption { .. } => "DECRYPTION",
            Self::UnsupportedPair { .. } => "UNSUPPORTED_PAIR",
            Self::ExternalTool { .. } => "EXTERNAL_TOOL",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Spawn { .. } => "SPAWN",
            Self::Io(_) => "IO",
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, SyncError>;
