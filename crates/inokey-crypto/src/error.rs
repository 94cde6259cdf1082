use inokey_core::{ContextError, EncryptionMode, InodeKind};
use thiserror::Error;

use crate::context::ContextFetchError;
use crate::transform::TransformError;

#[derive(Debug, Error)]
pub enum KeyInfoError {
    #[error("filesystem does not provide encryption contexts")]
    NotSupported,

    #[error("invalid encryption context: {0}")]
    InvalidContext(#[from] ContextError),

    #[error("fetching encryption context: {0}")]
    ContextFetch(#[from] ContextFetchError),

    #[error("master key {tag} not found")]
    KeyNotFound { tag: String },

    #[error("master key {tag} is invalid: {reason}")]
    KeyInvalid { tag: String, reason: String },

    #[error("unsupported mode {mode} for {kind:?} inode {ino}")]
    UnsupportedMode {
        ino: u64,
        kind: InodeKind,
        mode: EncryptionMode,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transform allocation failed: {0}")]
    Allocation(#[from] TransformError),

    #[error("derivation engine returned status {0}")]
    Engine(i32),

    #[error("derivation engine dropped the request without completing it")]
    EngineAbandoned,
}

impl KeyInfoError {
    /// Missing keys are not a setup failure: the inode stays keyless and the
    /// error surfaces on the first encrypted I/O instead.
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::KeyNotFound { .. })
    }
}
