//! Encryption context resolution.
//!
//! The filesystem owns context storage (usually an xattr). This module only
//! fetches the bytes through [`CryptOps`], checks them, and falls back to a
//! synthesized context when the filesystem runs in dummy-context mode.

use inokey_core::types::CONTEXT_SIZE;
use inokey_core::{EncryptionContext, EncryptionMode};
use thiserror::Error;

use crate::error::KeyInfoError;
use crate::info::Inode;
use crate::transform::HwCrypto;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextFetchError {
    #[error("inode has no encryption context")]
    Absent,

    #[error("{0}")]
    Failed(String),
}

/// Hooks a filesystem supplies for key setup.
pub trait CryptOps: Send + Sync {
    /// Whether the filesystem can store contexts at all.
    fn has_context(&self) -> bool {
        true
    }

    /// Raw context bytes for `inode`.
    fn get_context(&self, inode: &Inode) -> Result<Vec<u8>, ContextFetchError>;

    /// Filesystem-specific keyring prefix, tried after the primary one.
    fn key_prefix(&self) -> Option<String> {
        None
    }

    /// Test mode: inodes without a context get a default one and a fixed key.
    fn dummy_context_enabled(&self) -> bool {
        false
    }
}

/// Contents mode for synthesized contexts.
fn default_contents_mode(hw: &dyn HwCrypto) -> EncryptionMode {
    if hw.is_hw_crypto_enabled() {
        EncryptionMode::Private
    } else {
        EncryptionMode::AesXts
    }
}

pub(crate) fn resolve_context(
    fs: &dyn CryptOps,
    hw: &dyn HwCrypto,
    inode: &Inode,
) -> Result<EncryptionContext, KeyInfoError> {
    if !fs.has_context() {
        return Err(KeyInfoError::NotSupported);
    }

    let ctx = match fs.get_context(inode) {
        Ok(bytes) => {
            if bytes.len() != CONTEXT_SIZE {
                tracing::warn!(
                    ino = inode.ino(),
                    len = bytes.len(),
                    expected = CONTEXT_SIZE,
                    "stored encryption context has the wrong size"
                );
            }
            EncryptionContext::from_bytes(&bytes)?
        }
        Err(e) if fs.dummy_context_enabled() => {
            tracing::debug!(ino = inode.ino(), reason = %e, "using dummy encryption context");
            EncryptionContext::dummy(default_contents_mode(hw))
        }
        Err(e) => return Err(e.into()),
    };

    ctx.validate()?;
    Ok(ctx)
}
