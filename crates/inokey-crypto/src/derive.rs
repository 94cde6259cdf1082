//! Per-file key derivation.
//!
//! ```text
//! file_key = AES-128-ECB-Encrypt(key = nonce[16], data = master_key[32])
//! ```
//!
//! Two interchangeable backends implement [`KeyDeriver`]:
//! - [`SoftwareDeriver`]: RustCrypto `aes`, synchronous.
//! - [`SecureExtensionDeriver`]: hands the request to a [`DerivationEngine`]
//!   (secure world, crypto coprocessor) and blocks until it completes.
//!
//! Which one a [`crate::KeyInfo`] uses is decided at configuration time via
//! [`build_deriver`].

use std::sync::Arc;

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use inokey_core::config::DeriverBackend;
use inokey_core::types::{CONTENTS_KEY_SIZE, NONCE_SIZE};
use tokio::sync::oneshot;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::KeyInfoError;

/// A derived per-file key. Zeroized on drop, never persisted.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    bytes: [u8; CONTENTS_KEY_SIZE],
}

impl DerivedKey {
    pub fn from_bytes(bytes: [u8; CONTENTS_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; CONTENTS_KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Derives a per-file key from master key material and the inode nonce.
pub trait KeyDeriver: Send + Sync {
    fn backend(&self) -> DeriverBackend;

    fn derive(
        &self,
        deriving_key: &[u8; NONCE_SIZE],
        source: &[u8; CONTENTS_KEY_SIZE],
    ) -> Result<DerivedKey, KeyInfoError>;
}

/// AES-128-ECB in software.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftwareDeriver;

impl KeyDeriver for SoftwareDeriver {
    fn backend(&self) -> DeriverBackend {
        DeriverBackend::Software
    }

    fn derive(
        &self,
        deriving_key: &[u8; NONCE_SIZE],
        source: &[u8; CONTENTS_KEY_SIZE],
    ) -> Result<DerivedKey, KeyInfoError> {
        let cipher = Aes128::new(GenericArray::from_slice(deriving_key));
        let mut key = DerivedKey::from_bytes(*source);
        for block in key.bytes.chunks_exact_mut(16) {
            cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(key)
    }
}

/// Input handed to a derivation engine. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivationRequest {
    pub deriving_key: [u8; NONCE_SIZE],
    pub source: [u8; CONTENTS_KEY_SIZE],
}

/// Final status code reported by an engine, passed through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatus(pub i32);

/// What an engine says when a request is submitted.
#[derive(Debug)]
pub enum Submission {
    /// Finished inline; the completion will not be signalled.
    Complete(Result<DerivedKey, EngineStatus>),
    /// Accepted; the result arrives through the completion.
    InProgress,
    /// Queued behind other work; the result arrives through the completion.
    Backlogged,
}

/// One-shot completion signal handed to an engine along with a request.
#[derive(Debug)]
pub struct Completion {
    tx: oneshot::Sender<Result<DerivedKey, EngineStatus>>,
}

impl Completion {
    pub fn complete(self, result: Result<DerivedKey, EngineStatus>) {
        // The receiver only goes away if the deriving thread was torn down.
        let _ = self.tx.send(result);
    }
}

/// A key derivation engine outside this process' control.
pub trait DerivationEngine: Send + Sync {
    fn submit(&self, request: DerivationRequest, completion: Completion) -> Submission;
}

/// Derivation through a secure-extension engine.
///
/// Blocks the calling thread while the engine works; must not be called from
/// inside an async runtime worker.
pub struct SecureExtensionDeriver {
    engine: Arc<dyn DerivationEngine>,
}

impl SecureExtensionDeriver {
    pub fn new(engine: Arc<dyn DerivationEngine>) -> Self {
        Self { engine }
    }
}

impl KeyDeriver for SecureExtensionDeriver {
    fn backend(&self) -> DeriverBackend {
        DeriverBackend::SecureExtension
    }

    fn derive(
        &self,
        deriving_key: &[u8; NONCE_SIZE],
        source: &[u8; CONTENTS_KEY_SIZE],
    ) -> Result<DerivedKey, KeyInfoError> {
        let request = DerivationRequest {
            deriving_key: *deriving_key,
            source: *source,
        };
        let (tx, rx) = oneshot::channel();

        let result = match self.engine.submit(request, Completion { tx }) {
            Submission::Complete(result) => result,
            pending @ (Submission::InProgress | Submission::Backlogged) => {
                tracing::trace!(state = ?pending, "waiting for derivation engine");
                rx.blocking_recv()
                    .map_err(|_| KeyInfoError::EngineAbandoned)?
            }
        };

        result.map_err(|status| KeyInfoError::Engine(status.0))
    }
}

/// Pick the derivation backend named in the config.
pub fn build_deriver(
    backend: DeriverBackend,
    engine: Option<Arc<dyn DerivationEngine>>,
) -> Result<Arc<dyn KeyDeriver>, KeyInfoError> {
    match (backend, engine) {
        (DeriverBackend::Software, _) => Ok(Arc::new(SoftwareDeriver)),
        (DeriverBackend::SecureExtension, Some(engine)) => {
            Ok(Arc::new(SecureExtensionDeriver::new(engine)))
        }
        (DeriverBackend::SecureExtension, None) => Err(KeyInfoError::Configuration(
            "secure-extension derivation selected but no engine is registered".into(),
        )),
    }
}
