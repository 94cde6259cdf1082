//! inokey-crypto: per-inode encryption key setup
//!
//! Pipeline, run once per inode on first open:
//! ```text
//! context provider → EncryptionContext (28 bytes, validated)
//!   → keyring lookup "fscrypt:<descriptor hex>" (then the filesystem's own prefix)
//!   → master key (32 bytes) ── AES-128-ECB, key = context nonce ──→ file key
//!   → cipher transform: xts(aes) for contents, cts(cbc(aes)) for names
//!   → published into the inode's slot (first writer wins)
//! ```
//!
//! Teardown goes through [`KeyInfo::put_encryption_info`], which zeroes the
//! file key and frees the transform.

pub mod context;
pub mod derive;
pub mod error;
pub mod info;
pub mod keyring;
pub mod transform;

pub use context::{ContextFetchError, CryptOps};
pub use derive::{
    build_deriver, Completion, DerivationEngine, DerivationRequest, DerivedKey, EngineStatus,
    KeyDeriver, SecureExtensionDeriver, SoftwareDeriver, Submission,
};
pub use error::KeyInfoError;
pub use info::{CryptInfo, Inode, KeyInfo};
pub use keyring::{Keyring, KeyringEntry, MemoryKeyring};
pub use transform::{
    CipherSuite, CipherTransform, HwCrypto, SoftwareTransforms, StaticHwCrypto, TransformError,
    TransformFlags, TransformProvider, BLOCK_SIZE,
};
