//! Cipher transform selection and keying.
//!
//! | inode kind        | mode     | transform        | key bytes |
//! |-------------------|----------|------------------|-----------|
//! | regular file      | AES-XTS  | `xts(aes)`       | 32        |
//! | regular file      | private  | none (inline hw) | -         |
//! | directory/symlink | AES-CTS  | `cts(cbc(aes))`  | 16        |
//!
//! Anything else is rejected before a key is looked up.

use std::fmt;
use std::ops::BitOr;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use inokey_core::types::{CONTENTS_KEY_SIZE, FILENAMES_KEY_SIZE};
use inokey_core::{EncryptionMode, InodeKind};
use thiserror::Error;
use xts_mode::Xts128;

use crate::derive::DerivedKey;
use crate::error::KeyInfoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherSuite {
    /// AES-XTS over file contents
    AesXts,
    /// AES-CBC with ciphertext stealing over filenames
    AesCbcCts,
}

impl CipherSuite {
    pub fn name(self) -> &'static str {
        match self {
            Self::AesXts => "xts(aes)",
            Self::AesCbcCts => "cts(cbc(aes))",
        }
    }

    pub fn key_size(self) -> usize {
        match self {
            Self::AesXts => CONTENTS_KEY_SIZE,
            Self::AesCbcCts => FILENAMES_KEY_SIZE,
        }
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Request flags on a transform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformFlags(u32);

impl TransformFlags {
    pub const NONE: Self = Self(0);
    /// Accept keys the cipher would otherwise refuse as weak.
    pub const WEAK_KEY: Self = Self(0x100);
    pub const ALL: Self = Self(u32::MAX);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for TransformFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("no implementation of {0}")]
    Unavailable(&'static str),

    #[error("key is {actual} bytes (expected {expected})")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("transform has no key")]
    NotKeyed,

    #[error("data is {0} bytes (need at least one block)")]
    ShortData(usize),

    #[error("{0}")]
    Failed(String),
}

/// AES block size; the minimum unit either suite accepts.
pub const BLOCK_SIZE: usize = 16;

/// A keyed encrypt/decrypt engine bound to one inode. Freed on drop.
pub trait CipherTransform: Send + Sync {
    fn suite(&self) -> CipherSuite;
    fn flags(&self) -> TransformFlags;
    fn clear_flags(&mut self, flags: TransformFlags);
    fn set_flags(&mut self, flags: TransformFlags);
    fn set_key(&mut self, key: &[u8]) -> Result<(), TransformError>;
    fn is_keyed(&self) -> bool;

    /// Encrypt `data` in place. `iv` is the XTS tweak (sector number) or the
    /// CBC initial vector.
    fn encrypt(&self, iv: &[u8; BLOCK_SIZE], data: &mut [u8]) -> Result<(), TransformError>;

    fn decrypt(&self, iv: &[u8; BLOCK_SIZE], data: &mut [u8]) -> Result<(), TransformError>;
}

impl fmt::Debug for dyn CipherTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherTransform")
            .field("suite", &self.suite())
            .field("flags", &self.flags())
            .field("keyed", &self.is_keyed())
            .finish()
    }
}

pub trait TransformProvider: Send + Sync {
    fn alloc(&self, suite: CipherSuite) -> Result<Box<dyn CipherTransform>, TransformError>;
}

/// Inline-encryption capability of the underlying block device.
pub trait HwCrypto: Send + Sync {
    fn is_hw_crypto_enabled(&self) -> bool;
}

/// A fixed answer, for devices whose capability is known up front.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticHwCrypto(pub bool);

impl HwCrypto for StaticHwCrypto {
    fn is_hw_crypto_enabled(&self) -> bool {
        self.0
    }
}

/// Transforms backed by RustCrypto `aes` and `xts-mode`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftwareTransforms;

enum KeySchedule {
    Xts(Box<Xts128<Aes128>>),
    CbcCts(Box<Aes128>),
}

struct SoftwareTransform {
    suite: CipherSuite,
    flags: TransformFlags,
    schedule: Option<KeySchedule>,
}

impl CipherTransform for SoftwareTransform {
    fn suite(&self) -> CipherSuite {
        self.suite
    }

    fn flags(&self) -> TransformFlags {
        self.flags
    }

    fn clear_flags(&mut self, flags: TransformFlags) {
        self.flags.remove(flags);
    }

    fn set_flags(&mut self, flags: TransformFlags) {
        self.flags.insert(flags);
    }

    fn set_key(&mut self, key: &[u8]) -> Result<(), TransformError> {
        let expected = self.suite.key_size();
        if key.len() != expected {
            return Err(TransformError::InvalidKeyLength {
                expected,
                actual: key.len(),
            });
        }

        let bad_len = |_: aes::cipher::InvalidLength| TransformError::InvalidKeyLength {
            expected,
            actual: key.len(),
        };
        let schedule = match self.suite {
            CipherSuite::AesXts => {
                let (data, tweak) = key.split_at(expected / 2);
                KeySchedule::Xts(Box::new(Xts128::new(
                    Aes128::new_from_slice(data).map_err(bad_len)?,
                    Aes128::new_from_slice(tweak).map_err(bad_len)?,
                )))
            }
            CipherSuite::AesCbcCts => {
                KeySchedule::CbcCts(Box::new(Aes128::new_from_slice(key).map_err(bad_len)?))
            }
        };
        self.schedule = Some(schedule);
        Ok(())
    }

    fn is_keyed(&self) -> bool {
        self.schedule.is_some()
    }

    fn encrypt(&self, iv: &[u8; BLOCK_SIZE], data: &mut [u8]) -> Result<(), TransformError> {
        match self.keyed_schedule(data)? {
            KeySchedule::Xts(xts) => xts.encrypt_sector(data, *iv),
            KeySchedule::CbcCts(aes) => cbc_cts_encrypt(aes, iv, data),
        }
        Ok(())
    }

    fn decrypt(&self, iv: &[u8; BLOCK_SIZE], data: &mut [u8]) -> Result<(), TransformError> {
        match self.keyed_schedule(data)? {
            KeySchedule::Xts(xts) => xts.decrypt_sector(data, *iv),
            KeySchedule::CbcCts(aes) => cbc_cts_decrypt(aes, iv, data),
        }
        Ok(())
    }
}

impl SoftwareTransform {
    fn keyed_schedule(&self, data: &[u8]) -> Result<&KeySchedule, TransformError> {
        let schedule = self.schedule.as_ref().ok_or(TransformError::NotKeyed)?;
        if data.len() < BLOCK_SIZE {
            return Err(TransformError::ShortData(data.len()));
        }
        Ok(schedule)
    }
}

fn xor_block(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= *s;
    }
}

fn encrypt_block(aes: &Aes128, block: &mut [u8]) {
    aes.encrypt_block(GenericArray::from_mut_slice(block));
}

fn decrypt_block(aes: &Aes128, block: &mut [u8]) {
    aes.decrypt_block(GenericArray::from_mut_slice(block));
}

/// CBC with ciphertext stealing, the last two blocks swapped (CS3).
/// `data.len() >= BLOCK_SIZE`.
fn cbc_cts_encrypt(aes: &Aes128, iv: &[u8; BLOCK_SIZE], data: &mut [u8]) {
    let len = data.len();
    if len == BLOCK_SIZE {
        xor_block(data, iv);
        encrypt_block(aes, data);
        return;
    }

    let blocks = len.div_ceil(BLOCK_SIZE);
    let tail = len - (blocks - 1) * BLOCK_SIZE;
    let split = (blocks - 2) * BLOCK_SIZE;

    let mut prev = *iv;
    for block in data[..split].chunks_exact_mut(BLOCK_SIZE) {
        xor_block(block, &prev);
        encrypt_block(aes, block);
        prev.copy_from_slice(block);
    }

    let mut stolen = [0u8; BLOCK_SIZE];
    stolen.copy_from_slice(&data[split..split + BLOCK_SIZE]);
    xor_block(&mut stolen, &prev);
    encrypt_block(aes, &mut stolen);

    let mut last = [0u8; BLOCK_SIZE];
    last[..tail].copy_from_slice(&data[split + BLOCK_SIZE..]);
    xor_block(&mut last, &stolen);
    encrypt_block(aes, &mut last);

    data[split..split + BLOCK_SIZE].copy_from_slice(&last);
    data[split + BLOCK_SIZE..].copy_from_slice(&stolen[..tail]);
}

fn cbc_cts_decrypt(aes: &Aes128, iv: &[u8; BLOCK_SIZE], data: &mut [u8]) {
    let len = data.len();
    if len == BLOCK_SIZE {
        decrypt_block(aes, data);
        xor_block(data, iv);
        return;
    }

    let blocks = len.div_ceil(BLOCK_SIZE);
    let tail = len - (blocks - 1) * BLOCK_SIZE;
    let split = (blocks - 2) * BLOCK_SIZE;

    let mut prev = *iv;
    for block in data[..split].chunks_exact_mut(BLOCK_SIZE) {
        let mut cipher = [0u8; BLOCK_SIZE];
        cipher.copy_from_slice(block);
        decrypt_block(aes, block);
        xor_block(block, &prev);
        prev = cipher;
    }

    // The full block at `split` hides the padded tail; its decryption also
    // carries the stolen bytes of the previous ciphertext block.
    let mut mixed = [0u8; BLOCK_SIZE];
    mixed.copy_from_slice(&data[split..split + BLOCK_SIZE]);
    decrypt_block(aes, &mut mixed);

    let mut stolen = [0u8; BLOCK_SIZE];
    stolen[..tail].copy_from_slice(&data[split + BLOCK_SIZE..]);
    stolen[tail..].copy_from_slice(&mixed[tail..]);
    xor_block(&mut mixed, &stolen);

    let mut first = stolen;
    decrypt_block(aes, &mut first);
    xor_block(&mut first, &prev);

    data[split..split + BLOCK_SIZE].copy_from_slice(&first);
    data[split + BLOCK_SIZE..].copy_from_slice(&mixed[..tail]);
}

impl TransformProvider for SoftwareTransforms {
    fn alloc(&self, suite: CipherSuite) -> Result<Box<dyn CipherTransform>, TransformError> {
        Ok(Box::new(SoftwareTransform {
            suite,
            flags: TransformFlags::NONE,
            schedule: None,
        }))
    }
}

/// What key setup needs for one inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CipherChoice {
    /// Software transform keyed with the leading `suite.key_size()` bytes.
    Software(CipherSuite),
    /// Contents handled by the inline engine; nothing to key here.
    Hardware,
}

pub(crate) fn determine_cipher(
    ino: u64,
    kind: InodeKind,
    contents_mode: EncryptionMode,
    filenames_mode: EncryptionMode,
) -> Result<CipherChoice, KeyInfoError> {
    let unsupported = |mode: EncryptionMode| {
        tracing::warn!(ino, ?kind, %mode, "unsupported encryption mode");
        Err(KeyInfoError::UnsupportedMode { ino, kind, mode })
    };

    match kind {
        InodeKind::Regular => match contents_mode {
            EncryptionMode::AesXts => Ok(CipherChoice::Software(CipherSuite::AesXts)),
            EncryptionMode::Private => Ok(CipherChoice::Hardware),
            other => unsupported(other),
        },
        InodeKind::Directory | InodeKind::Symlink => match filenames_mode {
            EncryptionMode::AesCts => Ok(CipherChoice::Software(CipherSuite::AesCbcCts)),
            other => unsupported(other),
        },
        InodeKind::Special => unsupported(contents_mode),
    }
}

/// Allocate and key the transform for `choice`. Failures are not retried.
pub(crate) fn bind(
    ino: u64,
    choice: CipherChoice,
    key: &DerivedKey,
    transforms: &dyn TransformProvider,
    hw: &dyn HwCrypto,
) -> Result<Option<Box<dyn CipherTransform>>, KeyInfoError> {
    let suite = match choice {
        CipherChoice::Software(suite) => suite,
        CipherChoice::Hardware => {
            if !hw.is_hw_crypto_enabled() {
                tracing::warn!(ino, "inline crypto support not available");
                return Err(KeyInfoError::Configuration(
                    "private contents mode requires inline crypto support".into(),
                ));
            }
            return Ok(None);
        }
    };

    let mut tfm = transforms.alloc(suite).map_err(|e| {
        tracing::error!(ino, suite = suite.name(), error = %e, "allocating crypto transform");
        e
    })?;
    tfm.clear_flags(TransformFlags::ALL);
    tfm.set_flags(TransformFlags::WEAK_KEY);
    tfm.set_key(&key.as_bytes()[..suite.key_size()])?;
    Ok(Some(tfm))
}
