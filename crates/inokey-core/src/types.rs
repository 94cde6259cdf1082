//! On-disk and keyring layouts shared by every inokey crate.
//!
//! Encryption context (28 bytes, stored per inode by the filesystem):
//! ```text
//! [1 byte: format][1 byte: contents mode][1 byte: filenames mode][1 byte: flags]
//! [8 bytes: master key descriptor][16 bytes: nonce]
//! ```
//!
//! Master key payload (72 bytes, stored in a keyring entry):
//! ```text
//! [4 bytes: mode, LE][64 bytes: raw key][4 bytes: size, LE]
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroize;

/// The only context format this crate understands.
pub const CONTEXT_FORMAT_V1: u8 = 1;

/// Size of a master key descriptor in bytes.
pub const KEY_DESCRIPTOR_SIZE: usize = 8;

/// Size of the per-inode nonce. Also the AES-128-ECB deriving key size.
pub const NONCE_SIZE: usize = 16;

/// Size of an encoded [`EncryptionContext`].
pub const CONTEXT_SIZE: usize = 4 + KEY_DESCRIPTOR_SIZE + NONCE_SIZE;

/// Key size for file contents (AES-XTS, two AES-128 halves).
pub const CONTENTS_KEY_SIZE: usize = 32;

/// Key size for filenames (AES-CBC with ciphertext stealing).
pub const FILENAMES_KEY_SIZE: usize = 16;

/// Capacity of the raw key field in a keyring payload.
pub const MAX_KEY_SIZE: usize = 64;

/// Size of an encoded [`MasterKeyPayload`].
pub const MASTER_KEY_PAYLOAD_SIZE: usize = 4 + MAX_KEY_SIZE + 4;

/// Padding flags, the only policy flags defined for format v1.
pub const POLICY_FLAGS_PAD_MASK: u8 = 0x03;
pub const POLICY_FLAGS_VALID: u8 = POLICY_FLAGS_PAD_MASK;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context is {actual} bytes (expected {expected})")]
    WrongLength { expected: usize, actual: usize },

    #[error("unsupported context format {0}")]
    UnsupportedFormat(u8),

    #[error("unrecognized policy flags {0:#04x}")]
    InvalidFlags(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("keyring payload is {actual} bytes (expected {expected})")]
    WrongLength { expected: usize, actual: usize },

    #[error("master key size is {actual} (expected {expected})")]
    KeySize { expected: usize, actual: usize },
}

/// Cipher mode byte as stored in the context.
///
/// Unknown bytes are preserved so that the mode check can report them; a
/// context with an unknown mode still parses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionMode {
    Invalid,
    AesXts,
    AesGcm,
    AesCbc,
    AesCts,
    /// Contents are encrypted by an inline hardware engine; no software key.
    Private,
    Unknown(u8),
}

impl EncryptionMode {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0 => Self::Invalid,
            1 => Self::AesXts,
            2 => Self::AesGcm,
            3 => Self::AesCbc,
            4 => Self::AesCts,
            127 => Self::Private,
            other => Self::Unknown(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::Invalid => 0,
            Self::AesXts => 1,
            Self::AesGcm => 2,
            Self::AesCbc => 3,
            Self::AesCts => 4,
            Self::Private => 127,
            Self::Unknown(other) => other,
        }
    }
}

impl fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid => write!(f, "invalid"),
            Self::AesXts => write!(f, "aes-xts"),
            Self::AesGcm => write!(f, "aes-gcm"),
            Self::AesCbc => write!(f, "aes-cbc"),
            Self::AesCts => write!(f, "aes-cts"),
            Self::Private => write!(f, "private"),
            Self::Unknown(b) => write!(f, "unknown({b})"),
        }
    }
}

/// File type of an inode, as far as key setup cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InodeKind {
    Regular,
    Directory,
    Symlink,
    /// Devices, fifos, sockets. Never encrypted.
    Special,
}

impl InodeKind {
    /// Classify a POSIX `st_mode`.
    pub fn from_mode(mode: u32) -> Self {
        match mode & 0o170000 {
            0o100000 => Self::Regular,
            0o040000 => Self::Directory,
            0o120000 => Self::Symlink,
            _ => Self::Special,
        }
    }
}

/// Opaque identifier of a master key in the keyring.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KeyDescriptor(pub [u8; KEY_DESCRIPTOR_SIZE]);

impl KeyDescriptor {
    /// Lowercase hex, the form used in keyring lookup tags.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for KeyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyDescriptor({})", self.to_hex())
    }
}

impl fmt::Display for KeyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for KeyDescriptor {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| anyhow::anyhow!("descriptor hex: {e}"))?;
        let arr: [u8; KEY_DESCRIPTOR_SIZE] = bytes.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!(
                "descriptor is {} bytes (expected {KEY_DESCRIPTOR_SIZE})",
                bytes.len()
            )
        })?;
        Ok(Self(arr))
    }
}

/// Per-inode encryption metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionContext {
    pub format: u8,
    pub contents_mode: EncryptionMode,
    pub filenames_mode: EncryptionMode,
    pub flags: u8,
    pub descriptor: KeyDescriptor,
    pub nonce: [u8; NONCE_SIZE],
}

impl EncryptionContext {
    /// Decode a context. Only the length is checked here; see [`Self::validate`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ContextError> {
        if bytes.len() != CONTEXT_SIZE {
            return Err(ContextError::WrongLength {
                expected: CONTEXT_SIZE,
                actual: bytes.len(),
            });
        }

        let mut descriptor = [0u8; KEY_DESCRIPTOR_SIZE];
        descriptor.copy_from_slice(&bytes[4..4 + KEY_DESCRIPTOR_SIZE]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[4 + KEY_DESCRIPTOR_SIZE..]);

        Ok(Self {
            format: bytes[0],
            contents_mode: EncryptionMode::from_byte(bytes[1]),
            filenames_mode: EncryptionMode::from_byte(bytes[2]),
            flags: bytes[3],
            descriptor: KeyDescriptor(descriptor),
            nonce,
        })
    }

    pub fn to_bytes(&self) -> [u8; CONTEXT_SIZE] {
        let mut out = [0u8; CONTEXT_SIZE];
        out[0] = self.format;
        out[1] = self.contents_mode.as_byte();
        out[2] = self.filenames_mode.as_byte();
        out[3] = self.flags;
        out[4..4 + KEY_DESCRIPTOR_SIZE].copy_from_slice(&self.descriptor.0);
        out[4 + KEY_DESCRIPTOR_SIZE..].copy_from_slice(&self.nonce);
        out
    }

    /// Check the format version and policy flags.
    pub fn validate(&self) -> Result<(), ContextError> {
        if self.format != CONTEXT_FORMAT_V1 {
            return Err(ContextError::UnsupportedFormat(self.format));
        }
        if self.flags & !POLICY_FLAGS_VALID != 0 {
            return Err(ContextError::InvalidFlags(self.flags));
        }
        Ok(())
    }

    /// Default context used when the filesystem forces test encryption on an
    /// inode that has no stored context.
    pub fn dummy(contents_mode: EncryptionMode) -> Self {
        Self {
            format: CONTEXT_FORMAT_V1,
            contents_mode,
            filenames_mode: EncryptionMode::AesCts,
            flags: 0,
            descriptor: KeyDescriptor::default(),
            nonce: [0u8; NONCE_SIZE],
        }
    }
}

/// Master key material as stored in a keyring entry. Zeroized on drop.
#[derive(Clone)]
pub struct MasterKeyPayload {
    pub mode: u32,
    raw: [u8; MAX_KEY_SIZE],
    pub size: u32,
}

impl MasterKeyPayload {
    /// Build a payload around `key`. Keys longer than the raw field are truncated.
    pub fn new(mode: u32, key: &[u8]) -> Self {
        let mut raw = [0u8; MAX_KEY_SIZE];
        let len = key.len().min(MAX_KEY_SIZE);
        raw[..len].copy_from_slice(&key[..len]);
        Self {
            mode,
            raw,
            size: len as u32,
        }
    }

    /// Decode a payload. The length must match exactly.
    pub fn parse(bytes: &[u8]) -> Result<Self, PayloadError> {
        if bytes.len() != MASTER_KEY_PAYLOAD_SIZE {
            return Err(PayloadError::WrongLength {
                expected: MASTER_KEY_PAYLOAD_SIZE,
                actual: bytes.len(),
            });
        }

        let mut mode = [0u8; 4];
        mode.copy_from_slice(&bytes[..4]);
        let mut raw = [0u8; MAX_KEY_SIZE];
        raw.copy_from_slice(&bytes[4..4 + MAX_KEY_SIZE]);
        let mut size = [0u8; 4];
        size.copy_from_slice(&bytes[4 + MAX_KEY_SIZE..]);

        Ok(Self {
            mode: u32::from_le_bytes(mode),
            raw,
            size: u32::from_le_bytes(size),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MASTER_KEY_PAYLOAD_SIZE);
        out.extend_from_slice(&self.mode.to_le_bytes());
        out.extend_from_slice(&self.raw);
        out.extend_from_slice(&self.size.to_le_bytes());
        out
    }

    /// The leading bytes of the raw field, provided the declared size is
    /// exactly the contents key size.
    pub fn contents_key(&self) -> Result<&[u8; CONTENTS_KEY_SIZE], PayloadError> {
        if self.size as usize != CONTENTS_KEY_SIZE {
            return Err(PayloadError::KeySize {
                expected: CONTENTS_KEY_SIZE,
                actual: self.size as usize,
            });
        }
        self.raw[..CONTENTS_KEY_SIZE]
            .try_into()
            .map_err(|_| PayloadError::KeySize {
                expected: CONTENTS_KEY_SIZE,
                actual: self.size as usize,
            })
    }
}

impl Drop for MasterKeyPayload {
    fn drop(&mut self) {
        self.raw.zeroize();
    }
}

impl fmt::Debug for MasterKeyPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKeyPayload")
            .field("mode", &self.mode)
            .field("raw", &"[REDACTED]")
            .field("size", &self.size)
            .finish()
    }
}
