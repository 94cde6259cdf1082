//! Keyring and context files used by the CLI in place of the kernel keyring
//! and xattrs.
//!
//! ```toml
//! [[key]]
//! description = "fscrypt:0123456789abcdef"
//! type = "logon"          # optional, default "logon"
//! mode = 0                # optional
//! key = "<64 hex chars>"
//! ```

use anyhow::{Context, Result};
use inokey_core::MasterKeyPayload;
use inokey_crypto::{ContextFetchError, CryptOps, Inode, MemoryKeyring};
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, Zeroizing};

#[derive(Debug, Deserialize)]
struct KeyringFile {
    #[serde(default)]
    key: Vec<KeyEntry>,
}

#[derive(Deserialize)]
struct KeyEntry {
    description: String,
    #[serde(rename = "type", default = "default_key_type")]
    key_type: String,
    #[serde(default)]
    mode: u32,
    key: String,
}

impl Drop for KeyEntry {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyEntry")
            .field("description", &self.description)
            .field("key_type", &self.key_type)
            .field("mode", &self.mode)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

fn default_key_type() -> String {
    "logon".into()
}

/// Load every `[[key]]` entry of a keyring file into memory.
pub fn load_keyring(path: &Path) -> Result<MemoryKeyring> {
    let content = Zeroizing::new(
        std::fs::read_to_string(path)
            .with_context(|| format!("reading keyring file: {}", path.display()))?,
    );
    let file: KeyringFile = toml::from_str(&content)
        .with_context(|| format!("parsing keyring file: {}", path.display()))?;

    let keyring = MemoryKeyring::new();
    for entry in &file.key {
        let raw = Zeroizing::new(
            hex::decode(&entry.key)
                .with_context(|| format!("key hex for {}", entry.description))?,
        );
        let payload = MasterKeyPayload::new(entry.mode, &raw);
        keyring.add_master_key(&entry.key_type, &entry.description, &payload);
        tracing::debug!(key = %entry.description, key_type = %entry.key_type, "loaded key");
    }
    Ok(keyring)
}

/// Context stored in a plain file instead of an xattr.
#[derive(Debug)]
pub struct FileContext {
    pub path: PathBuf,
    pub alternate_prefix: Option<String>,
    pub dummy: bool,
}

impl CryptOps for FileContext {
    fn get_context(&self, _inode: &Inode) -> Result<Vec<u8>, ContextFetchError> {
        std::fs::read(&self.path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => ContextFetchError::Absent,
            _ => ContextFetchError::Failed(format!("{}: {e}", self.path.display())),
        })
    }

    fn key_prefix(&self) -> Option<String> {
        self.alternate_prefix.clone()
    }

    fn dummy_context_enabled(&self) -> bool {
        self.dummy
    }
}
