use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{InokeyError, InokeyResult};

/// Top-level configuration (loaded from inokey.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InokeyConfig {
    pub log: LogConfig,
    pub keyring: KeyringConfig,
    pub derivation: DerivationConfig,
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyringConfig {
    /// Prefix tried first when building a lookup tag (default: "fscrypt:")
    pub primary_prefix: String,
    /// Filesystem-specific prefix tried when the primary lookup fails
    pub alternate_prefix: Option<String>,
    /// Keyring entry type master keys must carry (default: "logon")
    pub key_type: String,
}

/// Which key derivation backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeriverBackend {
    /// AES-128-ECB in software
    #[default]
    Software,
    /// Offload to a secure-extension derivation engine
    SecureExtension,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DerivationConfig {
    pub backend: DeriverBackend,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Synthesize a default context (with a fixed test key) for inodes that
    /// have none
    pub dummy_context: bool,
    /// Report inline hardware encryption as available
    pub hardware_crypto: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for KeyringConfig {
    fn default() -> Self {
        Self {
            primary_prefix: "fscrypt:".into(),
            alternate_prefix: None,
            key_type: "logon".into(),
        }
    }
}

impl InokeyConfig {
    /// Load from `path`, falling back to defaults when the file is missing.
    pub fn load(path: &Path) -> InokeyResult<Self> {
        if !path.exists() {
            tracing::warn!("config file not found: {}  (using defaults)", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| InokeyError::Config(format!("parsing {}: {e}", path.display())))
    }
}
