//! Master key lookup.
//!
//! Master keys live in a keyring under `<prefix><descriptor hex>`, e.g.
//! `fscrypt:0011223344556677`. The primary prefix is tried first; when that
//! fails and the filesystem names its own prefix, the lookup is repeated with
//! it, and the outcome of that second attempt is final: its key, its
//! structural error, or its not-found (which defers setup).

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use inokey_core::types::{CONTENTS_KEY_SIZE, NONCE_SIZE};
use inokey_core::{KeyDescriptor, MasterKeyPayload};
use zeroize::Zeroizing;

use crate::derive::{DerivedKey, KeyDeriver};
use crate::error::KeyInfoError;

/// A keyring service holding master keys.
pub trait Keyring: Send + Sync {
    fn lookup(&self, description: &str) -> Option<Arc<KeyringEntry>>;
}

/// One keyring entry. The payload can be revoked at any time, so readers
/// take the entry's read lock for as long as they use it.
#[derive(Debug)]
pub struct KeyringEntry {
    key_type: String,
    description: String,
    payload: RwLock<Option<Zeroizing<Vec<u8>>>>,
}

impl KeyringEntry {
    pub fn new(key_type: &str, description: &str, payload: Vec<u8>) -> Self {
        Self {
            key_type: key_type.to_string(),
            description: description.to_string(),
            payload: RwLock::new(Some(Zeroizing::new(payload))),
        }
    }

    pub fn key_type(&self) -> &str {
        &self.key_type
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Shared access to the payload; `None` once revoked.
    pub fn read_payload(&self) -> RwLockReadGuard<'_, Option<Zeroizing<Vec<u8>>>> {
        self.payload.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the payload. Readers already holding the lock finish first.
    pub fn revoke(&self) {
        let mut payload = self.payload.write().unwrap_or_else(PoisonError::into_inner);
        *payload = None;
        tracing::debug!(key = %self.description, "revoked keyring entry");
    }
}

/// In-process keyring.
#[derive(Debug, Default)]
pub struct MemoryKeyring {
    entries: RwLock<HashMap<String, Arc<KeyringEntry>>>,
}

impl MemoryKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: KeyringEntry) -> Arc<KeyringEntry> {
        let entry = Arc::new(entry);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.description.clone(), Arc::clone(&entry));
        entry
    }

    /// Store `payload` as a master key of `key_type` under `description`.
    pub fn add_master_key(
        &self,
        key_type: &str,
        description: &str,
        payload: &MasterKeyPayload,
    ) -> Arc<KeyringEntry> {
        self.insert(KeyringEntry::new(key_type, description, payload.encode()))
    }

    pub fn remove(&self, description: &str) -> Option<Arc<KeyringEntry>> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(description)
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Keyring for MemoryKeyring {
    fn lookup(&self, description: &str) -> Option<Arc<KeyringEntry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(description)
            .cloned()
    }
}

/// Keyring description for `descriptor` under `prefix`.
pub fn key_tag(prefix: &str, descriptor: &KeyDescriptor) -> String {
    format!("{prefix}{}", descriptor.to_hex())
}

/// Finds master keys and turns them into per-file keys.
pub(crate) struct MasterKeyResolver<'a> {
    pub keyring: &'a dyn Keyring,
    pub deriver: &'a dyn KeyDeriver,
    pub key_type: &'a str,
    pub primary_prefix: &'a str,
}

impl MasterKeyResolver<'_> {
    /// Derive the file key for `descriptor`/`nonce`, falling back to
    /// `alternate_prefix` when the primary lookup fails.
    pub fn resolve(
        &self,
        descriptor: &KeyDescriptor,
        nonce: &[u8; NONCE_SIZE],
        alternate_prefix: Option<&str>,
    ) -> Result<DerivedKey, KeyInfoError> {
        let primary = match self.try_prefix(self.primary_prefix, descriptor, nonce) {
            Ok(key) => return Ok(key),
            Err(e) => e,
        };

        let Some(prefix) = alternate_prefix else {
            return Err(primary);
        };

        tracing::debug!(
            descriptor = %descriptor,
            primary_error = %primary,
            prefix,
            "retrying master key lookup with filesystem prefix"
        );
        self.try_prefix(prefix, descriptor, nonce)
    }

    fn try_prefix(
        &self,
        prefix: &str,
        descriptor: &KeyDescriptor,
        nonce: &[u8; NONCE_SIZE],
    ) -> Result<DerivedKey, KeyInfoError> {
        let tag = key_tag(prefix, descriptor);

        let entry = self
            .keyring
            .lookup(&tag)
            .ok_or_else(|| KeyInfoError::KeyNotFound { tag: tag.clone() })?;

        if entry.key_type() != self.key_type {
            tracing::warn!(
                key = %tag,
                key_type = entry.key_type(),
                expected = self.key_type,
                "keyring entry has the wrong type"
            );
            return Err(KeyInfoError::KeyNotFound { tag });
        }

        // Read lock is held only while the payload is copied out.
        let payload = {
            let guard = entry.read_payload();
            let Some(bytes) = guard.as_ref() else {
                return Err(KeyInfoError::KeyInvalid {
                    tag,
                    reason: "key was revoked".into(),
                });
            };
            MasterKeyPayload::parse(bytes).map_err(|e| KeyInfoError::KeyInvalid {
                tag: tag.clone(),
                reason: e.to_string(),
            })?
        };
        let master: &[u8; CONTENTS_KEY_SIZE] = payload.contents_key().map_err(|e| {
            tracing::warn!(key = %tag, size = payload.size, "master key size incorrect");
            KeyInfoError::KeyInvalid {
                tag: tag.clone(),
                reason: e.to_string(),
            }
        })?;

        self.deriver.derive(nonce, master)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive::SoftwareDeriver;

    const DESC: KeyDescriptor = KeyDescriptor([0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef]);
    const NONCE: [u8; NONCE_SIZE] = [0x11; NONCE_SIZE];

    fn resolve(
        keyring: &MemoryKeyring,
        alternate: Option<&str>,
    ) -> Result<DerivedKey, KeyInfoError> {
        MasterKeyResolver {
            keyring,
            deriver: &SoftwareDeriver,
            key_type: "logon",
            primary_prefix: "fscrypt:",
        }
        .resolve(&DESC, &NONCE, alternate)
    }

    fn add(keyring: &MemoryKeyring, prefix: &str, key: &[u8]) {
        keyring.add_master_key(
            "logon",
            &key_tag(prefix, &DESC),
            &MasterKeyPayload::new(0, key),
        );
    }

    fn add_short_payload(keyring: &MemoryKeyring, prefix: &str) {
        let mut bytes = MasterKeyPayload::new(0, &[0x44; 32]).encode();
        bytes.pop();
        keyring.insert(KeyringEntry::new("logon", &key_tag(prefix, &DESC), bytes));
    }

    fn expected(master: &[u8; 32]) -> DerivedKey {
        SoftwareDeriver.derive(&NONCE, master).unwrap()
    }

    #[test]
    fn test_key_tag() {
        assert_eq!(key_tag("fscrypt:", &DESC), "fscrypt:0123456789abcdef");
        assert_eq!(key_tag("ext4:", &DESC), "ext4:0123456789abcdef");
    }

    #[test]
    fn test_primary_hit() {
        let keyring = MemoryKeyring::new();
        add(&keyring, "fscrypt:", &[0x44; 32]);
        add(&keyring, "ext4:", &[0x55; 32]);

        let key = resolve(&keyring, Some("ext4:")).unwrap();
        assert_eq!(key.as_bytes(), expected(&[0x44; 32]).as_bytes());
    }

    #[test]
    fn test_alternate_hit() {
        let keyring = MemoryKeyring::new();
        add(&keyring, "ext4:", &[0x55; 32]);

        let key = resolve(&keyring, Some("ext4:")).unwrap();
        assert_eq!(key.as_bytes(), expected(&[0x55; 32]).as_bytes());
    }

    #[test]
    fn test_missing_everywhere_is_soft() {
        let keyring = MemoryKeyring::new();
        let err = resolve(&keyring, Some("ext4:")).unwrap_err();
        assert!(err.is_soft());
        assert!(matches!(err, KeyInfoError::KeyNotFound { tag } if tag == "ext4:0123456789abcdef"));
    }

    #[test]
    fn test_missing_without_alternate() {
        let keyring = MemoryKeyring::new();
        let err = resolve(&keyring, None).unwrap_err();
        assert!(matches!(err, KeyInfoError::KeyNotFound { tag } if tag == "fscrypt:0123456789abcdef"));
    }

    #[test]
    fn test_alternate_invalid_overrides_primary_not_found() {
        let keyring = MemoryKeyring::new();
        add_short_payload(&keyring, "ext4:");

        let err = resolve(&keyring, Some("ext4:")).unwrap_err();
        assert!(matches!(err, KeyInfoError::KeyInvalid { tag, .. } if tag.starts_with("ext4:")));
    }

    #[test]
    fn test_alternate_invalid_overrides_primary_invalid() {
        let keyring = MemoryKeyring::new();
        add(&keyring, "fscrypt:", &[0x44; 16]);
        add_short_payload(&keyring, "ext4:");

        let err = resolve(&keyring, Some("ext4:")).unwrap_err();
        assert!(matches!(err, KeyInfoError::KeyInvalid { tag, .. } if tag.starts_with("ext4:")));
    }

    #[test]
    fn test_alternate_not_found_overrides_primary_invalid() {
        let keyring = MemoryKeyring::new();
        add_short_payload(&keyring, "fscrypt:");

        let err = resolve(&keyring, Some("ext4:")).unwrap_err();
        assert!(err.is_soft());
        assert!(matches!(err, KeyInfoError::KeyNotFound { tag } if tag.starts_with("ext4:")));
    }

    #[test]
    fn test_primary_invalid_without_alternate() {
        let keyring = MemoryKeyring::new();
        add_short_payload(&keyring, "fscrypt:");

        let err = resolve(&keyring, None).unwrap_err();
        assert!(!err.is_soft());
        assert!(matches!(err, KeyInfoError::KeyInvalid { tag, .. } if tag.starts_with("fscrypt:")));
    }

    #[test]
    fn test_wrong_payload_length() {
        let keyring = MemoryKeyring::new();
        add_short_payload(&keyring, "fscrypt:");
        let err = resolve(&keyring, None).unwrap_err();
        assert!(matches!(err, KeyInfoError::KeyInvalid { reason, .. } if reason.contains("71")));
    }

    #[test]
    fn test_wrong_declared_size() {
        let keyring = MemoryKeyring::new();
        add(&keyring, "fscrypt:", &[0x44; 31]);
        let err = resolve(&keyring, None).unwrap_err();
        assert!(matches!(err, KeyInfoError::KeyInvalid { reason, .. } if reason.contains("31")));
    }

    #[test]
    fn test_wrong_type_is_not_found() {
        let keyring = MemoryKeyring::new();
        keyring.add_master_key(
            "user",
            &key_tag("fscrypt:", &DESC),
            &MasterKeyPayload::new(0, &[0x44; 32]),
        );
        let err = resolve(&keyring, None).unwrap_err();
        assert!(err.is_soft());
    }

    #[test]
    fn test_revoked_is_invalid() {
        let keyring = MemoryKeyring::new();
        add(&keyring, "fscrypt:", &[0x44; 32]);
        keyring
            .lookup(&key_tag("fscrypt:", &DESC))
            .unwrap()
            .revoke();

        let err = resolve(&keyring, None).unwrap_err();
        assert!(matches!(err, KeyInfoError::KeyInvalid { reason, .. } if reason.contains("revoked")));
    }
}
