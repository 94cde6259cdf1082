//! Per-inode crypto state and its single-publish cache.
//!
//! Each [`Inode`] has one slot. [`KeyInfo::get_encryption_info`] builds a
//! candidate [`CryptInfo`] without holding any lock, then publishes it only
//! if the slot is still empty; a caller that loses the race releases its
//! candidate (key zeroed, transform freed) before the call returns.
//! [`KeyInfo::put_encryption_info`] clears the slot only if it still holds
//! the state being released, and releases it on the spot: readers that kept
//! a handle see a released state, never a usable second key.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use inokey_core::config::InokeyConfig;
use inokey_core::types::CONTENTS_KEY_SIZE;
use inokey_core::{EncryptionMode, InodeKind, KeyDescriptor};
use zeroize::Zeroize;

use crate::context::{resolve_context, CryptOps};
use crate::derive::{build_deriver, DerivationEngine, DerivedKey, KeyDeriver, SoftwareDeriver};
use crate::error::KeyInfoError;
use crate::keyring::{Keyring, MasterKeyResolver};
use crate::transform::{
    bind, determine_cipher, CipherTransform, HwCrypto, SoftwareTransforms, StaticHwCrypto,
    TransformProvider,
};

/// Fill byte of the fixed key used in dummy-context mode.
pub const DUMMY_KEY_BYTE: u8 = 0x42;

struct KeyMaterial {
    key: DerivedKey,
    transform: Option<Box<dyn CipherTransform>>,
    released: bool,
}

/// Crypto state of one inode: modes, key, and the keyed transform.
///
/// The modes never change once published. The key and transform live until
/// the state is released, either explicitly or when the last handle drops.
pub struct CryptInfo {
    ino: u64,
    contents_mode: EncryptionMode,
    filenames_mode: EncryptionMode,
    flags: u8,
    descriptor: KeyDescriptor,
    material: Mutex<KeyMaterial>,
}

impl CryptInfo {
    pub fn contents_mode(&self) -> EncryptionMode {
        self.contents_mode
    }

    pub fn filenames_mode(&self) -> EncryptionMode {
        self.filenames_mode
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn descriptor(&self) -> &KeyDescriptor {
        &self.descriptor
    }

    /// Whether the key has been zeroed and the transform freed.
    pub fn is_released(&self) -> bool {
        self.material().released
    }

    /// Run `f` against the transform. `None` for hardware-backed contents
    /// and once the state is released.
    pub fn with_transform<R>(&self, f: impl FnOnce(&dyn CipherTransform) -> R) -> Option<R> {
        self.material().transform.as_deref().map(f)
    }

    #[cfg(test)]
    pub(crate) fn raw_key(&self) -> [u8; CONTENTS_KEY_SIZE] {
        *self.material().key.as_bytes()
    }

    fn material(&self) -> MutexGuard<'_, KeyMaterial> {
        self.material.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Zero the key, then free the transform. Idempotent.
    pub(crate) fn release(&self) {
        let mut material = self.material();
        if material.released {
            return;
        }
        material.key.zeroize();
        material.transform = None;
        material.released = true;
        tracing::trace!(ino = self.ino, "released crypto state");
    }
}

impl Drop for CryptInfo {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for CryptInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptInfo")
            .field("ino", &self.ino)
            .field("contents_mode", &self.contents_mode)
            .field("filenames_mode", &self.filenames_mode)
            .field("flags", &self.flags)
            .field("descriptor", &self.descriptor)
            .field("key", &"[REDACTED]")
            .field("released", &self.is_released())
            .finish()
    }
}

/// The part of an inode key setup cares about.
#[derive(Debug)]
pub struct Inode {
    ino: u64,
    kind: InodeKind,
    crypt_info: Mutex<Option<Arc<CryptInfo>>>,
}

impl Inode {
    pub fn new(ino: u64, kind: InodeKind) -> Self {
        Self {
            ino,
            kind,
            crypt_info: Mutex::new(None),
        }
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn kind(&self) -> InodeKind {
        self.kind
    }

    /// The published crypto state, if any. A handle kept across
    /// [`KeyInfo::put_encryption_info`] reports itself released.
    pub fn crypt_info(&self) -> Option<Arc<CryptInfo>> {
        self.slot().clone()
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<CryptInfo>>> {
        self.crypt_info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `candidate` if the slot is empty; hand it back otherwise.
    pub(crate) fn publish(&self, candidate: Arc<CryptInfo>) -> Result<(), Arc<CryptInfo>> {
        let mut slot = self.slot();
        if slot.is_some() {
            return Err(candidate);
        }
        *slot = Some(candidate);
        Ok(())
    }

    /// Empty the slot if it still holds `target`.
    pub(crate) fn clear_if(&self, target: &Arc<CryptInfo>) -> Option<Arc<CryptInfo>> {
        let mut slot = self.slot();
        match slot.as_ref() {
            Some(current) if Arc::ptr_eq(current, target) => slot.take(),
            _ => None,
        }
    }
}

/// Key setup for one filesystem: its hooks plus the keyring, derivation,
/// transform and hardware collaborators.
pub struct KeyInfo {
    fs: Arc<dyn CryptOps>,
    keyring: Arc<dyn Keyring>,
    deriver: Arc<dyn KeyDeriver>,
    transforms: Arc<dyn TransformProvider>,
    hw: Arc<dyn HwCrypto>,
    primary_prefix: String,
    key_type: String,
}

impl KeyInfo {
    /// Software derivation and transforms, no inline hardware, `fscrypt:`
    /// logon keys.
    pub fn new(fs: Arc<dyn CryptOps>, keyring: Arc<dyn Keyring>) -> Self {
        Self {
            fs,
            keyring,
            deriver: Arc::new(SoftwareDeriver),
            transforms: Arc::new(SoftwareTransforms),
            hw: Arc::new(StaticHwCrypto(false)),
            primary_prefix: "fscrypt:".into(),
            key_type: "logon".into(),
        }
    }

    /// Build from config. `engine` is required when the config selects the
    /// secure-extension deriver.
    pub fn from_config(
        config: &InokeyConfig,
        fs: Arc<dyn CryptOps>,
        keyring: Arc<dyn Keyring>,
        engine: Option<Arc<dyn DerivationEngine>>,
    ) -> Result<Self, KeyInfoError> {
        let deriver = build_deriver(config.derivation.backend, engine)?;
        Ok(Self {
            deriver,
            hw: Arc::new(StaticHwCrypto(config.policy.hardware_crypto)),
            primary_prefix: config.keyring.primary_prefix.clone(),
            key_type: config.keyring.key_type.clone(),
            ..Self::new(fs, keyring)
        })
    }

    pub fn with_deriver(mut self, deriver: Arc<dyn KeyDeriver>) -> Self {
        self.deriver = deriver;
        self
    }

    pub fn with_transforms(mut self, transforms: Arc<dyn TransformProvider>) -> Self {
        self.transforms = transforms;
        self
    }

    pub fn with_hw_crypto(mut self, hw: Arc<dyn HwCrypto>) -> Self {
        self.hw = hw;
        self
    }

    pub fn deriver(&self) -> &dyn KeyDeriver {
        &*self.deriver
    }

    /// Make sure `inode` has its crypto state. A missing master key is not an
    /// error here: the inode stays keyless and encrypted I/O fails later.
    pub fn get_encryption_info(&self, inode: &Inode) -> Result<(), KeyInfoError> {
        if inode.crypt_info().is_some() {
            return Ok(());
        }

        let candidate = match self.build_crypt_info(inode) {
            Ok(info) => Arc::new(info),
            Err(e) if e.is_soft() => {
                tracing::debug!(ino = inode.ino(), error = %e, "no master key, deferring");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        publish_or_release(inode, candidate);
        Ok(())
    }

    /// Release `state` (or whatever is published) from `inode`. A state that
    /// was already superseded leaves the slot untouched.
    pub fn put_encryption_info(&self, inode: &Inode, state: Option<Arc<CryptInfo>>) {
        let Some(target) = state.or_else(|| inode.crypt_info()) else {
            return;
        };

        if let Some(released) = inode.clear_if(&target) {
            released.release();
        }
    }

    /// Regular file whose contents go through the inline hardware engine.
    pub fn is_hardware_encrypted(&self, inode: &Inode) -> bool {
        inode.kind() == InodeKind::Regular
            && inode
                .slot()
                .as_ref()
                .is_some_and(|ci| ci.contents_mode == EncryptionMode::Private)
    }

    fn build_crypt_info(&self, inode: &Inode) -> Result<CryptInfo, KeyInfoError> {
        let ctx = resolve_context(&*self.fs, &*self.hw, inode)?;
        let choice = determine_cipher(
            inode.ino(),
            inode.kind(),
            ctx.contents_mode,
            ctx.filenames_mode,
        )?;

        let key = if self.fs.dummy_context_enabled() {
            DerivedKey::from_bytes([DUMMY_KEY_BYTE; CONTENTS_KEY_SIZE])
        } else {
            let alternate = self.fs.key_prefix();
            MasterKeyResolver {
                keyring: &*self.keyring,
                deriver: &*self.deriver,
                key_type: &self.key_type,
                primary_prefix: &self.primary_prefix,
            }
            .resolve(&ctx.descriptor, &ctx.nonce, alternate.as_deref())?
        };

        let transform = bind(inode.ino(), choice, &key, &*self.transforms, &*self.hw)?;

        tracing::debug!(
            ino = inode.ino(),
            contents = %ctx.contents_mode,
            filenames = %ctx.filenames_mode,
            descriptor = %ctx.descriptor,
            "built crypto state"
        );
        Ok(CryptInfo {
            ino: inode.ino(),
            contents_mode: ctx.contents_mode,
            filenames_mode: ctx.filenames_mode,
            flags: ctx.flags,
            descriptor: ctx.descriptor,
            material: Mutex::new(KeyMaterial {
                key,
                transform,
                released: false,
            }),
        })
    }
}

/// Publish `candidate`, or release it at once if another caller got there
/// first.
fn publish_or_release(inode: &Inode, candidate: Arc<CryptInfo>) {
    if let Err(loser) = inode.publish(candidate) {
        tracing::trace!(ino = inode.ino(), "lost publish race, discarding candidate");
        loser.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextFetchError;
    use crate::keyring::{key_tag, MemoryKeyring};
    use crate::transform::{CipherSuite, TransformFlags};
    use inokey_core::config::DeriverBackend;
    use inokey_core::types::{CONTEXT_FORMAT_V1, NONCE_SIZE};
    use inokey_core::{EncryptionContext, MasterKeyPayload};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DESC: KeyDescriptor = KeyDescriptor([0xa0, 0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7]);

    struct Fs {
        context: Option<EncryptionContext>,
        dummy: bool,
    }

    impl CryptOps for Fs {
        fn get_context(&self, _inode: &Inode) -> Result<Vec<u8>, ContextFetchError> {
            self.context
                .as_ref()
                .map(|c| c.to_bytes().to_vec())
                .ok_or(ContextFetchError::Absent)
        }

        fn dummy_context_enabled(&self) -> bool {
            self.dummy
        }
    }

    struct CountingDeriver(AtomicUsize);

    impl KeyDeriver for CountingDeriver {
        fn backend(&self) -> DeriverBackend {
            DeriverBackend::Software
        }

        fn derive(
            &self,
            deriving_key: &[u8; NONCE_SIZE],
            source: &[u8; CONTENTS_KEY_SIZE],
        ) -> Result<DerivedKey, KeyInfoError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            SoftwareDeriver.derive(deriving_key, source)
        }
    }

    fn context(contents_mode: EncryptionMode) -> EncryptionContext {
        EncryptionContext {
            format: CONTEXT_FORMAT_V1,
            contents_mode,
            filenames_mode: EncryptionMode::AesCts,
            flags: 0x01,
            descriptor: DESC,
            nonce: [0x3c; NONCE_SIZE],
        }
    }

    fn keyring_with_key() -> Arc<MemoryKeyring> {
        let keyring = Arc::new(MemoryKeyring::new());
        keyring.add_master_key(
            "logon",
            &key_tag("fscrypt:", &DESC),
            &MasterKeyPayload::new(0, &[0x77; 32]),
        );
        keyring
    }

    fn key_info(contents_mode: EncryptionMode) -> KeyInfo {
        KeyInfo::new(
            Arc::new(Fs {
                context: Some(context(contents_mode)),
                dummy: false,
            }),
            keyring_with_key(),
        )
    }

    #[test]
    fn test_get_publishes_state() {
        let ki = key_info(EncryptionMode::AesXts);
        let inode = Inode::new(5, InodeKind::Regular);

        ki.get_encryption_info(&inode).unwrap();
        let ci = inode.crypt_info().unwrap();
        assert_eq!(ci.contents_mode(), EncryptionMode::AesXts);
        assert_eq!(ci.filenames_mode(), EncryptionMode::AesCts);
        assert_eq!(ci.flags(), 0x01);
        assert_eq!(ci.descriptor(), &DESC);
        assert_eq!(
            &ci.raw_key(),
            SoftwareDeriver
                .derive(&[0x3c; NONCE_SIZE], &[0x77; 32])
                .unwrap()
                .as_bytes()
        );

        let (suite, flags) = ci.with_transform(|t| (t.suite(), t.flags())).unwrap();
        assert_eq!(suite, CipherSuite::AesXts);
        assert_eq!(flags, TransformFlags::WEAK_KEY);
        assert!(!ci.is_released());
        assert!(!ki.is_hardware_encrypted(&inode));
    }

    #[test]
    fn test_second_get_is_noop() {
        let deriver = Arc::new(CountingDeriver(AtomicUsize::new(0)));
        let ki = key_info(EncryptionMode::AesXts).with_deriver(deriver.clone());
        let inode = Inode::new(5, InodeKind::Regular);

        ki.get_encryption_info(&inode).unwrap();
        let first = inode.crypt_info().unwrap();
        ki.get_encryption_info(&inode).unwrap();
        let second = inode.crypt_info().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(deriver.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_publish_is_first_writer_wins() {
        let ki = key_info(EncryptionMode::AesXts);
        let inode = Inode::new(5, InodeKind::Regular);
        let a = Arc::new(ki.build_crypt_info(&inode).unwrap());
        let b = Arc::new(ki.build_crypt_info(&inode).unwrap());

        assert!(inode.publish(a.clone()).is_ok());
        let loser = inode.publish(b.clone()).unwrap_err();
        assert!(Arc::ptr_eq(&loser, &b));
        assert!(Arc::ptr_eq(&inode.crypt_info().unwrap(), &a));
    }

    #[test]
    fn test_losing_candidate_is_released() {
        let ki = key_info(EncryptionMode::AesXts);
        let inode = Inode::new(5, InodeKind::Regular);
        let winner = Arc::new(ki.build_crypt_info(&inode).unwrap());
        let loser = Arc::new(ki.build_crypt_info(&inode).unwrap());
        assert!(loser.raw_key().iter().any(|b| *b != 0));

        publish_or_release(&inode, winner.clone());
        publish_or_release(&inode, loser.clone());

        assert!(Arc::ptr_eq(&inode.crypt_info().unwrap(), &winner));
        assert!(!winner.is_released());
        assert!(loser.is_released());
        assert_eq!(loser.raw_key(), [0u8; CONTENTS_KEY_SIZE]);
        assert!(loser.with_transform(|_| ()).is_none());
    }

    #[test]
    fn test_put_zeroes_key_held_by_reader() {
        let ki = key_info(EncryptionMode::AesXts);
        let inode = Inode::new(5, InodeKind::Regular);
        ki.get_encryption_info(&inode).unwrap();

        let reader = inode.crypt_info().unwrap();
        assert!(reader.raw_key().iter().any(|b| *b != 0));

        ki.put_encryption_info(&inode, None);
        assert!(inode.crypt_info().is_none());
        assert!(reader.is_released());
        assert_eq!(reader.raw_key(), [0u8; CONTENTS_KEY_SIZE]);
        assert!(reader.with_transform(|_| ()).is_none());

        ki.get_encryption_info(&inode).unwrap();
        let current = inode.crypt_info().unwrap();
        assert!(!Arc::ptr_eq(&reader, &current));
        assert!(!current.is_released());
    }

    #[test]
    fn test_put_clears_slot() {
        let ki = key_info(EncryptionMode::AesXts);
        let inode = Inode::new(5, InodeKind::Regular);
        ki.get_encryption_info(&inode).unwrap();

        ki.put_encryption_info(&inode, None);
        assert!(inode.crypt_info().is_none());

        // Nothing published: no-op.
        ki.put_encryption_info(&inode, None);
        assert!(inode.crypt_info().is_none());
    }

    #[test]
    fn test_put_superseded_state_keeps_current() {
        let ki = key_info(EncryptionMode::AesXts);
        let inode = Inode::new(5, InodeKind::Regular);
        ki.get_encryption_info(&inode).unwrap();
        let old = inode.crypt_info().unwrap();

        ki.put_encryption_info(&inode, Some(old.clone()));
        ki.get_encryption_info(&inode).unwrap();
        let current = inode.crypt_info().unwrap();
        assert!(!Arc::ptr_eq(&old, &current));

        ki.put_encryption_info(&inode, Some(old));
        assert!(Arc::ptr_eq(&inode.crypt_info().unwrap(), &current));
        assert!(!current.is_released());
    }

    #[test]
    fn test_missing_key_defers() {
        let ki = KeyInfo::new(
            Arc::new(Fs {
                context: Some(context(EncryptionMode::AesXts)),
                dummy: false,
            }),
            Arc::new(MemoryKeyring::new()),
        );
        let inode = Inode::new(5, InodeKind::Regular);

        ki.get_encryption_info(&inode).unwrap();
        assert!(inode.crypt_info().is_none());
        assert!(!ki.is_hardware_encrypted(&inode));
    }

    #[test]
    fn test_hardware_mode() {
        let inode = Inode::new(5, InodeKind::Regular);

        let ki = key_info(EncryptionMode::Private);
        let err = ki.get_encryption_info(&inode).unwrap_err();
        assert!(matches!(err, KeyInfoError::Configuration(_)));
        assert!(inode.crypt_info().is_none());

        let ki = key_info(EncryptionMode::Private).with_hw_crypto(Arc::new(StaticHwCrypto(true)));
        ki.get_encryption_info(&inode).unwrap();
        assert!(inode.crypt_info().unwrap().with_transform(|_| ()).is_none());
        assert!(ki.is_hardware_encrypted(&inode));
    }

    #[test]
    fn test_directory_gets_filename_transform() {
        let ki = key_info(EncryptionMode::Private);
        let inode = Inode::new(6, InodeKind::Directory);

        ki.get_encryption_info(&inode).unwrap();
        let ci = inode.crypt_info().unwrap();
        assert_eq!(ci.with_transform(|t| t.suite()), Some(CipherSuite::AesCbcCts));
        assert!(!ki.is_hardware_encrypted(&inode));
    }

    #[test]
    fn test_unsupported_kind_publishes_nothing() {
        let ki = key_info(EncryptionMode::AesXts);
        let inode = Inode::new(7, InodeKind::Special);
        let err = ki.get_encryption_info(&inode).unwrap_err();
        assert!(matches!(err, KeyInfoError::UnsupportedMode { ino: 7, .. }));
        assert!(inode.crypt_info().is_none());
    }

    #[test]
    fn test_dummy_context_uses_fixed_key() {
        let deriver = Arc::new(CountingDeriver(AtomicUsize::new(0)));
        let ki = KeyInfo::new(
            Arc::new(Fs {
                context: None,
                dummy: true,
            }),
            Arc::new(MemoryKeyring::new()),
        )
        .with_deriver(deriver.clone());
        let inode = Inode::new(8, InodeKind::Regular);

        ki.get_encryption_info(&inode).unwrap();
        let ci = inode.crypt_info().unwrap();
        assert_eq!(ci.contents_mode(), EncryptionMode::AesXts);
        assert_eq!(ci.flags(), 0);
        assert_eq!(ci.raw_key(), [DUMMY_KEY_BYTE; 32]);
        assert_eq!(deriver.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_from_config() {
        let mut config = InokeyConfig::default();
        config.keyring.primary_prefix = "vendor:".into();
        config.policy.hardware_crypto = true;

        let fs = Arc::new(Fs {
            context: Some(context(EncryptionMode::Private)),
            dummy: false,
        });
        let keyring = Arc::new(MemoryKeyring::new());
        keyring.add_master_key(
            "logon",
            &key_tag("vendor:", &DESC),
            &MasterKeyPayload::new(0, &[0x77; 32]),
        );

        let ki = KeyInfo::from_config(&config, fs, keyring, None).unwrap();
        assert_eq!(ki.deriver().backend(), DeriverBackend::Software);

        let inode = Inode::new(9, InodeKind::Regular);
        ki.get_encryption_info(&inode).unwrap();
        assert!(ki.is_hardware_encrypted(&inode));
    }

    #[test]
    fn test_from_config_secure_extension_needs_engine() {
        let mut config = InokeyConfig::default();
        config.derivation.backend = DeriverBackend::SecureExtension;
        let fs = Arc::new(Fs {
            context: None,
            dummy: false,
        });

        let err = KeyInfo::from_config(&config, fs, Arc::new(MemoryKeyring::new()), None)
            .err()
            .unwrap();
        assert!(matches!(err, KeyInfoError::Configuration(_)));
    }
}
