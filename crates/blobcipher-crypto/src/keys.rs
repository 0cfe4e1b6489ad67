//! Cipher keys: one derived AES-256 key per (domain, base cipher id, salt)

use std::sync::{PoisonError, RwLock, RwLockReadGuard, TryLockError};

use blobcipher_core::types::{
    BaseCipherId, EncryptDomainId, RandomSalt, AES_256_KEY_LENGTH, KEY_TIMESTAMP_INFINITE,
    MAX_BASE_CIPHER_LEN,
};
use blobcipher_core::{CipherError, CipherResult};
use zeroize::Zeroize;

use crate::kdf::derive_cipher_key;

/// Secret bytes of a cipher key. Zeroized on drop and on [`CipherKey::reset`].
struct KeyMaterial {
    base_cipher: [u8; MAX_BASE_CIPHER_LEN],
    derived: [u8; AES_256_KEY_LENGTH],
    scrubbed: bool,
}

impl KeyMaterial {
    fn scrub(&mut self) {
        self.base_cipher.zeroize();
        self.derived.zeroize();
        self.scrubbed = true;
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.base_cipher.zeroize();
        self.derived.zeroize();
    }
}

/// A derived symmetric key plus the identity needed to re-derive it.
///
/// Immutable after construction except for [`reset`](Self::reset), which
/// scrubs the secret bytes in place during cache teardown. Handles are shared
/// as `Arc<CipherKey>`, so a key outlives any in-flight encrypt/decrypt even
/// when it is evicted from the cache concurrently.
pub struct CipherKey {
    domain_id: EncryptDomainId,
    base_cipher_id: BaseCipherId,
    base_cipher_len: usize,
    salt: RandomSalt,
    refresh_at: i64,
    expire_at: i64,
    material: RwLock<KeyMaterial>,
}

impl CipherKey {
    /// Derive a key from `base_cipher` (at most 32 bytes, zero-padded) and `salt`.
    pub fn derive(
        domain_id: EncryptDomainId,
        base_cipher_id: BaseCipherId,
        base_cipher: &[u8],
        salt: RandomSalt,
        refresh_at: i64,
        expire_at: i64,
    ) -> CipherResult<Self> {
        if base_cipher.is_empty() || base_cipher.len() > MAX_BASE_CIPHER_LEN {
            return Err(CipherError::InvalidBaseCipherLength(base_cipher.len()));
        }
        if refresh_at != KEY_TIMESTAMP_INFINITE && refresh_at > expire_at {
            return Err(CipherError::InvalidKeyTimestamps {
                refresh_at,
                expire_at,
            });
        }

        let derived = derive_cipher_key(base_cipher, salt)?;

        let mut material = KeyMaterial {
            base_cipher: [0u8; MAX_BASE_CIPHER_LEN],
            derived: *derived,
            scrubbed: false,
        };
        material.base_cipher[..base_cipher.len()].copy_from_slice(base_cipher);

        Ok(Self {
            domain_id,
            base_cipher_id,
            base_cipher_len: base_cipher.len(),
            salt,
            refresh_at,
            expire_at,
            material: RwLock::new(material),
        })
    }

    pub fn domain_id(&self) -> EncryptDomainId {
        self.domain_id
    }

    pub fn base_cipher_id(&self) -> BaseCipherId {
        self.base_cipher_id
    }

    pub fn base_cipher_len(&self) -> usize {
        self.base_cipher_len
    }

    pub fn salt(&self) -> RandomSalt {
        self.salt
    }

    pub fn refresh_at(&self) -> i64 {
        self.refresh_at
    }

    pub fn expire_at(&self) -> i64 {
        self.expire_at
    }

    /// Borrow the derived AES-256 key.
    ///
    /// The bytes never leave the key, so [`reset`](Self::reset) reaches every
    /// copy. After a reset `f` sees zeros.
    pub fn with_raw_cipher<R>(&self, f: impl FnOnce(&[u8; AES_256_KEY_LENGTH]) -> R) -> R {
        f(&self.material().derived)
    }

    /// Borrow the base cipher as registered (without padding).
    pub fn with_raw_base_cipher<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.material().base_cipher[..self.base_cipher_len])
    }

    /// Like [`with_raw_cipher`](Self::with_raw_cipher), but refuses a key
    /// that has been reset. Encrypt and decrypt go through here.
    pub fn with_live_cipher<R>(
        &self,
        f: impl FnOnce(&[u8; AES_256_KEY_LENGTH]) -> CipherResult<R>,
    ) -> CipherResult<R> {
        let material = self.material();
        if material.scrubbed {
            return Err(CipherError::EncryptOps(format!(
                "cipher key domain={} base_cipher_id={} salt={} was scrubbed",
                self.domain_id, self.base_cipher_id, self.salt
            )));
        }
        f(&material.derived)
    }

    /// True once [`reset`](Self::reset) has zeroed this key.
    pub fn is_scrubbed(&self) -> bool {
        self.material().scrubbed
    }

    pub fn needs_refresh(&self, now: i64) -> bool {
        self.refresh_at != KEY_TIMESTAMP_INFINITE && now >= self.refresh_at
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expire_at != KEY_TIMESTAMP_INFINITE && now >= self.expire_at
    }

    /// True when this key was derived from exactly `base_cipher` under `base_cipher_id`.
    pub fn matches_base(&self, base_cipher_id: BaseCipherId, base_cipher: &[u8]) -> bool {
        self.base_cipher_id == base_cipher_id
            && self.base_cipher_len == base_cipher.len()
            && self.material().base_cipher[..self.base_cipher_len] == *base_cipher
    }

    /// Overwrite the base and derived secrets with zeros in place.
    pub fn reset(&self) {
        self.material
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .scrub();
    }

    /// Non-blocking [`reset`](Self::reset). Returns false when the material
    /// is locked, e.g. by the current thread mid-encryption.
    pub fn try_reset(&self) -> bool {
        match self.material.try_write() {
            Ok(mut material) => material.scrub(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().scrub(),
            Err(TryLockError::WouldBlock) => return false,
        }
        true
    }

    fn material(&self) -> RwLockReadGuard<'_, KeyMaterial> {
        self.material.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PartialEq for CipherKey {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        if self.domain_id != other.domain_id
            || self.base_cipher_id != other.base_cipher_id
            || self.salt != other.salt
            || self.base_cipher_len != other.base_cipher_len
        {
            return false;
        }
        let (a, b) = (self.material(), other.material());
        a.derived == b.derived && a.base_cipher == b.base_cipher
    }
}

impl Eq for CipherKey {}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherKey")
            .field("domain_id", &self.domain_id)
            .field("base_cipher_id", &self.base_cipher_id)
            .field("salt", &self.salt)
            .field("refresh_at", &self.refresh_at)
            .field("expire_at", &self.expire_at)
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}
