//! Cipher key cache: domain id → per-domain index of (base cipher id, salt) → key.
//!
//! One `CipherKeyCache` is constructed per process and passed down to the
//! storage engine, backup, and blob-granule writers. Keys come from an external
//! key manager; the cache derives, deduplicates, and serves them, and scrubs
//! them on teardown.
//!
//! Lookups enforce two guarantees:
//! - freshness: `get_latest_cipher_key` withholds a key that needs refresh, so
//!   new data is never written under a stale key;
//! - liveness: `get_cipher_key` withholds an expired key.

use std::collections::HashMap;
use std::sync::{
    Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError, TryLockResult,
};

use blobcipher_core::config::CacheConfig;
use blobcipher_core::types::{
    BaseCipherId, EncryptDomainId, RandomSalt, ENCRYPT_HEADER_DOMAIN_ID,
    INVALID_ENCRYPT_CIPHER_KEY_ID, INVALID_ENCRYPT_DOMAIN_ID,
};
use blobcipher_core::{CipherError, CipherResult};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::keys::CipherKey;
use crate::metrics::CipherMetrics;
use crate::random::RandomSource;

type CacheKey = (BaseCipherId, RandomSalt);

#[derive(Default)]
struct DomainState {
    keys: HashMap<CacheKey, Arc<CipherKey>>,
    latest: Option<CacheKey>,
    /// Set by cleanup. A retired index accepts no more keys.
    retired: bool,
}

/// All cached keys of one encryption domain.
///
/// The key map and the latest pointer share one lock, so a reader never sees
/// a latest pointer to a key that is not yet in the map.
///
/// Once [`cleanup`](Self::cleanup) runs the index is retired: inserts fail
/// instead of landing in a map nobody will scrub again.
pub struct DomainKeyIndex {
    domain_id: EncryptDomainId,
    state: RwLock<DomainState>,
    random: Arc<RandomSource>,
}

impl DomainKeyIndex {
    pub fn new(domain_id: EncryptDomainId, random: Arc<RandomSource>) -> Self {
        Self {
            domain_id,
            state: RwLock::new(DomainState::default()),
            random,
        }
    }

    pub fn domain_id(&self) -> EncryptDomainId {
        self.domain_id
    }

    /// Register `base_cipher` as the domain's latest key under a fresh salt.
    ///
    /// Re-registering the current latest base cipher is a no-op that returns
    /// the existing key; registering different bytes under the latest base
    /// cipher id fails with `KeyUpdateNotPermitted`.
    pub fn insert_latest(
        &self,
        base_cipher_id: BaseCipherId,
        base_cipher: &[u8],
        refresh_at: i64,
        expire_at: i64,
    ) -> CipherResult<Arc<CipherKey>> {
        self.insert_latest_tracked(base_cipher_id, base_cipher, refresh_at, expire_at)?
            .map(|(key, _)| key)
            .ok_or_else(|| self.retired_error())
    }

    /// Register a key under a known salt, e.g. one read back from a header.
    /// Leaves the latest pointer untouched.
    pub fn insert_with_salt(
        &self,
        base_cipher_id: BaseCipherId,
        base_cipher: &[u8],
        salt: RandomSalt,
        refresh_at: i64,
        expire_at: i64,
    ) -> CipherResult<Arc<CipherKey>> {
        self.insert_with_salt_tracked(base_cipher_id, base_cipher, salt, refresh_at, expire_at)?
            .map(|(key, _)| key)
            .ok_or_else(|| self.retired_error())
    }

    /// `None` when the index is retired; otherwise the key and whether it is new.
    pub(crate) fn insert_latest_tracked(
        &self,
        base_cipher_id: BaseCipherId,
        base_cipher: &[u8],
        refresh_at: i64,
        expire_at: i64,
    ) -> CipherResult<Option<(Arc<CipherKey>, bool)>> {
        let mut state = self.write();
        if state.retired {
            return Ok(None);
        }

        if let Some(latest) = state.latest.and_then(|k| state.keys.get(&k)) {
            if latest.base_cipher_id() == base_cipher_id {
                if latest.matches_base(base_cipher_id, base_cipher) {
                    return Ok(Some((latest.clone(), false)));
                }
                warn!(
                    domain_id = self.domain_id,
                    base_cipher_id, "rejected update of latest base cipher"
                );
                return Err(CipherError::KeyUpdateNotPermitted {
                    domain_id: self.domain_id,
                    base_cipher_id,
                });
            }
        }

        let mut salt = self.random.next_salt();
        while state.keys.contains_key(&(base_cipher_id, salt)) {
            salt = self.random.next_salt();
        }

        let key = Arc::new(CipherKey::derive(
            self.domain_id,
            base_cipher_id,
            base_cipher,
            salt,
            refresh_at,
            expire_at,
        )?);
        state.keys.insert((base_cipher_id, salt), key.clone());
        state.latest = Some((base_cipher_id, salt));

        debug!(
            domain_id = self.domain_id,
            base_cipher_id, salt, "inserted latest cipher key"
        );
        Ok(Some((key, true)))
    }

    pub(crate) fn insert_with_salt_tracked(
        &self,
        base_cipher_id: BaseCipherId,
        base_cipher: &[u8],
        salt: RandomSalt,
        refresh_at: i64,
        expire_at: i64,
    ) -> CipherResult<Option<(Arc<CipherKey>, bool)>> {
        let mut state = self.write();
        if state.retired {
            return Ok(None);
        }

        if let Some(existing) = state.keys.get(&(base_cipher_id, salt)) {
            if existing.matches_base(base_cipher_id, base_cipher) {
                return Ok(Some((existing.clone(), false)));
            }
            warn!(
                domain_id = self.domain_id,
                base_cipher_id, salt, "rejected update of salted cipher key"
            );
            return Err(CipherError::KeyUpdateNotPermitted {
                domain_id: self.domain_id,
                base_cipher_id,
            });
        }

        let key = Arc::new(CipherKey::derive(
            self.domain_id,
            base_cipher_id,
            base_cipher,
            salt,
            refresh_at,
            expire_at,
        )?);
        state.keys.insert((base_cipher_id, salt), key.clone());

        debug!(
            domain_id = self.domain_id,
            base_cipher_id, salt, "inserted salted cipher key"
        );
        Ok(Some((key, true)))
    }

    pub fn latest(&self) -> Option<Arc<CipherKey>> {
        let state = self.read();
        state.latest.and_then(|k| state.keys.get(&k).cloned())
    }

    pub fn get(&self, base_cipher_id: BaseCipherId, salt: RandomSalt) -> Option<Arc<CipherKey>> {
        self.read().keys.get(&(base_cipher_id, salt)).cloned()
    }

    pub fn all(&self) -> Vec<Arc<CipherKey>> {
        self.read().keys.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_retired(&self) -> bool {
        self.read().retired
    }

    /// Zero and drop every key, then retire the index. Returns how many keys
    /// were removed.
    pub fn cleanup(&self) -> usize {
        let mut state = self.write();
        for key in state.keys.values() {
            key.reset();
        }
        retire(&mut state)
    }

    /// Non-blocking [`cleanup`](Self::cleanup) for the panic path.
    ///
    /// With the index write-locked elsewhere nothing happens. With it
    /// read-locked the keys are zeroed but stay in the map. Returns the
    /// number of keys seen and whether the map was cleared.
    fn try_cleanup(&self) -> (usize, bool) {
        if let Some(mut state) = acquired(self.state.try_write()) {
            for key in state.keys.values() {
                key.try_reset();
            }
            return (retire(&mut state), true);
        }
        if let Some(state) = acquired(self.state.try_read()) {
            for key in state.keys.values() {
                key.try_reset();
            }
            return (state.keys.len(), false);
        }
        (0, false)
    }

    fn retired_error(&self) -> CipherError {
        CipherError::EncryptOps(format!(
            "cipher key index for domain {} was cleaned up",
            self.domain_id
        ))
    }

    fn read(&self) -> RwLockReadGuard<'_, DomainState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, DomainState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Process-wide cipher key cache.
pub struct CipherKeyCache {
    domains: RwLock<HashMap<EncryptDomainId, Arc<DomainKeyIndex>>>,
    clock: Arc<dyn Clock>,
    random: Arc<RandomSource>,
    metrics: CipherMetrics,
}

impl CipherKeyCache {
    pub fn new(clock: Arc<dyn Clock>, random: Arc<RandomSource>) -> Self {
        Self {
            domains: RwLock::new(HashMap::new()),
            clock,
            random,
            metrics: CipherMetrics::new(),
        }
    }

    /// Wall clock plus the randomness policy from `config`.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(
            Arc::new(SystemClock),
            Arc::new(RandomSource::from_config(config)),
        )
    }

    pub fn with_metrics(mut self, metrics: CipherMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &CipherMetrics {
        &self.metrics
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn random(&self) -> &Arc<RandomSource> {
        &self.random
    }

    /// Register the latest base cipher for `domain_id` under a fresh salt.
    pub fn insert_cipher_key(
        &self,
        domain_id: EncryptDomainId,
        base_cipher_id: BaseCipherId,
        base_cipher: &[u8],
        refresh_at: i64,
        expire_at: i64,
    ) -> CipherResult<Arc<CipherKey>> {
        check_ids(domain_id, base_cipher_id)?;
        // A concurrent reset can retire the index between lookup and insert.
        loop {
            let tracked = self.domain_index(domain_id).insert_latest_tracked(
                base_cipher_id,
                base_cipher,
                refresh_at,
                expire_at,
            )?;
            if let Some((key, inserted)) = tracked {
                if inserted {
                    self.record_insert();
                }
                return Ok(key);
            }
        }
    }

    /// Register a base cipher under a known salt (decrypt path).
    pub fn insert_cipher_key_with_salt(
        &self,
        domain_id: EncryptDomainId,
        base_cipher_id: BaseCipherId,
        base_cipher: &[u8],
        salt: RandomSalt,
        refresh_at: i64,
        expire_at: i64,
    ) -> CipherResult<Arc<CipherKey>> {
        check_ids(domain_id, base_cipher_id)?;
        loop {
            let tracked = self.domain_index(domain_id).insert_with_salt_tracked(
                base_cipher_id,
                base_cipher,
                salt,
                refresh_at,
                expire_at,
            )?;
            if let Some((key, inserted)) = tracked {
                if inserted {
                    self.record_insert();
                }
                return Ok(key);
            }
        }
    }

    /// Latest key of `domain_id`, or `None` if absent or due for refresh.
    pub fn get_latest_cipher_key(
        &self,
        domain_id: EncryptDomainId,
    ) -> CipherResult<Option<Arc<CipherKey>>> {
        if domain_id == INVALID_ENCRYPT_DOMAIN_ID {
            return Err(CipherError::InvalidDomainId(domain_id));
        }

        let Some(latest) = self.existing_index(domain_id).and_then(|idx| idx.latest()) else {
            self.metrics.latest_key_misses.inc();
            return Ok(None);
        };

        if latest.needs_refresh(self.clock.now()) {
            debug!(
                domain_id,
                base_cipher_id = latest.base_cipher_id(),
                "latest cipher key needs refresh"
            );
            self.metrics.latest_key_refresh.inc();
            return Ok(None);
        }

        self.metrics.latest_key_hits.inc();
        Ok(Some(latest))
    }

    /// Key for exactly (domain, base cipher id, salt), or `None` if absent or expired.
    pub fn get_cipher_key(
        &self,
        domain_id: EncryptDomainId,
        base_cipher_id: BaseCipherId,
        salt: RandomSalt,
    ) -> CipherResult<Option<Arc<CipherKey>>> {
        check_ids(domain_id, base_cipher_id)?;

        let Some(key) = self
            .existing_index(domain_id)
            .and_then(|idx| idx.get(base_cipher_id, salt))
        else {
            self.metrics.key_misses.inc();
            return Ok(None);
        };

        if key.is_expired(self.clock.now()) {
            debug!(domain_id, base_cipher_id, salt, "cipher key expired");
            self.metrics.key_expired.inc();
            return Ok(None);
        }

        self.metrics.key_hits.inc();
        Ok(Some(key))
    }

    /// Latest text key for `domain_id` together with the latest header key.
    pub fn get_latest_key_pair(
        &self,
        domain_id: EncryptDomainId,
    ) -> CipherResult<Option<(Arc<CipherKey>, Arc<CipherKey>)>> {
        let text = self.get_latest_cipher_key(domain_id)?;
        let header = self.get_latest_cipher_key(ENCRYPT_HEADER_DOMAIN_ID)?;
        Ok(text.zip(header))
    }

    pub fn get_all_keys(&self, domain_id: EncryptDomainId) -> Vec<Arc<CipherKey>> {
        self.existing_index(domain_id)
            .map(|idx| idx.all())
            .unwrap_or_default()
    }

    /// Drop every key of one domain, e.g. after the domain is destroyed upstream.
    pub fn reset_domain(&self, domain_id: EncryptDomainId) {
        let removed = self.write_domains().remove(&domain_id);
        if let Some(idx) = removed {
            let count = idx.cleanup();
            self.metrics.cached_keys.dec_by(count as i64);
            info!(domain_id, keys = count, "reset encryption domain");
        }
    }

    /// Zero and drop every cached key in every domain.
    pub fn cleanup_all(&self) {
        let drained: Vec<_> = self.write_domains().drain().collect();
        let mut total = 0;
        for (_, idx) in drained {
            total += idx.cleanup();
        }
        self.metrics.cached_keys.dec_by(total as i64);
        info!(keys = total, "cipher key cache scrubbed");
    }

    /// Best-effort [`cleanup_all`](Self::cleanup_all) that never waits on a
    /// lock, for use from a panic hook. Keys whose locks are held (e.g. by the
    /// panicking thread) are skipped. Returns the number of keys visited.
    pub fn try_cleanup_all(&self) -> usize {
        let (indexes, detached): (Vec<Arc<DomainKeyIndex>>, bool) =
            if let Some(mut domains) = acquired(self.domains.try_write()) {
                (domains.drain().map(|(_, idx)| idx).collect(), true)
            } else if let Some(domains) = acquired(self.domains.try_read()) {
                (domains.values().cloned().collect(), false)
            } else {
                return 0;
            };

        let mut visited = 0;
        let mut uncached = 0;
        for idx in indexes {
            let (keys, cleared) = idx.try_cleanup();
            visited += keys;
            if cleared || detached {
                uncached += keys;
            }
        }
        self.metrics.cached_keys.dec_by(uncached as i64);
        visited
    }

    pub fn key_count(&self) -> usize {
        self.read_domains().values().map(|idx| idx.len()).sum()
    }

    pub fn domain_count(&self) -> usize {
        self.read_domains().len()
    }

    fn record_insert(&self) {
        self.metrics.key_inserts.inc();
        self.metrics.cached_keys.inc();
    }

    fn existing_index(&self, domain_id: EncryptDomainId) -> Option<Arc<DomainKeyIndex>> {
        self.read_domains().get(&domain_id).cloned()
    }

    fn domain_index(&self, domain_id: EncryptDomainId) -> Arc<DomainKeyIndex> {
        if let Some(idx) = self.existing_index(domain_id) {
            if !idx.is_retired() {
                return idx;
            }
        }
        let mut domains = self.write_domains();
        let idx = domains
            .entry(domain_id)
            .or_insert_with(|| Arc::new(DomainKeyIndex::new(domain_id, self.random.clone())));
        if idx.is_retired() {
            *idx = Arc::new(DomainKeyIndex::new(domain_id, self.random.clone()));
        }
        idx.clone()
    }

    fn read_domains(&self) -> RwLockReadGuard<'_, HashMap<EncryptDomainId, Arc<DomainKeyIndex>>> {
        self.domains.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_domains(
        &self,
    ) -> RwLockWriteGuard<'_, HashMap<EncryptDomainId, Arc<DomainKeyIndex>>> {
        self.domains.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for CipherKeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherKeyCache")
            .field("domains", &self.domain_count())
            .field("keys", &self.key_count())
            .field("random", &self.random)
            .finish()
    }
}

fn retire(state: &mut DomainState) -> usize {
    let removed = state.keys.len();
    state.keys.clear();
    state.latest = None;
    state.retired = true;
    removed
}

/// Guard from a `try_*` lock call; poisoning is ignored, contention is `None`.
fn acquired<G>(result: TryLockResult<G>) -> Option<G> {
    match result {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

fn check_ids(domain_id: EncryptDomainId, base_cipher_id: BaseCipherId) -> CipherResult<()> {
    if domain_id == INVALID_ENCRYPT_DOMAIN_ID {
        return Err(CipherError::InvalidDomainId(domain_id));
    }
    if base_cipher_id == INVALID_ENCRYPT_CIPHER_KEY_ID {
        return Err(CipherError::InvalidCipherKeyId(base_cipher_id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use blobcipher_core::types::KEY_TIMESTAMP_INFINITE;

    const INF: i64 = KEY_TIMESTAMP_INFINITE;

    fn test_cache() -> (CipherKeyCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let cache = CipherKeyCache::new(clock.clone(), Arc::new(RandomSource::deterministic(11)));
        (cache, clock)
    }

    #[test]
    fn test_insert_and_get_latest() {
        let (cache, _) = test_cache();
        let inserted = cache.insert_cipher_key(7, 100, &[3u8; 32], INF, INF).unwrap();

        let latest = cache.get_latest_cipher_key(7).unwrap().unwrap();
        assert_eq!(latest.base_cipher_id(), 100);
        assert_eq!(latest.domain_id(), 7);
        assert_eq!(*latest, *inserted);
        let derived = latest.with_raw_cipher(|raw| *raw);
        latest.with_raw_base_cipher(|base| assert_ne!(base, &derived[..]));
    }

    #[test]
    fn test_idempotent_insert() {
        let (cache, _) = test_cache();
        let first = cache.insert_cipher_key(7, 100, b"secret", INF, INF).unwrap();
        let second = cache.insert_cipher_key(7, 100, b"secret", INF, INF).unwrap();

        assert_eq!(*first, *second);
        assert_eq!(cache.key_count(), 1);
        assert_eq!(cache.metrics().key_inserts.get(), 1);
    }

    #[test]
    fn test_conflicting_insert_fails() {
        let (cache, _) = test_cache();
        let first = cache.insert_cipher_key(7, 100, b"secret-a", INF, INF).unwrap();
        let err = cache
            .insert_cipher_key(7, 100, b"secret-b", INF, INF)
            .unwrap_err();

        assert!(matches!(
            err,
            CipherError::KeyUpdateNotPermitted {
                domain_id: 7,
                base_cipher_id: 100
            }
        ));
        let latest = cache.get_latest_cipher_key(7).unwrap().unwrap();
        assert_eq!(*latest, *first);
    }

    #[test]
    fn test_new_base_cipher_id_rotates_latest() {
        let (cache, _) = test_cache();
        let old = cache.insert_cipher_key(7, 100, b"old", INF, INF).unwrap();
        let new = cache.insert_cipher_key(7, 101, b"new", INF, INF).unwrap();

        assert_eq!(
            cache.get_latest_cipher_key(7).unwrap().unwrap().base_cipher_id(),
            101
        );
        // The rotated-out key stays available for decryption.
        let found = cache.get_cipher_key(7, 100, old.salt()).unwrap().unwrap();
        assert_eq!(*found, *old);
        assert_eq!(cache.get_all_keys(7).len(), 2);
        assert_eq!(new.domain_id(), 7);
    }

    #[test]
    fn test_insert_with_salt() {
        let (cache, _) = test_cache();
        let key = cache
            .insert_cipher_key_with_salt(7, 100, b"secret", 555, INF, INF)
            .unwrap();
        assert_eq!(key.salt(), 555);

        // Salted inserts do not become the latest key.
        assert!(cache.get_latest_cipher_key(7).unwrap().is_none());
        assert!(cache.get_cipher_key(7, 100, 555).unwrap().is_some());

        let again = cache
            .insert_cipher_key_with_salt(7, 100, b"secret", 555, INF, INF)
            .unwrap();
        assert_eq!(*again, *key);
        assert_eq!(cache.key_count(), 1);

        let err = cache
            .insert_cipher_key_with_salt(7, 100, b"other", 555, INF, INF)
            .unwrap_err();
        assert!(matches!(err, CipherError::KeyUpdateNotPermitted { .. }));
    }

    #[test]
    fn test_salted_insert_reproduces_latest_key() {
        let (writer, _) = test_cache();
        let original = writer.insert_cipher_key(7, 100, b"secret", INF, INF).unwrap();

        let (reader, _) = test_cache();
        let rebuilt = reader
            .insert_cipher_key_with_salt(7, 100, b"secret", original.salt(), INF, INF)
            .unwrap();
        assert_eq!(*rebuilt, *original);
    }

    #[test]
    fn test_invalid_ids() {
        let (cache, _) = test_cache();
        assert!(matches!(
            cache.insert_cipher_key(INVALID_ENCRYPT_DOMAIN_ID, 1, b"k", INF, INF),
            Err(CipherError::InvalidDomainId(_))
        ));
        assert!(matches!(
            cache.insert_cipher_key(1, INVALID_ENCRYPT_CIPHER_KEY_ID, b"k", INF, INF),
            Err(CipherError::InvalidCipherKeyId(_))
        ));
        assert!(matches!(
            cache.insert_cipher_key_with_salt(INVALID_ENCRYPT_DOMAIN_ID, 1, b"k", 1, INF, INF),
            Err(CipherError::InvalidDomainId(_))
        ));
        assert!(matches!(
            cache.get_latest_cipher_key(INVALID_ENCRYPT_DOMAIN_ID),
            Err(CipherError::InvalidDomainId(_))
        ));
        assert!(matches!(
            cache.get_cipher_key(1, INVALID_ENCRYPT_CIPHER_KEY_ID, 1),
            Err(CipherError::InvalidCipherKeyId(_))
        ));
    }

    #[test]
    fn test_freshness() {
        let (cache, clock) = test_cache();
        let key = cache.insert_cipher_key(7, 100, b"k", 1_500, INF).unwrap();

        assert!(cache.get_latest_cipher_key(7).unwrap().is_some());
        clock.set(1_500);
        assert!(cache.get_latest_cipher_key(7).unwrap().is_none());
        assert_eq!(cache.metrics().latest_key_refresh.get(), 1);

        // Still usable for reads until it expires.
        assert!(cache.get_cipher_key(7, 100, key.salt()).unwrap().is_some());
    }

    #[test]
    fn test_liveness() {
        let (cache, clock) = test_cache();
        let key = cache.insert_cipher_key(7, 100, b"k", 1_200, 1_300).unwrap();

        assert!(cache.get_cipher_key(7, 100, key.salt()).unwrap().is_some());
        clock.set(1_300);
        assert!(cache.get_cipher_key(7, 100, key.salt()).unwrap().is_none());
        assert_eq!(cache.metrics().key_expired.get(), 1);
    }

    #[test]
    fn test_misses() {
        let (cache, _) = test_cache();
        assert!(cache.get_latest_cipher_key(9).unwrap().is_none());
        assert!(cache.get_cipher_key(9, 1, 1).unwrap().is_none());
        assert_eq!(cache.metrics().latest_key_misses.get(), 1);
        assert_eq!(cache.metrics().key_misses.get(), 1);
        assert_eq!(cache.domain_count(), 0, "lookups must not create domains");
    }

    #[test]
    fn test_latest_key_pair() {
        let (cache, _) = test_cache();
        cache.insert_cipher_key(7, 100, b"text", INF, INF).unwrap();
        assert!(cache.get_latest_key_pair(7).unwrap().is_none());

        cache
            .insert_cipher_key(ENCRYPT_HEADER_DOMAIN_ID, 1, b"header", INF, INF)
            .unwrap();
        let (text, header) = cache.get_latest_key_pair(7).unwrap().unwrap();
        assert_eq!(text.domain_id(), 7);
        assert_eq!(header.domain_id(), ENCRYPT_HEADER_DOMAIN_ID);
    }

    #[test]
    fn test_reset_domain() {
        let (cache, _) = test_cache();
        let doomed = cache.insert_cipher_key(7, 100, b"k", INF, INF).unwrap();
        cache.insert_cipher_key(8, 100, b"k", INF, INF).unwrap();

        cache.reset_domain(7);

        assert!(cache.get_all_keys(7).is_empty());
        assert_eq!(cache.get_all_keys(8).len(), 1);
        assert!(doomed.is_scrubbed());
        assert!(doomed.with_raw_cipher(|raw| raw.iter().all(|b| *b == 0)));
        assert_eq!(cache.metrics().cached_keys.get(), 1);
    }

    #[test]
    fn test_cleanup_all() {
        let (cache, _) = test_cache();
        let a = cache.insert_cipher_key(7, 100, &[1u8; 32], INF, INF).unwrap();
        let b = cache.insert_cipher_key(8, 200, &[2u8; 32], INF, INF).unwrap();

        cache.cleanup_all();

        for key in [a, b] {
            assert!(key.with_raw_cipher(|raw| raw.iter().all(|b| *b == 0)));
            assert!(key.with_raw_base_cipher(|base| base.iter().all(|b| *b == 0)));
        }
        assert!(cache.get_all_keys(7).is_empty());
        assert!(cache.get_all_keys(8).is_empty());
        assert_eq!(cache.key_count(), 0);
        assert_eq!(cache.metrics().cached_keys.get(), 0);
    }

    #[test]
    fn test_domain_index_direct() {
        let idx = DomainKeyIndex::new(3, Arc::new(RandomSource::deterministic(1)));
        assert!(idx.is_empty());
        assert!(idx.latest().is_none());

        let key = idx.insert_latest(10, b"k", INF, INF).unwrap();
        assert_eq!(idx.latest().unwrap().salt(), key.salt());
        assert!(idx.get(10, key.salt()).is_some());
        assert_eq!(idx.cleanup(), 1);
        assert!(idx.latest().is_none());
        assert!(idx.is_retired());

        let err = idx.insert_latest(11, b"k", INF, INF).unwrap_err();
        assert!(matches!(err, CipherError::EncryptOps(_)));
        let err = idx.insert_with_salt(10, b"k", 5, INF, INF).unwrap_err();
        assert!(matches!(err, CipherError::EncryptOps(_)));
        assert!(idx.is_empty());
    }

    #[test]
    fn test_insert_after_detached_cleanup_gets_fresh_index() {
        let (cache, _) = test_cache();
        cache.insert_cipher_key(7, 100, b"k", INF, INF).unwrap();

        // An index left in the map after a partial panic-path cleanup.
        let stale = cache.existing_index(7).unwrap();
        stale.cleanup();
        assert!(stale.is_retired());

        let key = cache.insert_cipher_key(7, 101, b"k", INF, INF).unwrap();
        let current = cache.existing_index(7).unwrap();
        assert!(!Arc::ptr_eq(&stale, &current));
        assert!(Arc::ptr_eq(&current.latest().unwrap(), &key));
    }

    #[test]
    fn test_try_cleanup_all_skips_held_index_lock() {
        let (cache, _) = test_cache();
        let a = cache.insert_cipher_key(7, 100, &[1u8; 32], INF, INF).unwrap();
        let b = cache.insert_cipher_key(8, 200, &[2u8; 32], INF, INF).unwrap();
        let idx = cache.existing_index(7).unwrap();

        // A lookup in progress on domain 7 when the panic hits.
        let held = idx.read();
        assert_eq!(cache.try_cleanup_all(), 2);
        drop(held);

        assert!(a.is_scrubbed());
        assert!(b.is_scrubbed());
        assert_eq!(cache.key_count(), 0);
        assert_eq!(cache.metrics().cached_keys.get(), 0);
    }

    #[test]
    fn test_try_cleanup_all_skips_held_key_material() {
        let (cache, _) = test_cache();
        let busy = cache.insert_cipher_key(7, 100, &[1u8; 32], INF, INF).unwrap();
        let idle = cache.insert_cipher_key(8, 200, &[2u8; 32], INF, INF).unwrap();

        // Panic raised while `busy` is mid-encryption on this thread.
        let visited = busy.with_raw_cipher(|_| cache.try_cleanup_all());

        assert_eq!(visited, 2);
        assert!(!busy.is_scrubbed());
        assert!(idle.is_scrubbed());
        assert_eq!(cache.key_count(), 0);
    }

    #[test]
    fn test_try_cleanup_all_with_domain_map_read_locked() {
        let (cache, _) = test_cache();
        let key = cache.insert_cipher_key(7, 100, &[1u8; 32], INF, INF).unwrap();

        let held = cache.read_domains();
        assert_eq!(cache.try_cleanup_all(), 1);
        drop(held);

        assert!(key.is_scrubbed());
        assert!(cache.existing_index(7).unwrap().is_retired());
        assert_eq!(cache.metrics().cached_keys.get(), 0);

        cache.insert_cipher_key(7, 101, b"next", INF, INF).unwrap();
        assert_eq!(cache.key_count(), 1);
        assert_eq!(cache.metrics().cached_keys.get(), 1);
    }
}
