//! Prometheus counters for the cipher key cache and encrypt/decrypt calls.
//!
//! All handles are cheap clones over shared atomics; clone a `CipherMetrics`
//! into each encryptor/decryptor and register it once with the process registry.

use std::time::Duration;

use blobcipher_core::types::UsageType;
use prometheus_client::{
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};

type Labels = Vec<(String, String)>;

#[derive(Clone)]
pub struct CipherMetrics {
    pub latest_key_hits: Counter,
    pub latest_key_misses: Counter,
    pub latest_key_refresh: Counter,
    pub key_hits: Counter,
    pub key_misses: Counter,
    pub key_expired: Counter,
    pub key_inserts: Counter,
    pub cached_keys: Gauge,
    pub encrypt_bytes: Family<Labels, Counter>,
    pub decrypt_bytes: Family<Labels, Counter>,
    pub encrypt_seconds: Family<Labels, Histogram>,
    pub decrypt_seconds: Family<Labels, Histogram>,
}

impl Default for CipherMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CipherMetrics {
    pub fn new() -> Self {
        let timing = || {
            Family::<Labels, Histogram>::new_with_constructor(|| {
                Histogram::new([1e-6, 1e-5, 1e-4, 1e-3, 1e-2, 0.1, 1.0])
            })
        };

        CipherMetrics {
            latest_key_hits: Counter::default(),
            latest_key_misses: Counter::default(),
            latest_key_refresh: Counter::default(),
            key_hits: Counter::default(),
            key_misses: Counter::default(),
            key_expired: Counter::default(),
            key_inserts: Counter::default(),
            cached_keys: Gauge::default(),
            encrypt_bytes: Family::default(),
            decrypt_bytes: Family::default(),
            encrypt_seconds: timing(),
            decrypt_seconds: timing(),
        }
    }

    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "blobcipher_latest_key_hits",
            "Latest-key lookups served from the cache",
            self.latest_key_hits.clone(),
        );
        registry.register(
            "blobcipher_latest_key_misses",
            "Latest-key lookups with no cached key",
            self.latest_key_misses.clone(),
        );
        registry.register(
            "blobcipher_latest_key_refresh",
            "Latest-key lookups withheld because the key needs refresh",
            self.latest_key_refresh.clone(),
        );
        registry.register(
            "blobcipher_key_hits",
            "Exact key lookups served from the cache",
            self.key_hits.clone(),
        );
        registry.register(
            "blobcipher_key_misses",
            "Exact key lookups with no cached key",
            self.key_misses.clone(),
        );
        registry.register(
            "blobcipher_key_expired",
            "Exact key lookups withheld because the key expired",
            self.key_expired.clone(),
        );
        registry.register(
            "blobcipher_key_inserts",
            "Cipher keys added to the cache",
            self.key_inserts.clone(),
        );
        registry.register(
            "blobcipher_cached_keys",
            "Cipher keys currently cached",
            self.cached_keys.clone(),
        );
        registry.register(
            "blobcipher_encrypt_bytes",
            "Plaintext bytes encrypted",
            self.encrypt_bytes.clone(),
        );
        registry.register(
            "blobcipher_decrypt_bytes",
            "Ciphertext bytes decrypted",
            self.decrypt_bytes.clone(),
        );
        registry.register(
            "blobcipher_encrypt_seconds",
            "Time spent encrypting, including auth tokens",
            self.encrypt_seconds.clone(),
        );
        registry.register(
            "blobcipher_decrypt_seconds",
            "Time spent verifying and decrypting",
            self.decrypt_seconds.clone(),
        );
    }

    pub fn record_encrypt(&self, usage: UsageType, bytes: usize, elapsed: Duration) {
        let labels = usage_labels(usage);
        self.encrypt_bytes
            .get_or_create(&labels)
            .inc_by(bytes as u64);
        self.encrypt_seconds
            .get_or_create(&labels)
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_decrypt(&self, usage: UsageType, bytes: usize, elapsed: Duration) {
        let labels = usage_labels(usage);
        self.decrypt_bytes
            .get_or_create(&labels)
            .inc_by(bytes as u64);
        self.decrypt_seconds
            .get_or_create(&labels)
            .observe(elapsed.as_secs_f64());
    }
}

fn usage_labels(usage: UsageType) -> Labels {
    vec![("usage".to_string(), usage.as_str().to_string())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn test_register_and_encode() {
        let metrics = CipherMetrics::new();
        let mut registry = Registry::default();
        metrics.register(&mut registry);

        metrics.key_hits.inc();
        metrics.record_encrypt(UsageType::Backup, 1000, Duration::from_micros(5));

        let mut body = String::new();
        encode(&mut body, &registry).unwrap();
        assert!(body.contains("blobcipher_key_hits_total 1"));
        assert!(body.contains("usage=\"backup\""));
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = CipherMetrics::new();
        let clone = metrics.clone();
        clone.key_inserts.inc();
        assert_eq!(metrics.key_inserts.get(), 1);
    }
}
