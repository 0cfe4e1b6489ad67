//! Salt and IV generation.
//!
//! Production draws from the thread-local CSPRNG. Simulation and tests can
//! pin a seed so every salt and IV is reproducible across runs.

use std::sync::{Mutex, PoisonError};

use blobcipher_core::config::CacheConfig;
use blobcipher_core::types::{RandomSalt, AES_256_IV_LENGTH};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

pub struct RandomSource {
    inner: Inner,
}

enum Inner {
    Os,
    Deterministic(Mutex<StdRng>),
}

impl RandomSource {
    pub fn os() -> Self {
        Self { inner: Inner::Os }
    }

    pub fn deterministic(seed: u64) -> Self {
        Self {
            inner: Inner::Deterministic(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        match config.deterministic_seed {
            Some(seed) => {
                tracing::warn!(seed, "using deterministic salt/IV generation");
                Self::deterministic(seed)
            }
            None => Self::os(),
        }
    }

    pub fn is_deterministic(&self) -> bool {
        matches!(self.inner, Inner::Deterministic(_))
    }

    pub fn next_salt(&self) -> RandomSalt {
        match &self.inner {
            Inner::Os => rand::thread_rng().next_u64(),
            Inner::Deterministic(rng) => rng
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .next_u64(),
        }
    }

    pub fn fill_iv(&self, iv: &mut [u8; AES_256_IV_LENGTH]) {
        match &self.inner {
            Inner::Os => rand::thread_rng().fill_bytes(iv),
            Inner::Deterministic(rng) => rng
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .fill_bytes(iv),
        }
    }

    pub fn random_iv(&self) -> [u8; AES_256_IV_LENGTH] {
        let mut iv = [0u8; AES_256_IV_LENGTH];
        self.fill_iv(&mut iv);
        iv
    }
}

impl Default for RandomSource {
    fn default() -> Self {
        Self::os()
    }
}

impl std::fmt::Debug for RandomSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RandomSource")
            .field("deterministic", &self.is_deterministic())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_is_reproducible() {
        let a = RandomSource::deterministic(7);
        let b = RandomSource::deterministic(7);

        assert_eq!(a.next_salt(), b.next_salt());
        assert_eq!(a.random_iv(), b.random_iv());
    }

    #[test]
    fn test_different_seeds_diverge() {
        let a = RandomSource::deterministic(1);
        let b = RandomSource::deterministic(2);
        assert_ne!(a.next_salt(), b.next_salt());
    }

    #[test]
    fn test_os_salts_differ() {
        let rng = RandomSource::os();
        assert!(!rng.is_deterministic());
        assert_ne!(rng.next_salt(), rng.next_salt());
    }

    #[test]
    fn test_from_config() {
        let seeded = RandomSource::from_config(&CacheConfig {
            deterministic_seed: Some(3),
        });
        assert!(seeded.is_deterministic());
        assert!(!RandomSource::from_config(&CacheConfig::default()).is_deterministic());
    }
}
