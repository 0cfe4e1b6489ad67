//! Local stand-in for the external key manager.
//!
//! A keyring file lists base ciphers per encryption domain:
//!
//! ```toml
//! [[keys]]
//! domain_id = 7
//! base_cipher_id = 100
//! secret = "<base64, at most 32 bytes decoded>"
//! refresh_at = 1767225600   # optional, unix seconds
//! expire_at = 1769904000    # optional, unix seconds
//! ```

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use zeroize::{Zeroize, Zeroizing};

use blobcipher_core::types::{BaseCipherId, EncryptDomainId, KEY_TIMESTAMP_INFINITE};
use blobcipher_crypto::{CipherDetails, CipherKey, CipherKeyCache};

#[derive(Deserialize)]
struct KeyringFile {
    #[serde(default)]
    keys: Vec<RawEntry>,
}

#[derive(Deserialize)]
struct RawEntry {
    domain_id: EncryptDomainId,
    base_cipher_id: BaseCipherId,
    secret: String,
    refresh_at: Option<i64>,
    expire_at: Option<i64>,
}

pub struct KeyEntry {
    pub domain_id: EncryptDomainId,
    pub base_cipher_id: BaseCipherId,
    pub refresh_at: i64,
    pub expire_at: i64,
    secret: SecretString,
}

impl KeyEntry {
    fn base_cipher(&self) -> Result<Zeroizing<Vec<u8>>> {
        B64.decode(self.secret.expose_secret())
            .map(Zeroizing::new)
            .with_context(|| {
                format!(
                    "base64 decode secret for domain {} base cipher {}",
                    self.domain_id, self.base_cipher_id
                )
            })
    }
}

pub struct Keyring {
    entries: Vec<KeyEntry>,
}

impl Keyring {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading keyring: {}", path.display()))?;
        let content = Zeroizing::new(content);
        let keyring = Self::parse(&content)
            .with_context(|| format!("parsing keyring: {}", path.display()))?;
        tracing::debug!(keys = keyring.len(), path = %path.display(), "loaded keyring");
        Ok(keyring)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let file: KeyringFile = toml::from_str(content)?;
        let entries = file
            .keys
            .into_iter()
            .map(|mut raw| {
                let entry = KeyEntry {
                    domain_id: raw.domain_id,
                    base_cipher_id: raw.base_cipher_id,
                    refresh_at: raw.refresh_at.unwrap_or(KEY_TIMESTAMP_INFINITE),
                    expire_at: raw.expire_at.unwrap_or(KEY_TIMESTAMP_INFINITE),
                    secret: SecretString::from(raw.secret.clone()),
                };
                raw.secret.zeroize();
                entry
            })
            .collect();
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, domain_id: EncryptDomainId, base_cipher_id: BaseCipherId) -> Option<&KeyEntry> {
        self.entries
            .iter()
            .find(|e| e.domain_id == domain_id && e.base_cipher_id == base_cipher_id)
    }

    /// Insert the highest base cipher id of every domain as that domain's
    /// latest key. Returns the number of domains registered.
    pub fn register_latest(&self, cache: &CipherKeyCache) -> Result<usize> {
        let mut newest: BTreeMap<EncryptDomainId, &KeyEntry> = BTreeMap::new();
        for entry in &self.entries {
            newest
                .entry(entry.domain_id)
                .and_modify(|cur| {
                    if entry.base_cipher_id > cur.base_cipher_id {
                        *cur = entry;
                    }
                })
                .or_insert(entry);
        }

        for entry in newest.values() {
            let base = entry.base_cipher()?;
            cache
                .insert_cipher_key(
                    entry.domain_id,
                    entry.base_cipher_id,
                    &base,
                    entry.refresh_at,
                    entry.expire_at,
                )
                .with_context(|| format!("registering domain {}", entry.domain_id))?;
        }
        tracing::debug!(domains = newest.len(), "registered latest cipher keys");
        Ok(newest.len())
    }

    /// Key named by a header: served from the cache, or rebuilt from the
    /// keyring under the recorded salt.
    pub fn resolve(&self, cache: &CipherKeyCache, details: &CipherDetails) -> Result<Arc<CipherKey>> {
        if let Some(key) =
            cache.get_cipher_key(details.domain_id, details.base_cipher_id, details.salt)?
        {
            return Ok(key);
        }

        let entry = self
            .entry(details.domain_id, details.base_cipher_id)
            .with_context(|| {
                format!(
                    "no base cipher {} for domain {} in keyring",
                    details.base_cipher_id, details.domain_id
                )
            })?;
        let base = entry.base_cipher()?;
        cache.insert_cipher_key_with_salt(
            details.domain_id,
            details.base_cipher_id,
            &base,
            details.salt,
            entry.refresh_at,
            entry.expire_at,
        )?;

        // Re-read so an expired key is refused rather than handed out.
        cache
            .get_cipher_key(details.domain_id, details.base_cipher_id, details.salt)?
            .with_context(|| {
                format!(
                    "cipher key expired: domain {} base cipher {}",
                    details.domain_id, details.base_cipher_id
                )
            })
    }
}
