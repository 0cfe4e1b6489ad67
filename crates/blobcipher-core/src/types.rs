//! Identifiers, reserved ids, and the header mode enums shared by every crate.

use serde::{Deserialize, Serialize};

/// Partition of the key space; each domain has its own key lineage.
pub type EncryptDomainId = i64;

/// Identifier of externally managed base key material within a domain.
pub type BaseCipherId = u64;

/// Random value mixed into key derivation to produce one key instance.
pub type RandomSalt = u64;

/// Sentinel domain id. Never valid for inserts or lookups; a header carrying it
/// in its header-key slot means no header key was used.
pub const INVALID_ENCRYPT_DOMAIN_ID: EncryptDomainId = 0;

/// Domain owning keys for the system keyspace.
pub const SYSTEM_KEYSPACE_ENCRYPT_DOMAIN_ID: EncryptDomainId = -1;

/// Domain owning the keys used to authenticate encryption headers.
pub const ENCRYPT_HEADER_DOMAIN_ID: EncryptDomainId = -2;

/// Domain used when no tenant-specific domain applies.
pub const DEFAULT_ENCRYPT_DOMAIN_ID: EncryptDomainId = -3;

/// Sentinel base cipher id.
pub const INVALID_ENCRYPT_CIPHER_KEY_ID: BaseCipherId = 0;

/// "+infinity" for refresh/expiry timestamps.
pub const KEY_TIMESTAMP_INFINITE: i64 = i64::MAX;

/// AES-256 key length, also the size of every derived key.
pub const AES_256_KEY_LENGTH: usize = 32;

/// AES-CTR initial counter block length.
pub const AES_256_IV_LENGTH: usize = 16;

/// HMAC-SHA256 digest length.
pub const AUTH_TOKEN_SIZE: usize = 32;

/// Largest base secret accepted; shorter secrets are zero-padded.
pub const MAX_BASE_CIPHER_LEN: usize = AES_256_KEY_LENGTH;

/// Current on-disk encryption header version.
pub const ENCRYPT_HEADER_VERSION: u8 = 1;

/// Payload cipher recorded in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EncryptCipherMode {
    None = 0,
    Aes256Ctr = 1,
}

impl TryFrom<u8> for EncryptCipherMode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Aes256Ctr),
            other => Err(other),
        }
    }
}

/// Which HMAC auth tokens an encryption header carries.
///
/// - `None`: no tamper detection.
/// - `Single`: one token over `ciphertext || header`.
/// - `Multi`: separate ciphertext and header tokens, so the header can be
///   validated before the payload is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum EncryptAuthTokenMode {
    None = 0,
    Single = 1,
    #[default]
    Multi = 2,
}

impl EncryptAuthTokenMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Single => "single",
            Self::Multi => "multi",
        }
    }
}

impl TryFrom<u8> for EncryptAuthTokenMode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Single),
            2 => Ok(Self::Multi),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for EncryptAuthTokenMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EncryptAuthTokenMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "single" => Ok(Self::Single),
            "multi" => Ok(Self::Multi),
            other => Err(format!("unknown auth token mode: {other}")),
        }
    }
}

/// Caller tag attached to encrypt/decrypt metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageType {
    TLog,
    KvMemory,
    KvRedwood,
    BlobGranule,
    Backup,
    #[default]
    Test,
}

impl UsageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TLog => "tlog",
            Self::KvMemory => "kv_memory",
            Self::KvRedwood => "kv_redwood",
            Self::BlobGranule => "blob_granule",
            Self::Backup => "backup",
            Self::Test => "test",
        }
    }
}

impl std::fmt::Display for UsageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UsageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Self::TLog,
            Self::KvMemory,
            Self::KvRedwood,
            Self::BlobGranule,
            Self::Backup,
            Self::Test,
        ]
        .into_iter()
        .find(|usage| usage.as_str() == s)
        .ok_or_else(|| format!("unknown usage type: {s}"))
    }
}
