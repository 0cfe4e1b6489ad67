use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CipherError, CipherResult};
use crate::types::{EncryptAuthTokenMode, UsageType};

/// Top-level configuration (loaded from blobcipher.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CipherConfig {
    pub cache: CacheConfig,
    pub encryption: EncryptionConfig,
    pub keyring: KeyringConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Seed for reproducible salts and IVs. Unset in production, where the
    /// OS-backed CSPRNG is used.
    pub deterministic_seed: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Auth token scheme for new headers: "none", "single", or "multi"
    pub auth_token_mode: EncryptAuthTokenMode,
    /// Usage tag for encrypt/decrypt metrics
    pub usage: UsageType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyringConfig {
    /// TOML file listing base cipher secrets per domain
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for KeyringConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/etc/blobcipher/keyring.toml"),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl CipherConfig {
    /// Load configuration from `path`, falling back to defaults when the file
    /// does not exist.
    pub fn load(path: &Path) -> CipherResult<Self> {
        if !path.exists() {
            tracing::warn!(
                "config file not found: {}  (using defaults)",
                path.display()
            );
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| CipherError::Config(format!("reading {}: {e}", path.display())))?;
        Self::parse(&content)
            .map_err(|e| CipherError::Config(format!("parsing {}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[cache]
deterministic_seed = 42

[encryption]
auth_token_mode = "single"
usage = "blob_granule"

[keyring]
path = "/tmp/keyring.toml"

[log]
level = "debug"
format = "json"
"#;
        let config = CipherConfig::parse(toml_str).unwrap();

        assert_eq!(config.cache.deterministic_seed, Some(42));
        assert_eq!(config.encryption.auth_token_mode, EncryptAuthTokenMode::Single);
        assert_eq!(config.encryption.usage, UsageType::BlobGranule);
        assert_eq!(config.keyring.path, PathBuf::from("/tmp/keyring.toml"));
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.format, "json");
    }

    #[test]
    fn test_parse_defaults() {
        let config = CipherConfig::parse("").unwrap();

        assert_eq!(config.cache.deterministic_seed, None);
        assert_eq!(config.encryption.auth_token_mode, EncryptAuthTokenMode::Multi);
        assert_eq!(config.encryption.usage, UsageType::Test);
        assert_eq!(
            config.keyring.path,
            PathBuf::from("/etc/blobcipher/keyring.toml")
        );
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_unknown_auth_mode_rejected() {
        let result = CipherConfig::parse("[encryption]\nauth_token_mode = \"double\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = CipherConfig::load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.log.format, "text");
    }

    #[test]
    fn test_load_malformed_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.toml");
        std::fs::write(&path, "[cache\n").unwrap();

        let err = CipherConfig::load(&path).unwrap_err();
        assert!(matches!(err, CipherError::Config(_)));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = CipherConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed = CipherConfig::parse(&toml_str).unwrap();

        assert_eq!(config.keyring.path, parsed.keyring.path);
        assert_eq!(
            config.encryption.auth_token_mode,
            parsed.encryption.auth_token_mode
        );
    }
}
