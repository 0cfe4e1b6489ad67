//! AES-256-CTR blob encryption with authenticated headers
//!
//! Auth token modes:
//! - `None`: no token.
//! - `Single`: `HMAC(header_key, ciphertext || header)` with the token region
//!   zeroed; cheapest when payload and header are always read together.
//! - `Multi`: `HMAC(salt_le, ciphertext)` plus `HMAC(header_key, header)`, so
//!   the header can be validated before the payload is fetched.

use std::sync::Arc;
use std::time::Instant;

use aes::Aes256;
use blobcipher_core::types::{
    EncryptAuthTokenMode, UsageType, AES_256_IV_LENGTH, AUTH_TOKEN_SIZE,
};
use blobcipher_core::{CipherError, CipherResult};
use ctr::cipher::{KeyIvInit, StreamCipher};

use crate::header::{AuthTokens, CipherDetails, EncryptHeader, HeaderFlags};
use crate::kdf::compute_auth_token;
use crate::keys::CipherKey;
use crate::metrics::CipherMetrics;
use crate::random::RandomSource;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Output of one encryption.
#[derive(Debug, Clone)]
pub struct EncryptedBlob {
    pub ciphertext: Vec<u8>,
    pub header: EncryptHeader,
}

/// Single-use encryptor bound to one IV.
///
/// `encrypt` consumes the encryptor; retrying after a failure requires a new
/// encryptor with a fresh IV.
pub struct Encryptor {
    text_key: Arc<CipherKey>,
    header_key: Option<Arc<CipherKey>>,
    iv: [u8; AES_256_IV_LENGTH],
    auth_mode: EncryptAuthTokenMode,
    usage: UsageType,
    metrics: Option<CipherMetrics>,
}

impl Encryptor {
    pub fn new(
        text_key: Arc<CipherKey>,
        header_key: Option<Arc<CipherKey>>,
        iv: [u8; AES_256_IV_LENGTH],
        auth_mode: EncryptAuthTokenMode,
        usage: UsageType,
    ) -> CipherResult<Self> {
        if auth_mode != EncryptAuthTokenMode::None && header_key.is_none() {
            return Err(CipherError::EncryptOps(format!(
                "auth token mode {auth_mode} requires a header cipher key"
            )));
        }
        Ok(Self {
            text_key,
            header_key,
            iv,
            auth_mode,
            usage,
            metrics: None,
        })
    }

    /// Like [`new`](Self::new) with an IV drawn from `random`.
    pub fn with_random_iv(
        text_key: Arc<CipherKey>,
        header_key: Option<Arc<CipherKey>>,
        auth_mode: EncryptAuthTokenMode,
        usage: UsageType,
        random: &RandomSource,
    ) -> CipherResult<Self> {
        Self::new(text_key, header_key, random.random_iv(), auth_mode, usage)
    }

    pub fn with_metrics(mut self, metrics: &CipherMetrics) -> Self {
        self.metrics = Some(metrics.clone());
        self
    }

    pub fn iv(&self) -> &[u8; AES_256_IV_LENGTH] {
        &self.iv
    }

    pub fn encrypt(self, plaintext: &[u8]) -> CipherResult<EncryptedBlob> {
        let started = Instant::now();

        let mut ciphertext = plaintext.to_vec();
        aes_256_ctr(&self.text_key, &self.iv, &mut ciphertext)?;
        if ciphertext.len() != plaintext.len() {
            return Err(CipherError::EncryptOps(format!(
                "encrypted {} of {} bytes",
                ciphertext.len(),
                plaintext.len()
            )));
        }

        let mut header = EncryptHeader {
            flags: HeaderFlags::current(),
            cipher_text_details: CipherDetails::of(&self.text_key),
            cipher_header_details: self
                .header_key
                .as_deref()
                .map(CipherDetails::of)
                .unwrap_or_default(),
            iv: self.iv,
            auth_tokens: AuthTokens::zeroed(self.auth_mode),
        };

        match self.auth_mode {
            EncryptAuthTokenMode::None => {}
            EncryptAuthTokenMode::Single => {
                let header_bytes = header.encode_for_auth();
                let token = self.header_key()?.with_live_cipher(|key| {
                    compute_auth_token(key, &[&ciphertext[..], &header_bytes[..]])
                })?;
                header.auth_tokens = AuthTokens::Single { token };
            }
            EncryptAuthTokenMode::Multi => {
                let cipher_text_token = compute_auth_token(
                    &header.cipher_text_details.salt.to_le_bytes(),
                    &[&ciphertext[..]],
                )?;
                header.auth_tokens = AuthTokens::Multi {
                    cipher_text_token,
                    header_token: [0u8; AUTH_TOKEN_SIZE],
                };

                let header_bytes = header.encode_for_auth();
                let header_token = self
                    .header_key()?
                    .with_live_cipher(|key| compute_auth_token(key, &[&header_bytes[..]]))?;
                header.auth_tokens = AuthTokens::Multi {
                    cipher_text_token,
                    header_token,
                };
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_encrypt(self.usage, plaintext.len(), started.elapsed());
        }
        tracing::trace!(
            domain_id = header.cipher_text_details.domain_id,
            base_cipher_id = header.cipher_text_details.base_cipher_id,
            mode = %self.auth_mode,
            usage = %self.usage,
            bytes = plaintext.len(),
            "encrypted blob"
        );

        Ok(EncryptedBlob { ciphertext, header })
    }

    fn header_key(&self) -> CipherResult<&CipherKey> {
        self.header_key
            .as_deref()
            .ok_or_else(|| CipherError::EncryptOps("missing header cipher key".into()))
    }
}

/// Apply the AES-256-CTR keystream of `key`/`iv` to `data` in place.
pub(crate) fn aes_256_ctr(
    key: &CipherKey,
    iv: &[u8; AES_256_IV_LENGTH],
    data: &mut [u8],
) -> CipherResult<()> {
    key.with_live_cipher(|raw| {
        let mut cipher = Aes256Ctr::new_from_slices(raw, iv)
            .map_err(|e| CipherError::EncryptOps(format!("AES-256-CTR init: {e}")))?;
        cipher
            .try_apply_keystream(data)
            .map_err(|e| CipherError::EncryptOps(format!("AES-256-CTR keystream: {e}")))
    })
}
