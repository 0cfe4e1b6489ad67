//! Header verification and AES-256-CTR blob decryption

use std::sync::Arc;
use std::time::Instant;

use blobcipher_core::types::{
    EncryptAuthTokenMode, EncryptCipherMode, UsageType, AES_256_IV_LENGTH, AUTH_TOKEN_SIZE,
    ENCRYPT_HEADER_VERSION,
};
use blobcipher_core::{CipherError, CipherResult};
use tracing::warn;

use crate::encrypt::aes_256_ctr;
use crate::header::{AuthTokens, EncryptHeader, ENCRYPT_HEADER_SIZE};
use crate::kdf::verify_auth_token;
use crate::keys::CipherKey;
use crate::metrics::CipherMetrics;

/// Check the header's size, version, and encrypt mode against what this
/// build writes.
pub fn verify_header_metadata(header: &EncryptHeader) -> CipherResult<()> {
    let flags = &header.flags;
    if flags.size as usize != ENCRYPT_HEADER_SIZE {
        return Err(CipherError::HeaderMetadataMismatch(format!(
            "header size {} (expected {ENCRYPT_HEADER_SIZE})",
            flags.size
        )));
    }
    if flags.header_version != ENCRYPT_HEADER_VERSION {
        return Err(CipherError::HeaderMetadataMismatch(format!(
            "header version {} (expected {ENCRYPT_HEADER_VERSION})",
            flags.header_version
        )));
    }
    if flags.encrypt_mode != EncryptCipherMode::Aes256Ctr as u8 {
        return Err(CipherError::HeaderMetadataMismatch(format!(
            "encrypt mode {} (expected {})",
            flags.encrypt_mode,
            EncryptCipherMode::Aes256Ctr as u8
        )));
    }
    Ok(())
}

/// Decryptor for blobs written by [`Encryptor`](crate::Encryptor).
///
/// Not shared across threads; build one per decryption.
pub struct Decryptor {
    text_key: Arc<CipherKey>,
    header_key: Option<Arc<CipherKey>>,
    iv: [u8; AES_256_IV_LENGTH],
    usage: UsageType,
    metrics: Option<CipherMetrics>,
}

impl Decryptor {
    pub fn new(
        text_key: Arc<CipherKey>,
        header_key: Option<Arc<CipherKey>>,
        iv: [u8; AES_256_IV_LENGTH],
        usage: UsageType,
    ) -> Self {
        Self {
            text_key,
            header_key,
            iv,
            usage,
            metrics: None,
        }
    }

    /// Decryptor using the IV recorded in `header`.
    pub fn for_header(
        text_key: Arc<CipherKey>,
        header_key: Option<Arc<CipherKey>>,
        header: &EncryptHeader,
        usage: UsageType,
    ) -> Self {
        Self::new(text_key, header_key, header.iv, usage)
    }

    pub fn with_metrics(mut self, metrics: &CipherMetrics) -> Self {
        self.metrics = Some(metrics.clone());
        self
    }

    /// Validate the header alone, without the payload.
    ///
    /// Only multi-token headers carry a standalone header token; single-token
    /// headers need the ciphertext and are rejected here. Headers without
    /// tokens have nothing to verify beyond their metadata.
    pub fn verify_header_auth_token(&self, header: &EncryptHeader) -> CipherResult<()> {
        verify_header_metadata(header)?;
        match &header.auth_tokens {
            AuthTokens::None => Ok(()),
            AuthTokens::Single { .. } => Err(CipherError::EncryptOps(
                "single auth token headers cannot be verified without the ciphertext".into(),
            )),
            AuthTokens::Multi { header_token, .. } => {
                self.verify_multi_header_token(header, header_token)
            }
        }
    }

    pub fn decrypt(&self, ciphertext: &[u8], header: &EncryptHeader) -> CipherResult<Vec<u8>> {
        let started = Instant::now();

        verify_header_metadata(header)?;
        if header.auth_token_mode() != EncryptAuthTokenMode::None && self.header_key.is_none() {
            return Err(CipherError::EncryptOps(format!(
                "auth token mode {} requires a header cipher key",
                header.auth_token_mode()
            )));
        }

        match &header.auth_tokens {
            AuthTokens::None => {}
            AuthTokens::Single { token } => self.verify_single_token(ciphertext, header, token)?,
            AuthTokens::Multi {
                cipher_text_token,
                header_token,
            } => {
                self.verify_multi_header_token(header, header_token)?;
                self.verify_multi_cipher_text_token(ciphertext, header, cipher_text_token)?;
            }
        }

        self.verify_key_identity(header)?;

        let mut plaintext = ciphertext.to_vec();
        aes_256_ctr(&self.text_key, &self.iv, &mut plaintext)?;
        if plaintext.len() != ciphertext.len() {
            return Err(CipherError::EncryptOps(format!(
                "decrypted {} of {} bytes",
                plaintext.len(),
                ciphertext.len()
            )));
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_decrypt(self.usage, ciphertext.len(), started.elapsed());
        }
        Ok(plaintext)
    }

    fn verify_single_token(
        &self,
        ciphertext: &[u8],
        header: &EncryptHeader,
        token: &[u8; AUTH_TOKEN_SIZE],
    ) -> CipherResult<()> {
        let header_bytes = header.encode_for_auth();
        let matched = self.header_key()?.with_live_cipher(|key| {
            verify_auth_token(key, &[ciphertext, &header_bytes[..]], token)
        })?;
        if !matched {
            warn!(
                domain_id = header.cipher_text_details.domain_id,
                usage = %self.usage,
                "single auth token mismatch"
            );
            return Err(CipherError::HeaderAuthTokenMismatch(
                "single auth token".into(),
            ));
        }
        Ok(())
    }

    fn verify_multi_header_token(
        &self,
        header: &EncryptHeader,
        header_token: &[u8; AUTH_TOKEN_SIZE],
    ) -> CipherResult<()> {
        let header_bytes = header.encode_for_auth();
        let matched = self
            .header_key()?
            .with_live_cipher(|key| verify_auth_token(key, &[&header_bytes[..]], header_token))?;
        if !matched {
            warn!(
                domain_id = header.cipher_text_details.domain_id,
                usage = %self.usage,
                "header auth token mismatch"
            );
            return Err(CipherError::HeaderAuthTokenMismatch(
                "header auth token".into(),
            ));
        }
        Ok(())
    }

    fn verify_multi_cipher_text_token(
        &self,
        ciphertext: &[u8],
        header: &EncryptHeader,
        cipher_text_token: &[u8; AUTH_TOKEN_SIZE],
    ) -> CipherResult<()> {
        let salt = header.cipher_text_details.salt.to_le_bytes();
        if !verify_auth_token(&salt, &[ciphertext], cipher_text_token)? {
            warn!(
                domain_id = header.cipher_text_details.domain_id,
                usage = %self.usage,
                "cipher text auth token mismatch"
            );
            return Err(CipherError::HeaderAuthTokenMismatch(
                "cipher text auth token".into(),
            ));
        }
        Ok(())
    }

    fn verify_key_identity(&self, header: &EncryptHeader) -> CipherResult<()> {
        if !header.cipher_text_details.matches(&self.text_key) {
            return Err(CipherError::EncryptOps(format!(
                "text cipher key {:?} does not match header {:?}",
                (self.text_key.domain_id(), self.text_key.base_cipher_id()),
                header.cipher_text_details
            )));
        }
        if header.auth_token_mode() != EncryptAuthTokenMode::None
            && !header.cipher_header_details.matches(self.header_key()?)
        {
            return Err(CipherError::EncryptOps(format!(
                "header cipher key does not match header {:?}",
                header.cipher_header_details
            )));
        }
        Ok(())
    }

    fn header_key(&self) -> CipherResult<&CipherKey> {
        self.header_key
            .as_deref()
            .ok_or_else(|| CipherError::EncryptOps("missing header cipher key".into()))
    }
}
