use thiserror::Error;

use crate::types::{BaseCipherId, EncryptDomainId};

pub type CipherResult<T> = Result<T, CipherError>;

#[derive(Debug, Clone, Error)]
pub enum CipherError {
    #[error("invalid encrypt domain id: {0}")]
    InvalidDomainId(EncryptDomainId),

    #[error("invalid encrypt cipher key id: {0}")]
    InvalidCipherKeyId(BaseCipherId),

    #[error("cipher key update not permitted: domain={domain_id} base_cipher_id={base_cipher_id}")]
    KeyUpdateNotPermitted {
        domain_id: EncryptDomainId,
        base_cipher_id: BaseCipherId,
    },

    #[error("invalid base cipher length: {0} bytes")]
    InvalidBaseCipherLength(usize),

    #[error("invalid cipher key timestamps: refresh_at={refresh_at} expire_at={expire_at}")]
    InvalidKeyTimestamps { refresh_at: i64, expire_at: i64 },

    #[error("encryption ops error: {0}")]
    EncryptOps(String),

    #[error("encrypt header metadata mismatch: {0}")]
    HeaderMetadataMismatch(String),

    #[error("encrypt header authtoken mismatch: {0}")]
    HeaderAuthTokenMismatch(String),

    #[error("config error: {0}")]
    Config(String),
}
