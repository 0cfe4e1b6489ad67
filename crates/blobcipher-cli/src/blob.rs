//! Blob file format: the encoded encryption header followed by the ciphertext.

use anyhow::{Context, Result};
use std::path::Path;

use blobcipher_crypto::{EncryptHeader, EncryptedBlob, ENCRYPT_HEADER_SIZE};

pub fn to_bytes(blob: &EncryptedBlob) -> Vec<u8> {
    let mut out = Vec::with_capacity(ENCRYPT_HEADER_SIZE + blob.ciphertext.len());
    out.extend_from_slice(&blob.header.encode());
    out.extend_from_slice(&blob.ciphertext);
    out
}

/// Split a blob file into its decoded header and ciphertext.
pub fn from_bytes(bytes: &[u8]) -> Result<(EncryptHeader, &[u8])> {
    if bytes.len() < ENCRYPT_HEADER_SIZE {
        anyhow::bail!(
            "blob too short: {} bytes, header alone is {ENCRYPT_HEADER_SIZE}",
            bytes.len()
        );
    }
    let (header, ciphertext) = bytes.split_at(ENCRYPT_HEADER_SIZE);
    let header = EncryptHeader::decode(header).context("decoding encryption header")?;
    Ok((header, ciphertext))
}

pub async fn read(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("reading blob: {}", path.display()))
}

pub async fn write(path: &Path, blob: &EncryptedBlob) -> Result<()> {
    tokio::fs::write(path, to_bytes(blob))
        .await
        .with_context(|| format!("writing blob: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobcipher_core::types::{EncryptAuthTokenMode, UsageType, KEY_TIMESTAMP_INFINITE};
    use blobcipher_crypto::{CipherKey, Encryptor};
    use std::sync::Arc;

    fn sample_blob() -> EncryptedBlob {
        let key = Arc::new(
            CipherKey::derive(
                3,
                1,
                b"base",
                9,
                KEY_TIMESTAMP_INFINITE,
                KEY_TIMESTAMP_INFINITE,
            )
            .unwrap(),
        );
        Encryptor::new(key, None, [4u8; 16], EncryptAuthTokenMode::None, UsageType::Test)
            .unwrap()
            .encrypt(b"file contents")
            .unwrap()
    }

    #[test]
    fn test_layout() {
        let blob = sample_blob();
        let bytes = to_bytes(&blob);
        assert_eq!(bytes.len(), ENCRYPT_HEADER_SIZE + 13);

        let (header, ciphertext) = from_bytes(&bytes).unwrap();
        assert_eq!(header, blob.header);
        assert_eq!(ciphertext, blob.ciphertext.as_slice());
    }

    #[test]
    fn test_truncated_blob_rejected() {
        let bytes = to_bytes(&sample_blob());
        assert!(from_bytes(&bytes[..ENCRYPT_HEADER_SIZE - 1]).is_err());
    }

    #[tokio::test]
    async fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.enc");
        let blob = sample_blob();

        write(&path, &blob).await.unwrap();
        let bytes = read(&path).await.unwrap();
        let (header, _) = from_bytes(&bytes).unwrap();
        assert_eq!(header, blob.header);
    }
}
