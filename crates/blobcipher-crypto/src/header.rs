//! On-disk encryption header
//!
//! Fixed 136-byte packed layout, little-endian integers:
//! ```text
//! [0]       size (= 136)
//! [1]       header version
//! [2]       encrypt mode (1 = AES-256-CTR)
//! [3]       auth token mode (0 = none, 1 = single, 2 = multi)
//! [4..8]    reserved (zero)
//! [8..32]   cipher text key:   domain_id i64 | base_cipher_id u64 | salt u64
//! [32..56]  cipher header key: domain_id i64 | base_cipher_id u64 | salt u64
//! [56..72]  iv
//! [72..136] auth tokens
//!             single: token[32] | reserved[32]
//!             multi:  cipher_text_token[32] | header_token[32]
//! ```
//!
//! Size, version and encrypt mode are kept as raw bytes so a decryptor can
//! report tampering with them as a metadata mismatch.

use blobcipher_core::types::{
    BaseCipherId, EncryptAuthTokenMode, EncryptCipherMode, EncryptDomainId, RandomSalt,
    AES_256_IV_LENGTH, AUTH_TOKEN_SIZE, ENCRYPT_HEADER_VERSION, INVALID_ENCRYPT_CIPHER_KEY_ID,
    INVALID_ENCRYPT_DOMAIN_ID,
};
use blobcipher_core::{CipherError, CipherResult};
use serde::Serialize;

use crate::keys::CipherKey;

pub const ENCRYPT_HEADER_SIZE: usize = 136;

const FLAGS_RESERVED: std::ops::Range<usize> = 4..8;
const CIPHER_TEXT_DETAILS_OFFSET: usize = 8;
const CIPHER_HEADER_DETAILS_OFFSET: usize = 32;
const CIPHER_DETAILS_SIZE: usize = 24;
const IV_OFFSET: usize = 56;
const AUTH_TOKENS_OFFSET: usize = 72;
const SECOND_TOKEN_OFFSET: usize = AUTH_TOKENS_OFFSET + AUTH_TOKEN_SIZE;

/// Leading flag bytes of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeaderFlags {
    pub size: u8,
    pub header_version: u8,
    pub encrypt_mode: u8,
}

impl HeaderFlags {
    /// Flags written by the current encryptor.
    pub fn current() -> Self {
        Self {
            size: ENCRYPT_HEADER_SIZE as u8,
            header_version: ENCRYPT_HEADER_VERSION,
            encrypt_mode: EncryptCipherMode::Aes256Ctr as u8,
        }
    }
}

/// Identity of the cipher key used for one part of the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CipherDetails {
    pub domain_id: EncryptDomainId,
    pub base_cipher_id: BaseCipherId,
    pub salt: RandomSalt,
}

impl Default for CipherDetails {
    fn default() -> Self {
        Self {
            domain_id: INVALID_ENCRYPT_DOMAIN_ID,
            base_cipher_id: INVALID_ENCRYPT_CIPHER_KEY_ID,
            salt: 0,
        }
    }
}

impl CipherDetails {
    pub fn of(key: &CipherKey) -> Self {
        Self {
            domain_id: key.domain_id(),
            base_cipher_id: key.base_cipher_id(),
            salt: key.salt(),
        }
    }

    pub fn matches(&self, key: &CipherKey) -> bool {
        *self == Self::of(key)
    }

    fn write(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.domain_id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.base_cipher_id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.salt.to_le_bytes());
    }

    fn read(buf: &[u8]) -> Self {
        Self {
            domain_id: i64::from_le_bytes(le8(&buf[0..8])),
            base_cipher_id: u64::from_le_bytes(le8(&buf[8..16])),
            salt: u64::from_le_bytes(le8(&buf[16..24])),
        }
    }
}

/// The auth token region, interpreted by auth token mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthTokens {
    None,
    Single {
        token: [u8; AUTH_TOKEN_SIZE],
    },
    Multi {
        cipher_text_token: [u8; AUTH_TOKEN_SIZE],
        header_token: [u8; AUTH_TOKEN_SIZE],
    },
}

impl AuthTokens {
    pub fn mode(&self) -> EncryptAuthTokenMode {
        match self {
            AuthTokens::None => EncryptAuthTokenMode::None,
            AuthTokens::Single { .. } => EncryptAuthTokenMode::Single,
            AuthTokens::Multi { .. } => EncryptAuthTokenMode::Multi,
        }
    }

    /// Same mode with every token slot zeroed.
    pub fn zeroed(mode: EncryptAuthTokenMode) -> Self {
        match mode {
            EncryptAuthTokenMode::None => AuthTokens::None,
            EncryptAuthTokenMode::Single => AuthTokens::Single {
                token: [0u8; AUTH_TOKEN_SIZE],
            },
            EncryptAuthTokenMode::Multi => AuthTokens::Multi {
                cipher_text_token: [0u8; AUTH_TOKEN_SIZE],
                header_token: [0u8; AUTH_TOKEN_SIZE],
            },
        }
    }
}

/// Per-blob encryption header. See the module docs for the byte layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptHeader {
    pub flags: HeaderFlags,
    pub cipher_text_details: CipherDetails,
    pub cipher_header_details: CipherDetails,
    pub iv: [u8; AES_256_IV_LENGTH],
    pub auth_tokens: AuthTokens,
}

impl EncryptHeader {
    pub fn auth_token_mode(&self) -> EncryptAuthTokenMode {
        self.auth_tokens.mode()
    }

    /// Keys a reader must resolve to decrypt: the text key, plus the header
    /// key when the header carries auth tokens.
    pub fn key_refs(&self) -> Vec<CipherDetails> {
        match self.auth_tokens {
            AuthTokens::None => vec![self.cipher_text_details],
            _ => vec![self.cipher_text_details, self.cipher_header_details],
        }
    }

    pub fn encode(&self) -> [u8; ENCRYPT_HEADER_SIZE] {
        let mut buf = [0u8; ENCRYPT_HEADER_SIZE];
        buf[0] = self.flags.size;
        buf[1] = self.flags.header_version;
        buf[2] = self.flags.encrypt_mode;
        buf[3] = self.auth_tokens.mode() as u8;
        self.cipher_text_details.write(
            &mut buf[CIPHER_TEXT_DETAILS_OFFSET..CIPHER_TEXT_DETAILS_OFFSET + CIPHER_DETAILS_SIZE],
        );
        self.cipher_header_details.write(
            &mut buf
                [CIPHER_HEADER_DETAILS_OFFSET..CIPHER_HEADER_DETAILS_OFFSET + CIPHER_DETAILS_SIZE],
        );
        buf[IV_OFFSET..IV_OFFSET + AES_256_IV_LENGTH].copy_from_slice(&self.iv);

        match &self.auth_tokens {
            AuthTokens::None => {}
            AuthTokens::Single { token } => {
                buf[AUTH_TOKENS_OFFSET..SECOND_TOKEN_OFFSET].copy_from_slice(token);
            }
            AuthTokens::Multi {
                cipher_text_token,
                header_token,
            } => {
                buf[AUTH_TOKENS_OFFSET..SECOND_TOKEN_OFFSET].copy_from_slice(cipher_text_token);
                buf[SECOND_TOKEN_OFFSET..ENCRYPT_HEADER_SIZE].copy_from_slice(header_token);
            }
        }
        buf
    }

    /// Decode a header. Only layout errors are reported here; version and
    /// mode checks happen at decrypt time.
    pub fn decode(bytes: &[u8]) -> CipherResult<Self> {
        if bytes.len() != ENCRYPT_HEADER_SIZE {
            return Err(CipherError::HeaderMetadataMismatch(format!(
                "header is {} bytes (expected {ENCRYPT_HEADER_SIZE})",
                bytes.len()
            )));
        }
        if bytes[FLAGS_RESERVED].iter().any(|b| *b != 0) {
            return Err(CipherError::HeaderMetadataMismatch(
                "reserved flag bytes are not zero".into(),
            ));
        }
        let mode = EncryptAuthTokenMode::try_from(bytes[3]).map_err(|m| {
            CipherError::HeaderMetadataMismatch(format!("unknown auth token mode {m}"))
        })?;

        let first = token(&bytes[AUTH_TOKENS_OFFSET..SECOND_TOKEN_OFFSET]);
        let second = token(&bytes[SECOND_TOKEN_OFFSET..ENCRYPT_HEADER_SIZE]);
        let auth_tokens = match mode {
            EncryptAuthTokenMode::None => {
                if first.iter().chain(second.iter()).any(|b| *b != 0) {
                    return Err(CipherError::HeaderMetadataMismatch(
                        "auth token region set without an auth token mode".into(),
                    ));
                }
                AuthTokens::None
            }
            EncryptAuthTokenMode::Single => {
                if second.iter().any(|b| *b != 0) {
                    return Err(CipherError::HeaderMetadataMismatch(
                        "reserved auth token bytes are not zero".into(),
                    ));
                }
                AuthTokens::Single { token: first }
            }
            EncryptAuthTokenMode::Multi => AuthTokens::Multi {
                cipher_text_token: first,
                header_token: second,
            },
        };

        let mut iv = [0u8; AES_256_IV_LENGTH];
        iv.copy_from_slice(&bytes[IV_OFFSET..IV_OFFSET + AES_256_IV_LENGTH]);

        Ok(Self {
            flags: HeaderFlags {
                size: bytes[0],
                header_version: bytes[1],
                encrypt_mode: bytes[2],
            },
            cipher_text_details: CipherDetails::read(
                &bytes[CIPHER_TEXT_DETAILS_OFFSET..CIPHER_TEXT_DETAILS_OFFSET + CIPHER_DETAILS_SIZE],
            ),
            cipher_header_details: CipherDetails::read(
                &bytes[CIPHER_HEADER_DETAILS_OFFSET
                    ..CIPHER_HEADER_DETAILS_OFFSET + CIPHER_DETAILS_SIZE],
            ),
            iv,
            auth_tokens,
        })
    }

    /// Header bytes covered by the header auth token.
    ///
    /// Single mode zeroes the whole token region. Multi mode zeroes only the
    /// header token, so the cipher text token is itself authenticated.
    pub(crate) fn encode_for_auth(&self) -> [u8; ENCRYPT_HEADER_SIZE] {
        let mut buf = self.encode();
        match self.auth_tokens {
            AuthTokens::None => {}
            AuthTokens::Single { .. } => {
                buf[AUTH_TOKENS_OFFSET..ENCRYPT_HEADER_SIZE].fill(0);
            }
            AuthTokens::Multi { .. } => {
                buf[SECOND_TOKEN_OFFSET..ENCRYPT_HEADER_SIZE].fill(0);
            }
        }
        buf
    }
}

fn le8(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(bytes);
    out
}

fn token(bytes: &[u8]) -> [u8; AUTH_TOKEN_SIZE] {
    let mut out = [0u8; AUTH_TOKEN_SIZE];
    out.copy_from_slice(bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(auth_tokens: AuthTokens) -> EncryptHeader {
        EncryptHeader {
            flags: HeaderFlags::current(),
            cipher_text_details: CipherDetails {
                domain_id: 7,
                base_cipher_id: 100,
                salt: 0xDEAD_BEEF,
            },
            cipher_header_details: CipherDetails {
                domain_id: -2,
                base_cipher_id: 5,
                salt: 42,
            },
            iv: [0x11u8; AES_256_IV_LENGTH],
            auth_tokens,
        }
    }

    #[test]
    fn test_byte_layout() {
        let header = sample(AuthTokens::Multi {
            cipher_text_token: [0xAAu8; AUTH_TOKEN_SIZE],
            header_token: [0xBBu8; AUTH_TOKEN_SIZE],
        });
        let bytes = header.encode();

        assert_eq!(bytes.len(), 136);
        assert_eq!(&bytes[0..4], &[136, 1, 1, 2]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
        assert_eq!(&bytes[8..16], &7i64.to_le_bytes());
        assert_eq!(&bytes[16..24], &100u64.to_le_bytes());
        assert_eq!(&bytes[24..32], &0xDEAD_BEEFu64.to_le_bytes());
        assert_eq!(&bytes[32..40], &(-2i64).to_le_bytes());
        assert_eq!(&bytes[40..48], &5u64.to_le_bytes());
        assert_eq!(&bytes[48..56], &42u64.to_le_bytes());
        assert_eq!(&bytes[56..72], &[0x11u8; 16]);
        assert_eq!(&bytes[72..104], &[0xAAu8; 32]);
        assert_eq!(&bytes[104..136], &[0xBBu8; 32]);
    }

    #[test]
    fn test_decode_each_mode() {
        for tokens in [
            AuthTokens::None,
            AuthTokens::Single {
                token: [3u8; AUTH_TOKEN_SIZE],
            },
            AuthTokens::Multi {
                cipher_text_token: [4u8; AUTH_TOKEN_SIZE],
                header_token: [5u8; AUTH_TOKEN_SIZE],
            },
        ] {
            let header = sample(tokens);
            assert_eq!(EncryptHeader::decode(&header.encode()).unwrap(), header);
        }
    }

    #[test]
    fn test_decode_wrong_length() {
        let bytes = sample(AuthTokens::None).encode();
        let err = EncryptHeader::decode(&bytes[..135]).unwrap_err();
        assert!(matches!(err, CipherError::HeaderMetadataMismatch(_)));
    }

    #[test]
    fn test_decode_unknown_auth_mode() {
        let mut bytes = sample(AuthTokens::None).encode();
        bytes[3] = 7;
        let err = EncryptHeader::decode(&bytes).unwrap_err();
        assert!(matches!(err, CipherError::HeaderMetadataMismatch(_)));
    }

    #[test]
    fn test_decode_rejects_dirty_reserved() {
        let mut bytes = sample(AuthTokens::Single {
            token: [1u8; AUTH_TOKEN_SIZE],
        })
        .encode();
        bytes[120] = 1;
        assert!(EncryptHeader::decode(&bytes).is_err());

        let mut bytes = sample(AuthTokens::None).encode();
        bytes[5] = 1;
        assert!(EncryptHeader::decode(&bytes).is_err());
    }

    #[test]
    fn test_decode_keeps_raw_flags() {
        let mut bytes = sample(AuthTokens::None).encode();
        bytes[1] = 9;
        let header = EncryptHeader::decode(&bytes).unwrap();
        assert_eq!(header.flags.header_version, 9);
    }

    #[test]
    fn test_encode_for_auth_zeroes_token_slots() {
        let single = sample(AuthTokens::Single {
            token: [9u8; AUTH_TOKEN_SIZE],
        });
        assert!(single.encode_for_auth()[72..].iter().all(|b| *b == 0));

        let multi = sample(AuthTokens::Multi {
            cipher_text_token: [8u8; AUTH_TOKEN_SIZE],
            header_token: [9u8; AUTH_TOKEN_SIZE],
        });
        let bytes = multi.encode_for_auth();
        assert_eq!(&bytes[72..104], &[8u8; 32]);
        assert!(bytes[104..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_key_refs() {
        assert_eq!(sample(AuthTokens::None).key_refs().len(), 1);
        let refs = sample(AuthTokens::zeroed(EncryptAuthTokenMode::Multi)).key_refs();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[1].domain_id, -2);
    }
}
