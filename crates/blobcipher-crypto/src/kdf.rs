//! HMAC-SHA256 primitives: cipher key derivation and header auth tokens

use blobcipher_core::types::{RandomSalt, AES_256_KEY_LENGTH, AUTH_TOKEN_SIZE};
use blobcipher_core::{CipherError, CipherResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

type HmacSha256 = Hmac<Sha256>;

/// Derive a 256-bit AES key from a base cipher and salt.
///
/// `derived = HMAC-SHA256(key = base_cipher, msg = base_cipher || salt_le)`.
/// Should the digest ever be shorter than the AES key, the tail is filled
/// from the start of the message buffer.
pub fn derive_cipher_key(
    base_cipher: &[u8],
    salt: RandomSalt,
) -> CipherResult<Zeroizing<[u8; AES_256_KEY_LENGTH]>> {
    let mut message = Zeroizing::new(Vec::with_capacity(base_cipher.len() + 8));
    message.extend_from_slice(base_cipher);
    message.extend_from_slice(&salt.to_le_bytes());

    let mut mac = <HmacSha256 as Mac>::new_from_slice(base_cipher)
        .map_err(|e| CipherError::EncryptOps(format!("HMAC init for key derivation: {e}")))?;
    mac.update(&message);
    let mut digest = mac.finalize().into_bytes();

    let mut derived = Zeroizing::new([0u8; AES_256_KEY_LENGTH]);
    let copied = digest.len().min(AES_256_KEY_LENGTH);
    derived[..copied].copy_from_slice(&digest[..copied]);
    if copied < AES_256_KEY_LENGTH {
        let fill = (AES_256_KEY_LENGTH - copied).min(message.len());
        derived[copied..copied + fill].copy_from_slice(&message[..fill]);
    }
    digest.as_mut_slice().zeroize();

    Ok(derived)
}

/// HMAC-SHA256 over the concatenation of `parts`.
pub fn compute_auth_token(key: &[u8], parts: &[&[u8]]) -> CipherResult<[u8; AUTH_TOKEN_SIZE]> {
    let mac = keyed_mac(key, parts)?;
    let digest = mac.finalize().into_bytes();

    let mut token = [0u8; AUTH_TOKEN_SIZE];
    token.copy_from_slice(&digest[..AUTH_TOKEN_SIZE]);
    Ok(token)
}

/// Recompute the HMAC over `parts` and compare it to `expected` in constant time.
pub fn verify_auth_token(
    key: &[u8],
    parts: &[&[u8]],
    expected: &[u8; AUTH_TOKEN_SIZE],
) -> CipherResult<bool> {
    let mac = keyed_mac(key, parts)?;
    Ok(mac.verify_slice(expected).is_ok())
}

fn keyed_mac(key: &[u8], parts: &[&[u8]]) -> CipherResult<HmacSha256> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| CipherError::EncryptOps(format!("HMAC init for auth token: {e}")))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_deterministic() {
        let base = [7u8; 32];
        let a = derive_cipher_key(&base, 99).unwrap();
        let b = derive_cipher_key(&base, 99).unwrap();
        assert_eq!(*a, *b, "derivation must be deterministic");
    }

    #[test]
    fn test_derivation_differs_by_salt() {
        let base = [7u8; 32];
        let a = derive_cipher_key(&base, 1).unwrap();
        let b = derive_cipher_key(&base, 2).unwrap();
        assert_ne!(*a, *b, "different salts must produce different keys");
    }

    #[test]
    fn test_derivation_transforms_base() {
        let base = [0x5Au8; 32];
        let derived = derive_cipher_key(&base, 0).unwrap();
        assert_ne!(*derived, base);
    }

    #[test]
    fn test_derivation_matches_hmac_definition() {
        let base = b"short-base";
        let salt: RandomSalt = 0x0102_0304_0506_0708;

        let mut msg = base.to_vec();
        msg.extend_from_slice(&salt.to_le_bytes());
        let expected = compute_auth_token(base, &[&msg[..]]).unwrap();

        let derived = derive_cipher_key(base, salt).unwrap();
        assert_eq!(*derived, expected);
    }

    #[test]
    fn test_auth_token_parts_concatenate() {
        let key = b"header-key";
        let whole = compute_auth_token(key, &[&b"abcdef"[..]]).unwrap();
        let split = compute_auth_token(key, &[&b"abc"[..], &b"def"[..]]).unwrap();
        assert_eq!(whole, split);
    }

    #[test]
    fn test_verify_auth_token() {
        let key = b"k";
        let token = compute_auth_token(key, &[&b"payload"[..]]).unwrap();

        assert!(verify_auth_token(key, &[&b"payload"[..]], &token).unwrap());
        assert!(!verify_auth_token(key, &[&b"payloae"[..]], &token).unwrap());
        assert!(!verify_auth_token(b"other", &[&b"payload"[..]], &token).unwrap());
    }
}
