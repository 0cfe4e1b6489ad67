//! blobcipher-crypto: encryption at rest for opaque blobs
//!
//! Key hierarchy:
//! ```text
//! Base cipher (external key manager, <= 32 bytes, per (domain, base_cipher_id))
//!   └── Derived key = HMAC-SHA256(key=base, msg=base || salt)   (one per salt)
//!         ├── Payload: AES-256-CTR (key=derived text key, iv=random 128-bit)
//!         └── Header auth: HMAC-SHA256 keyed by a key from ENCRYPT_HEADER_DOMAIN_ID
//! ```
//!
//! Read path: decode the 136-byte [`EncryptHeader`], resolve the keys it names
//! through the [`CipherKeyCache`] (or re-insert them from the key manager with
//! the recorded salt), then hand keys + header + ciphertext to a [`Decryptor`].

pub mod cache;
pub mod clock;
pub mod decrypt;
pub mod encrypt;
pub mod header;
pub mod kdf;
pub mod keys;
pub mod metrics;
pub mod random;
pub mod scrub;

pub use cache::{CipherKeyCache, DomainKeyIndex};
pub use clock::{Clock, ManualClock, SystemClock};
pub use decrypt::{verify_header_metadata, Decryptor};
pub use encrypt::{EncryptedBlob, Encryptor};
pub use header::{AuthTokens, CipherDetails, EncryptHeader, HeaderFlags, ENCRYPT_HEADER_SIZE};
pub use kdf::derive_cipher_key;
pub use keys::CipherKey;
pub use metrics::CipherMetrics;
pub use random::RandomSource;
pub use scrub::{install_panic_scrubber, ScrubGuard};

pub use blobcipher_core::{CipherError, CipherResult};
