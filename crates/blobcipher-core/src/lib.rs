pub mod config;
pub mod error;
pub mod types;

pub use error::{CipherError, CipherResult};
pub use types::{
    BaseCipherId, EncryptAuthTokenMode, EncryptCipherMode, EncryptDomainId, RandomSalt, UsageType,
};
