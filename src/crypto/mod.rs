pub mod client_keys;
pub mod fernet;

pub use client_keys::{ClientKey, ClientKeyStore, WrappedClientKey};
pub use fernet::Fernet;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key")]
    InvalidKey,
    #[error("invalid token")]
    InvalidToken,
    #[error("invalid token signature")]
    BadSignature,
    #[error("token expired (excessively far in the past)")]
    Expired,
    #[error("token from the future (excessively far in the future)")]
    FromFuture,
    #[error("failed to decrypt token")]
    Decrypt,
    #[error("key exchange failed: {0}")]
    KeyExchange(String),
    #[error("key storage: {0}")]
    Storage(String),
}
