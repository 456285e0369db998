//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Sealed buffer too short to hold a nonce and tag
    #[error("sealed message truncated: {0} bytes")]
    Truncated(usize),

    /// Peer public key is a low-order point
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Rekey requested with a public key other than the one on record
    #[error("public key does not match the key bound to this session")]
    KeyMismatch,
}
