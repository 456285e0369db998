//! # rudp Crypto
//!
//! Key exchange and symmetric sealing for rudp sessions.
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm |
//! |----------|-----------|
//! | Key Exchange | X25519 |
//! | Session key wrap | BLAKE3 derive-key + XChaCha20-Poly1305 |
//! | Message sealing | XChaCha20-Poly1305, random 192-bit nonce |
//!
//! The responder picks the session key; the initiator owns the key pair and
//! drives rekeying once a key reaches its lifetime.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod context;
pub mod error;
pub mod exchange;
pub mod kdf;
pub mod x25519;

pub use aead::SessionKey;
pub use context::CryptoContext;
pub use error::CryptoError;
pub use exchange::{Grant, Initiator, Responder};
pub use x25519::{KeyPair, PublicKey};
