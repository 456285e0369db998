//! BLAKE3 key derivation.

use crate::aead::SessionKey;
use crate::x25519::{PublicKey, SharedSecret};

/// Context string for the key-encryption key used to wrap session keys.
pub const KEY_WRAP_CONTEXT: &str = "rudp 2024 session key wrap v1";

/// BLAKE3 key derivation bound to a context string.
#[derive(Debug, Clone, Copy)]
pub struct Kdf {
    context: &'static str,
}

impl Kdf {
    /// Create a KDF with a specific context string.
    #[must_use]
    pub fn new(context: &'static str) -> Self {
        Self { context }
    }

    /// Derive a 32-byte key from the concatenation of `parts`.
    #[must_use]
    pub fn derive_key(&self, parts: &[&[u8]]) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new_derive_key(self.context);
        for part in parts {
            hasher.update(part);
        }
        *hasher.finalize().as_bytes()
    }
}

/// Key-encryption key for a single KEY_GRANT.
///
/// Both public keys are bound into the derivation so a grant cannot be
/// replayed towards a different initiator.
#[must_use]
pub fn key_wrapping_key(
    shared: &SharedSecret,
    initiator: &PublicKey,
    responder: &PublicKey,
) -> SessionKey {
    let kek = Kdf::new(KEY_WRAP_CONTEXT).derive_key(&[
        shared.as_bytes(),
        initiator.as_bytes(),
        responder.as_bytes(),
    ]);
    SessionKey::new(kek)
}
