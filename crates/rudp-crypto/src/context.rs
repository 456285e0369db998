//! Per-peer crypto state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::CryptoError;
use crate::aead::SessionKey;
use crate::x25519::PublicKey;

/// Crypto state bound to one peer.
///
/// The current key is held behind an `Arc` so that a caller can take a
/// snapshot with [`CryptoContext::sealing_key`] and seal a whole message
/// under it while a rekey replaces the slot. The key that was current
/// before the last rekey is kept for opening frames that were already in
/// flight.
#[derive(Debug, Clone)]
pub struct CryptoContext {
    local_public: PublicKey,
    remote_public: PublicKey,
    current: Arc<SessionKey>,
    previous: Option<Arc<SessionKey>>,
    established_at: Instant,
    lifetime: Duration,
    generation: u32,
}

impl CryptoContext {
    /// Create a context for a freshly exchanged key.
    #[must_use]
    pub fn new(
        local_public: PublicKey,
        remote_public: PublicKey,
        key: SessionKey,
        lifetime: Duration,
    ) -> Self {
        Self {
            local_public,
            remote_public,
            current: Arc::new(key),
            previous: None,
            established_at: Instant::now(),
            lifetime,
            generation: 0,
        }
    }

    /// Our public key.
    #[must_use]
    pub fn local_public(&self) -> &PublicKey {
        &self.local_public
    }

    /// Peer public key.
    #[must_use]
    pub fn remote_public(&self) -> &PublicKey {
        &self.remote_public
    }

    /// Snapshot of the key that new messages must be sealed under.
    #[must_use]
    pub fn sealing_key(&self) -> Arc<SessionKey> {
        Arc::clone(&self.current)
    }

    /// Seal with the current key.
    ///
    /// # Errors
    ///
    /// Propagates AEAD failures.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.current.seal(plaintext)
    }

    /// Open with the current key, falling back to the previous one.
    ///
    /// # Errors
    ///
    /// Returns the current key's error if neither key authenticates.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self.current.open(sealed) {
            Ok(plain) => Ok(plain),
            Err(err) => match &self.previous {
                Some(previous) => previous.open(sealed).map_err(|_| err),
                None => Err(err),
            },
        }
    }

    /// Replace the current key after a completed rekey round.
    pub fn install(&mut self, key: SessionKey) {
        let old = std::mem::replace(&mut self.current, Arc::new(key));
        self.previous = Some(old);
        self.established_at = Instant::now();
        self.generation = self.generation.saturating_add(1);
        tracing::info!(
            generation = self.generation,
            key = %self.current.fingerprint(),
            "Session key rotated"
        );
    }

    /// Check that a rekey request comes from the key bound to this context.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::KeyMismatch` for any other key.
    pub fn verify_remote(&self, offered: &PublicKey) -> Result<(), CryptoError> {
        if offered == &self.remote_public {
            Ok(())
        } else {
            Err(CryptoError::KeyMismatch)
        }
    }

    /// Age of the current key.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.established_at.elapsed()
    }

    /// Whether the current key has reached its lifetime.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.age() >= self.lifetime
    }

    /// Number of completed rekeys.
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}
