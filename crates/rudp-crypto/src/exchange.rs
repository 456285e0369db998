//! Session-key exchange.
//!
//! ```text
//! Initiator                                  Responder
//!   KEY_OFFER(initiator_pk)        ─────▶
//!                                  ◀─────    KEY_GRANT(responder_pk, wrap(session_key))
//!   unwrap(session_key)
//! ```
//!
//! The session key is chosen by the responder and wrapped with a
//! key-encryption key derived from `DH(responder, initiator)`. Rekeying
//! repeats the same round with the initiator's existing key pair.

use rand_core::{CryptoRng, RngCore};

use crate::CryptoError;
use crate::aead::SessionKey;
use crate::kdf::key_wrapping_key;
use crate::x25519::{KeyPair, PublicKey};

/// Initiating side of the exchange.
#[derive(Debug, Clone)]
pub struct Initiator {
    keys: KeyPair,
}

impl Initiator {
    /// Start an exchange with a freshly generated key pair.
    pub fn new<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            keys: KeyPair::generate(rng),
        }
    }

    /// Start an exchange from an existing key pair.
    #[must_use]
    pub fn from_keys(keys: KeyPair) -> Self {
        Self { keys }
    }

    /// Key carried in KEY_OFFER and PUBLIC_KEY.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    /// Recover the session key from a KEY_GRANT.
    ///
    /// # Errors
    ///
    /// Fails if the responder key is low-order or the wrapped key does not
    /// authenticate.
    pub fn accept_grant(
        &self,
        responder: &PublicKey,
        wrapped_key: &[u8],
    ) -> Result<SessionKey, CryptoError> {
        let shared = self.keys.exchange(responder)?;
        let kek = key_wrapping_key(&shared, &self.keys.public_key(), responder);
        let raw = kek.open(wrapped_key)?;
        SessionKey::from_slice(&raw)
    }
}

/// Result of answering an offer: the wire fields plus the key to install.
#[derive(Debug)]
pub struct Grant {
    /// Responder public key for KEY_GRANT.
    pub public_key: PublicKey,
    /// `nonce || wrapped session key` for KEY_GRANT.
    pub wrapped_key: Vec<u8>,
    /// Session key the responder installs locally.
    pub session_key: SessionKey,
}

/// Responding side of the exchange.
#[derive(Debug, Clone)]
pub struct Responder {
    keys: KeyPair,
}

impl Responder {
    /// Respond using `keys` for every peer.
    #[must_use]
    pub fn new(keys: KeyPair) -> Self {
        Self { keys }
    }

    /// Responder public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    /// Generate a new session key for `initiator` and wrap it.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidPublicKey` for low-order initiator keys.
    pub fn grant<R: RngCore + CryptoRng>(
        &self,
        initiator: &PublicKey,
        rng: &mut R,
    ) -> Result<Grant, CryptoError> {
        let shared = self.keys.exchange(initiator)?;
        let kek = key_wrapping_key(&shared, initiator, &self.keys.public_key());
        let session_key = SessionKey::generate(rng);
        let wrapped_key = kek.seal(session_key.as_bytes())?;

        tracing::debug!(key = %session_key.fingerprint(), "Issued session key");

        Ok(Grant {
            public_key: self.keys.public_key(),
            wrapped_key,
            session_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn test_offer_grant_agree() {
        let initiator = Initiator::new(&mut OsRng);
        let responder = Responder::new(KeyPair::generate(&mut OsRng));

        let grant = responder.grant(&initiator.public_key(), &mut OsRng).unwrap();
        let key = initiator
            .accept_grant(&grant.public_key, &grant.wrapped_key)
            .unwrap();

        assert_eq!(key, grant.session_key);
    }

    #[test]
    fn test_grant_for_other_initiator_fails() {
        let initiator = Initiator::new(&mut OsRng);
        let eavesdropper = Initiator::new(&mut OsRng);
        let responder = Responder::new(KeyPair::generate(&mut OsRng));

        let grant = responder.grant(&initiator.public_key(), &mut OsRng).unwrap();
        assert!(
            eavesdropper
                .accept_grant(&grant.public_key, &grant.wrapped_key)
                .is_err()
        );
    }

    #[test]
    fn test_rekey_rounds_produce_distinct_keys() {
        let initiator = Initiator::new(&mut OsRng);
        let responder = Responder::new(KeyPair::generate(&mut OsRng));

        let first = responder.grant(&initiator.public_key(), &mut OsRng).unwrap();
        let second = responder.grant(&initiator.public_key(), &mut OsRng).unwrap();

        let k1 = initiator
            .accept_grant(&first.public_key, &first.wrapped_key)
            .unwrap();
        let k2 = initiator
            .accept_grant(&second.public_key, &second.wrapped_key)
            .unwrap();
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_low_order_offer_rejected() {
        let responder = Responder::new(KeyPair::generate(&mut OsRng));
        let zero = PublicKey::from_bytes([0u8; 32]);
        assert!(matches!(
            responder.grant(&zero, &mut OsRng),
            Err(CryptoError::InvalidPublicKey)
        ));
    }

    #[test]
    fn test_garbage_wrapped_key() {
        let initiator = Initiator::new(&mut OsRng);
        let responder = Responder::new(KeyPair::generate(&mut OsRng));
        assert!(
            initiator
                .accept_grant(&responder.public_key(), &[0u8; 72])
                .is_err()
        );
    }
}
