//! Datagram framing: plaintext messages and sealed frames.
//!
//! Once a peer has crypto state, every protocol message travels as
//! `base64(nonce || ciphertext)`. The base64 alphabet has no `:`, so a
//! sealed frame can be told apart from a plaintext message without
//! trial decryption. Key-exchange messages are always plaintext.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rudp_crypto::aead::SEAL_OVERHEAD;
use rudp_crypto::{CryptoContext, SessionKey};

use crate::codec::{DELIMITER, Message, tag};
use crate::error::{DecodeError, ProtocolError, Result};

/// Whether `datagram` is a sealed frame.
///
/// A bare tag such as `CLOSE` is a plaintext message missing its fields,
/// not a frame.
#[must_use]
pub fn is_sealed(datagram: &[u8]) -> bool {
    !datagram.is_empty()
        && !datagram.contains(&DELIMITER)
        && !tag::ALL.iter().any(|t| datagram == t.as_bytes())
}

/// Size on the wire of a message whose plaintext encoding is `plain_len`
/// bytes.
#[must_use]
pub fn framed_len(plain_len: usize, sealed: bool) -> usize {
    if sealed {
        (plain_len + SEAL_OVERHEAD).div_ceil(3) * 4
    } else {
        plain_len
    }
}

/// Encode `message`, sealing it when a key is given.
///
/// # Errors
///
/// Returns `ProtocolError::Crypto` if sealing fails.
pub fn encode(message: &Message, key: Option<&SessionKey>) -> Result<Vec<u8>> {
    let plain = message.encode();
    match key {
        Some(key) => Ok(STANDARD.encode(key.seal(&plain)?).into_bytes()),
        None => Ok(plain),
    }
}

/// Encode and enforce the datagram limit.
///
/// # Errors
///
/// Returns `ProtocolError::UnitTooLarge` if the frame exceeds `limit`.
pub fn encode_bounded(message: &Message, key: Option<&SessionKey>, limit: usize) -> Result<Vec<u8>> {
    let frame = encode(message, key)?;
    if frame.len() > limit {
        return Err(ProtocolError::UnitTooLarge {
            size: frame.len(),
            limit,
        });
    }
    Ok(frame)
}

/// Open a sealed frame and decode the message inside.
///
/// # Errors
///
/// Returns `ProtocolError::DecryptFailure` if the frame is not valid base64
/// or does not authenticate, and `ProtocolError::Malformed` if the
/// plaintext does not decode.
pub fn open(datagram: &[u8], ctx: &CryptoContext) -> Result<Message> {
    let sealed = STANDARD
        .decode(datagram)
        .map_err(|_| ProtocolError::DecryptFailure)?;
    let plain = ctx.open(&sealed).map_err(|_| ProtocolError::DecryptFailure)?;
    let message = Message::decode(&plain)?;
    if message.is_key_exchange() {
        return Err(DecodeError::UnknownTag(message.tag().to_string()).into());
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;
    use rudp_crypto::KeyPair;
    use std::time::Duration;

    fn context() -> CryptoContext {
        CryptoContext::new(
            KeyPair::generate(&mut OsRng).public_key(),
            KeyPair::generate(&mut OsRng).public_key(),
            SessionKey::generate(&mut OsRng),
            Duration::from_secs(300),
        )
    }

    #[test]
    fn test_classification() {
        assert!(!is_sealed(b"ACK:5"));
        assert!(!is_sealed(b"LIST_REQUEST"));
        for bare in [tag::OPEN, tag::ACK, tag::DATA, tag::CLOSE, tag::KEY_OFFER] {
            assert!(!is_sealed(bare.as_bytes()), "{bare}");
        }
        assert!(!is_sealed(b""));
        assert!(is_sealed(b"QUJDREVGR0g="));
    }

    #[test]
    fn test_sealed_roundtrip() {
        let ctx = context();
        let msg = Message::Data {
            seq: 102,
            payload: b"hello:world".to_vec(),
        };
        let frame = encode(&msg, Some(&ctx.sealing_key())).unwrap();
        assert!(is_sealed(&frame));
        assert_eq!(frame.len(), framed_len(msg.encode().len(), true));
        assert_eq!(open(&frame, &ctx).unwrap(), msg);
    }

    #[test]
    fn test_plain_passthrough() {
        let msg = Message::Ack { seq: 9 };
        assert_eq!(encode(&msg, None).unwrap(), b"ACK:9");
        assert_eq!(framed_len(5, false), 5);
    }

    #[test]
    fn test_wrong_key_is_decrypt_failure() {
        let frame = encode(&Message::Close { seq: 3 }, Some(&context().sealing_key())).unwrap();
        assert!(matches!(
            open(&frame, &context()),
            Err(ProtocolError::DecryptFailure)
        ));
    }

    #[test]
    fn test_garbage_is_decrypt_failure() {
        assert!(matches!(
            open(b"!!!!", &context()),
            Err(ProtocolError::DecryptFailure)
        ));
        assert!(matches!(
            open(b"AAAA", &context()),
            Err(ProtocolError::DecryptFailure)
        ));
    }

    #[test]
    fn test_sealed_key_exchange_rejected() {
        let ctx = context();
        let msg = Message::PublicKey {
            public_key: *ctx.remote_public(),
        };
        let frame = encode(&msg, Some(&ctx.sealing_key())).unwrap();
        assert!(matches!(open(&frame, &ctx), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_bounded_encode() {
        let msg = Message::Data {
            seq: 1,
            payload: vec![b'x'; 100],
        };
        assert!(encode_bounded(&msg, None, 200).is_ok());
        assert!(matches!(
            encode_bounded(&msg, None, 64),
            Err(ProtocolError::UnitTooLarge { limit: 64, .. })
        ));
    }
}
