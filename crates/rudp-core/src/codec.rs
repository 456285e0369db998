//! Message codec.
//!
//! Wire format is ASCII, fields joined by `:`:
//!
//! ```text
//! OPEN:<resource>:<seq>
//! OPEN_ACK:<resource>:<seq>
//! ACK:<seq>
//! DATA:<seq>:<length>:<payload>     payload is the raw remainder, may contain ':'
//! CLOSE:<seq>
//! ERROR:<message>
//! LIST_REQUEST
//! LIST_RESPONSE:<listing>
//! KEY_OFFER:<base64 public key>
//! KEY_GRANT:<base64 public key>:<base64 wrapped session key>
//! PUBLIC_KEY:<base64 public key>
//! ```
//!
//! A DATA unit with length 0 is the end-of-data sentinel and is written as
//! `DATA:<seq>:0:END`.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rudp_crypto::PublicKey;
use rudp_crypto::x25519::PUBLIC_KEY_SIZE;

use crate::error::DecodeError;

/// Field delimiter.
pub const DELIMITER: u8 = b':';

/// Payload of the end-of-data sentinel.
pub const END_MARKER: &[u8] = b"END";

/// Message tags.
pub mod tag {
    /// Connection open request
    pub const OPEN: &str = "OPEN";
    /// Connection open reply
    pub const OPEN_ACK: &str = "OPEN_ACK";
    /// Acknowledgment
    pub const ACK: &str = "ACK";
    /// Data unit
    pub const DATA: &str = "DATA";
    /// Close request
    pub const CLOSE: &str = "CLOSE";
    /// Error report
    pub const ERROR: &str = "ERROR";
    /// Resource listing request
    pub const LIST_REQUEST: &str = "LIST_REQUEST";
    /// Resource listing reply
    pub const LIST_RESPONSE: &str = "LIST_RESPONSE";
    /// Initiator public key
    pub const KEY_OFFER: &str = "KEY_OFFER";
    /// Responder public key and wrapped session key
    pub const KEY_GRANT: &str = "KEY_GRANT";
    /// Rekey request
    pub const PUBLIC_KEY: &str = "PUBLIC_KEY";

    /// Every tag the decoder understands.
    pub const ALL: &[&str] = &[
        OPEN,
        OPEN_ACK,
        ACK,
        DATA,
        CLOSE,
        ERROR,
        LIST_REQUEST,
        LIST_RESPONSE,
        KEY_OFFER,
        KEY_GRANT,
        PUBLIC_KEY,
    ];
}

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Request to open a session for `resource`
    Open {
        /// Requested resource
        resource: String,
        /// Initial sequence number
        seq: u64,
    },
    /// Responder accepts an OPEN; carries the OPEN's seq + 1
    OpenAck {
        /// Echoed resource
        resource: String,
        /// OPEN seq + 1
        seq: u64,
    },
    /// Acknowledgment of `seq`
    Ack {
        /// Acknowledged sequence
        seq: u64,
    },
    /// Data unit; an empty payload is the end-of-data sentinel
    Data {
        /// Unit sequence
        seq: u64,
        /// Unit bytes
        payload: Vec<u8>,
    },
    /// Close request
    Close {
        /// Close sequence
        seq: u64,
    },
    /// Error report
    Error {
        /// Human readable reason
        reason: String,
    },
    /// Ask for the resource listing
    ListRequest,
    /// Resource listing, newline separated
    ListResponse {
        /// Listing text
        listing: String,
    },
    /// Start of the key exchange
    KeyOffer {
        /// Initiator public key
        public_key: PublicKey,
    },
    /// Reply to KEY_OFFER or PUBLIC_KEY
    KeyGrant {
        /// Responder public key
        public_key: PublicKey,
        /// Session key sealed for the initiator
        wrapped_key: Vec<u8>,
    },
    /// Rekey request carrying the initiator's existing public key
    PublicKey {
        /// Initiator public key
        public_key: PublicKey,
    },
}

impl Message {
    /// End-of-data sentinel at `seq`.
    #[must_use]
    pub fn sentinel(seq: u64) -> Self {
        Self::Data {
            seq,
            payload: Vec::new(),
        }
    }

    /// Wire tag of this message.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Open { .. } => tag::OPEN,
            Self::OpenAck { .. } => tag::OPEN_ACK,
            Self::Ack { .. } => tag::ACK,
            Self::Data { .. } => tag::DATA,
            Self::Close { .. } => tag::CLOSE,
            Self::Error { .. } => tag::ERROR,
            Self::ListRequest => tag::LIST_REQUEST,
            Self::ListResponse { .. } => tag::LIST_RESPONSE,
            Self::KeyOffer { .. } => tag::KEY_OFFER,
            Self::KeyGrant { .. } => tag::KEY_GRANT,
            Self::PublicKey { .. } => tag::PUBLIC_KEY,
        }
    }

    /// Key-exchange messages always travel in clear.
    #[must_use]
    pub fn is_key_exchange(&self) -> bool {
        matches!(
            self,
            Self::KeyOffer { .. } | Self::KeyGrant { .. } | Self::PublicKey { .. }
        )
    }

    /// Serialize to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Open { resource, seq } => format!("OPEN:{resource}:{seq}").into_bytes(),
            Self::OpenAck { resource, seq } => format!("OPEN_ACK:{resource}:{seq}").into_bytes(),
            Self::Ack { seq } => format!("ACK:{seq}").into_bytes(),
            Self::Data { seq, payload } if payload.is_empty() => {
                format!("DATA:{seq}:0:END").into_bytes()
            }
            Self::Data { seq, payload } => {
                let mut out = format!("DATA:{seq}:{}:", payload.len()).into_bytes();
                out.extend_from_slice(payload);
                out
            }
            Self::Close { seq } => format!("CLOSE:{seq}").into_bytes(),
            Self::Error { reason } => format!("ERROR:{reason}").into_bytes(),
            Self::ListRequest => tag::LIST_REQUEST.as_bytes().to_vec(),
            Self::ListResponse { listing } => format!("LIST_RESPONSE:{listing}").into_bytes(),
            Self::KeyOffer { public_key } => {
                format!("KEY_OFFER:{}", STANDARD.encode(public_key.as_bytes())).into_bytes()
            }
            Self::KeyGrant {
                public_key,
                wrapped_key,
            } => format!(
                "KEY_GRANT:{}:{}",
                STANDARD.encode(public_key.as_bytes()),
                STANDARD.encode(wrapped_key)
            )
            .into_bytes(),
            Self::PublicKey { public_key } => {
                format!("PUBLIC_KEY:{}", STANDARD.encode(public_key.as_bytes())).into_bytes()
            }
        }
    }

    /// Parse wire bytes.
    ///
    /// # Errors
    ///
    /// Returns `DecodeError` for anything outside the grammar: unknown tags,
    /// missing or extra fields, bad numbers, a DATA length that disagrees
    /// with the payload, or keys that are not 32 bytes of base64.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }

        let (raw_tag, rest) = match bytes.iter().position(|&b| b == DELIMITER) {
            Some(i) => (&bytes[..i], Some(&bytes[i + 1..])),
            None => (bytes, None),
        };
        let raw_tag = std::str::from_utf8(raw_tag).map_err(|_| DecodeError::InvalidUtf8)?;

        let message = match raw_tag {
            tag::OPEN => {
                let mut f = Fields::new(tag::OPEN, rest);
                let resource = f.resource()?;
                let seq = f.number("seq")?;
                f.finish()?;
                Self::Open { resource, seq }
            }
            tag::OPEN_ACK => {
                let mut f = Fields::new(tag::OPEN_ACK, rest);
                let resource = f.resource()?;
                let seq = f.number("seq")?;
                f.finish()?;
                Self::OpenAck { resource, seq }
            }
            tag::ACK => {
                let mut f = Fields::new(tag::ACK, rest);
                let seq = f.number("seq")?;
                f.finish()?;
                Self::Ack { seq }
            }
            tag::DATA => {
                let mut f = Fields::new(tag::DATA, rest);
                let seq = f.number("seq")?;
                let length = f.number("length")?;
                let payload = f.remainder("payload")?;
                Self::Data {
                    seq,
                    payload: data_payload(length, payload)?,
                }
            }
            tag::CLOSE => {
                let mut f = Fields::new(tag::CLOSE, rest);
                let seq = f.number("seq")?;
                f.finish()?;
                Self::Close { seq }
            }
            tag::ERROR => {
                let mut f = Fields::new(tag::ERROR, rest);
                let reason = f.remainder_text("message")?;
                Self::Error { reason }
            }
            tag::LIST_REQUEST => {
                Fields::new(tag::LIST_REQUEST, rest).finish()?;
                Self::ListRequest
            }
            tag::LIST_RESPONSE => {
                let mut f = Fields::new(tag::LIST_RESPONSE, rest);
                let listing = f.remainder_text("listing")?;
                Self::ListResponse { listing }
            }
            tag::KEY_OFFER => {
                let mut f = Fields::new(tag::KEY_OFFER, rest);
                let public_key = f.public_key("public_key")?;
                f.finish()?;
                Self::KeyOffer { public_key }
            }
            tag::KEY_GRANT => {
                let mut f = Fields::new(tag::KEY_GRANT, rest);
                let public_key = f.public_key("public_key")?;
                let wrapped_key = f.base64("wrapped_key")?;
                f.finish()?;
                Self::KeyGrant {
                    public_key,
                    wrapped_key,
                }
            }
            tag::PUBLIC_KEY => {
                let mut f = Fields::new(tag::PUBLIC_KEY, rest);
                let public_key = f.public_key("public_key")?;
                f.finish()?;
                Self::PublicKey { public_key }
            }
            other => return Err(DecodeError::UnknownTag(other.to_string())),
        };

        Ok(message)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data { seq, payload } => write!(f, "DATA:{seq}:{}", payload.len()),
            Self::KeyOffer { .. } | Self::KeyGrant { .. } | Self::PublicKey { .. } => {
                f.write_str(self.tag())
            }
            other => f.write_str(&String::from_utf8_lossy(&other.encode())),
        }
    }
}

/// Check that `name` can travel in an OPEN field.
///
/// # Errors
///
/// Returns `DecodeError::InvalidResourceName` for empty names or names
/// containing `:` or control characters.
pub fn validate_resource_name(name: &str) -> Result<(), DecodeError> {
    if name.is_empty() || name.bytes().any(|b| b == DELIMITER || b.is_ascii_control()) {
        return Err(DecodeError::InvalidResourceName(name.to_string()));
    }
    Ok(())
}

fn data_payload(length: u64, payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
    if length == 0 {
        if payload.is_empty() || payload == END_MARKER {
            return Ok(Vec::new());
        }
        return Err(DecodeError::InvalidSentinel);
    }
    if u64::try_from(payload.len()).ok() != Some(length) {
        return Err(DecodeError::LengthMismatch {
            declared: usize::try_from(length).unwrap_or(usize::MAX),
            actual: payload.len(),
        });
    }
    Ok(payload.to_vec())
}

/// Cursor over the fields following a tag.
struct Fields<'a> {
    tag: &'static str,
    rest: Option<&'a [u8]>,
}

impl<'a> Fields<'a> {
    fn new(tag: &'static str, rest: Option<&'a [u8]>) -> Self {
        Self { tag, rest }
    }

    fn next(&mut self, field: &'static str) -> Result<&'a [u8], DecodeError> {
        let rest = self.rest.ok_or(DecodeError::MissingField {
            tag: self.tag,
            field,
        })?;
        match rest.iter().position(|&b| b == DELIMITER) {
            Some(i) => {
                self.rest = Some(&rest[i + 1..]);
                Ok(&rest[..i])
            }
            None => {
                self.rest = None;
                Ok(rest)
            }
        }
    }

    fn remainder(&mut self, field: &'static str) -> Result<&'a [u8], DecodeError> {
        self.rest.take().ok_or(DecodeError::MissingField {
            tag: self.tag,
            field,
        })
    }

    fn text(&mut self, field: &'static str) -> Result<&'a str, DecodeError> {
        std::str::from_utf8(self.next(field)?).map_err(|_| DecodeError::InvalidUtf8)
    }

    fn remainder_text(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let raw = self.remainder(field)?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }

    fn number(&mut self, field: &'static str) -> Result<u64, DecodeError> {
        let text = self.text(field)?;
        if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DecodeError::InvalidNumber {
                field,
                value: text.to_string(),
            });
        }
        text.parse().map_err(|_| DecodeError::InvalidNumber {
            field,
            value: text.to_string(),
        })
    }

    fn resource(&mut self) -> Result<String, DecodeError> {
        let name = self.text("resource")?;
        validate_resource_name(name)?;
        Ok(name.to_string())
    }

    fn base64(&mut self, field: &'static str) -> Result<Vec<u8>, DecodeError> {
        STANDARD
            .decode(self.next(field)?)
            .map_err(|_| DecodeError::InvalidBase64(field))
    }

    fn public_key(&mut self, field: &'static str) -> Result<PublicKey, DecodeError> {
        let raw = self.base64(field)?;
        if raw.len() != PUBLIC_KEY_SIZE {
            return Err(DecodeError::InvalidKeyLength {
                field,
                length: raw.len(),
            });
        }
        PublicKey::from_slice(&raw).map_err(|_| DecodeError::InvalidKeyLength {
            field,
            length: raw.len(),
        })
    }

    fn finish(self) -> Result<(), DecodeError> {
        match self.rest {
            None => Ok(()),
            Some(_) => Err(DecodeError::TrailingFields(self.tag)),
        }
    }
}
