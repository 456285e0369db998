//! Error types for the rudp core protocol.

use std::borrow::Cow;
use std::net::SocketAddr;

use rudp_crypto::CryptoError;
use rudp_transport::TransportError;
use thiserror::Error;

use crate::session::SessionState;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Wire-level decode errors. Decoding never panics; every rejection is one
/// of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Zero-length datagram
    #[error("empty message")]
    Empty,

    /// Tag not part of the grammar
    #[error("unknown message tag: {0}")]
    UnknownTag(String),

    /// Fewer fields than the tag requires
    #[error("{tag} is missing field `{field}`")]
    MissingField {
        /// Message tag
        tag: &'static str,
        /// Name of the first absent field
        field: &'static str,
    },

    /// More fields than the tag allows
    #[error("{0} has unexpected trailing fields")]
    TrailingFields(&'static str),

    /// Numeric field did not parse
    #[error("invalid {field}: {value:?}")]
    InvalidNumber {
        /// Field name
        field: &'static str,
        /// Offending text
        value: String,
    },

    /// DATA length field disagrees with the payload
    #[error("declared length {declared} but payload is {actual} bytes")]
    LengthMismatch {
        /// Value of the length field
        declared: usize,
        /// Bytes actually present
        actual: usize,
    },

    /// Zero-length DATA whose payload is neither empty nor the END marker
    #[error("zero-length DATA must carry END")]
    InvalidSentinel,

    /// Resource name empty or containing a reserved character
    #[error("invalid resource name: {0:?}")]
    InvalidResourceName(String),

    /// Base64 field did not decode
    #[error("invalid base64 in {0}")]
    InvalidBase64(&'static str),

    /// Key field decoded to the wrong size
    #[error("{field} must decode to 32 bytes, got {length}")]
    InvalidKeyLength {
        /// Field name
        field: &'static str,
        /// Decoded length
        length: usize,
    },

    /// Header field is not UTF-8
    #[error("non-UTF-8 header field")]
    InvalidUtf8,
}

/// Protocol errors, scoped to one session or one unit.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // ============ Wire Errors ============
    /// Codec rejected a datagram
    #[error("malformed message: {0}")]
    Malformed(#[from] DecodeError),

    /// Sealed frame did not authenticate under any key of the session
    #[error("decryption failed")]
    DecryptFailure,

    /// Encoded message would not fit in one datagram
    #[error("unit of {size} bytes exceeds datagram limit of {limit}")]
    UnitTooLarge {
        /// Framed size
        size: usize,
        /// Configured limit
        limit: usize,
    },

    /// Zero-length units are reserved for the end-of-data sentinel
    #[error("data unit {0} is empty")]
    EmptyUnit(usize),

    // ============ Session Errors ============
    /// Message for a peer without a session
    #[error("no session for peer {0}")]
    UnknownSession(SocketAddr),

    /// OPEN for a peer whose session is already open
    #[error("session already open")]
    AlreadyOpen,

    /// Sequence number other than the one expected
    #[error("sequence mismatch: expected {expected}, got {actual}")]
    SequenceMismatch {
        /// Expected sequence
        expected: u64,
        /// Received sequence
        actual: u64,
    },

    /// Sequence arithmetic would overflow
    #[error("sequence space exhausted")]
    SequenceExhausted,

    /// Message not valid in the current state
    #[error("{message} not valid in state {state:?}")]
    UnexpectedMessage {
        /// Message tag
        message: &'static str,
        /// State at the time
        state: SessionState,
    },

    /// State machine refused a transition
    #[error("invalid state transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// Current state
        from: SessionState,
        /// Requested state
        to: SessionState,
    },

    /// Plaintext protocol message where only sealed frames are accepted
    #[error("encryption required")]
    EncryptionRequired,

    /// Requested resource does not exist or is not permitted
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    // ============ Timeout Errors ============
    /// Handshake reply never arrived
    #[error("handshake timed out after {attempts} attempts")]
    HandshakeTimeout {
        /// Attempts made
        attempts: u32,
    },

    /// Acknowledgment for a control message never arrived
    #[error("no acknowledgment for seq {seq} after {attempts} attempts")]
    AckTimeout {
        /// Unacknowledged sequence
        seq: u64,
        /// Attempts made
        attempts: u32,
    },

    /// Retries exhausted while moving data
    #[error("transfer aborted at seq {seq} after {attempts} attempts")]
    TransferAborted {
        /// Sequence of the failing unit
        seq: u64,
        /// Attempts made
        attempts: u32,
    },

    /// Session torn down while a transfer was waiting
    #[error("transfer cancelled")]
    Cancelled,

    // ============ External Errors ============
    /// Peer replied with ERROR
    #[error("peer reported error: {0}")]
    Remote(String),

    /// Resource store failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Rejected configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Transport failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Crypto failure outside of frame opening
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl ProtocolError {
    /// Taxonomy name, used as the prefix of ERROR replies.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) | Self::EmptyUnit(_) | Self::UnitTooLarge { .. } => {
                "MalformedMessage"
            }
            Self::DecryptFailure => "DecryptFailure",
            Self::UnknownSession(_) => "UnknownSession",
            Self::AlreadyOpen => "AlreadyOpen",
            Self::SequenceMismatch { .. } | Self::SequenceExhausted => "SequenceMismatch",
            Self::UnexpectedMessage { .. } | Self::InvalidTransition { .. } => "UnexpectedMessage",
            Self::EncryptionRequired => "EncryptionRequired",
            Self::ResourceUnavailable(_) => "ResourceUnavailable",
            Self::HandshakeTimeout { .. } => "HandshakeTimeout",
            Self::AckTimeout { .. } => "AckTimeout",
            Self::TransferAborted { .. } | Self::Cancelled => "TransferAborted",
            Self::Remote(_) => "Remote",
            Self::Storage(_) | Self::InvalidConfig(_) | Self::Transport(_) | Self::Crypto(_) => {
                "Internal"
            }
        }
    }

    /// Text carried in an ERROR reply.
    #[must_use]
    pub fn wire_message(&self) -> String {
        format!("{}: {self}", self.kind())
    }

    /// Whether the peer should be told with an ERROR reply. Recoverable
    /// conditions such as a sequence mismatch or a single bad frame are
    /// handled silently.
    #[must_use]
    pub fn warrants_reply(&self) -> bool {
        matches!(
            self,
            Self::Malformed(_)
                | Self::UnitTooLarge { .. }
                | Self::UnknownSession(_)
                | Self::AlreadyOpen
                | Self::UnexpectedMessage { .. }
                | Self::EncryptionRequired
                | Self::ResourceUnavailable(_)
                | Self::HandshakeTimeout { .. }
                | Self::TransferAborted { .. }
                | Self::Storage(_)
                | Self::Crypto(_)
        )
    }

    /// Whether this error ends the session it occurred in.
    ///
    /// Everything else is handled without destroying session state.
    #[must_use]
    pub fn terminates_session(&self) -> bool {
        matches!(
            self,
            Self::TransferAborted { .. } | Self::HandshakeTimeout { .. } | Self::Cancelled
        )
    }
}
