//! Protocol configuration.

use std::time::Duration;

use rudp_transport::MAX_UDP_PAYLOAD;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::transfer::RetryPolicy;

/// Smallest datagram limit accepted by [`ProtocolConfig::validate`].
pub const MIN_DATAGRAM_SIZE: usize = 64;

/// Initial sequence numbers are drawn from `0..INITIAL_SEQ_RANGE`.
pub const INITIAL_SEQ_RANGE: u64 = 10_000;

/// Which way resource data flows once a session is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The responder sends the requested resource to the peer
    #[default]
    Source,
    /// The peer sends the named resource to the responder
    Sink,
}

/// Timing and limits shared by responder and initiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// Data direction
    pub role: Role,
    /// Wait for each ACK before retransmitting a DATA or CLOSE
    pub ack_timeout: Duration,
    /// Sends per unit or handshake message before giving up
    pub max_attempts: u32,
    /// Wait for a handshake reply before retransmitting
    pub handshake_timeout: Duration,
    /// Inactivity after which the sweeper evicts a session
    pub idle_timeout: Duration,
    /// Period of the idle sweep
    pub sweep_interval: Duration,
    /// Session key lifetime before the initiator rekeys
    pub key_lifetime: Duration,
    /// Largest datagram the protocol will emit
    pub max_datagram_size: usize,
    /// Refuse plaintext OPEN and data traffic
    pub require_encryption: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            role: Role::Source,
            ack_timeout: Duration::from_secs(2),
            max_attempts: 3,
            handshake_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
            key_lifetime: Duration::from_secs(300),
            max_datagram_size: MAX_UDP_PAYLOAD,
            require_encryption: false,
        }
    }
}

impl ProtocolConfig {
    /// Configuration for the given role with default timing.
    #[must_use]
    pub fn for_role(role: Role) -> Self {
        Self {
            role,
            ..Self::default()
        }
    }

    /// Retry policy for data units.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            ack_timeout: self.ack_timeout,
            max_attempts: self.max_attempts,
        }
    }

    /// Reject configurations that would make a wait unbounded or zero.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::InvalidConfig` describing the first problem.
    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("ack_timeout", self.ack_timeout),
            ("handshake_timeout", self.handshake_timeout),
            ("idle_timeout", self.idle_timeout),
            ("sweep_interval", self.sweep_interval),
        ];
        if let Some((name, _)) = zero.iter().find(|(_, d)| d.is_zero()) {
            return Err(ProtocolError::InvalidConfig(
                format!("{name} must be greater than zero").into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ProtocolError::InvalidConfig(
                "max_attempts must be at least 1".into(),
            ));
        }
        if !(MIN_DATAGRAM_SIZE..=MAX_UDP_PAYLOAD).contains(&self.max_datagram_size) {
            return Err(ProtocolError::InvalidConfig(
                format!(
                    "max_datagram_size must be between {MIN_DATAGRAM_SIZE} and {MAX_UDP_PAYLOAD}"
                )
                .into(),
            ));
        }
        Ok(())
    }
}
