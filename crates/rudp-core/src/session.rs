//! Per-peer session state.
//!
//! ```text
//! IDLE ──OPEN──▶ OPEN_RECEIVED ──ACK──▶ ESTABLISHED ──CLOSE──▶ CLOSE_WAIT_1
//!                                                                  │ ACK
//!                                       CLOSED ◀──────────── CLOSE_WAIT_2
//! ```
//!
//! State and sequence counters only move forward. A session is mutated only
//! by whoever holds its lock in the registry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rudp_crypto::{CryptoContext, SessionKey};

use crate::error::{ProtocolError, Result};
use crate::transfer::Receiver;

/// Peer identity: remote address and port.
pub type PeerId = SocketAddr;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    /// No connection; may hold crypto state from a key exchange
    Idle,
    /// OPEN accepted, OPEN_ACK sent, waiting for the handshake ACK
    OpenReceived,
    /// Handshake complete, data may flow
    Established,
    /// Peer CLOSE acknowledged, own CLOSE sent
    CloseWait1,
    /// Own CLOSE acknowledged
    CloseWait2,
    /// Terminal
    Closed,
}

/// A single session with a remote peer
#[derive(Debug)]
pub struct Session {
    peer: PeerId,
    state: SessionState,
    resource: Option<String>,
    /// Sequence carried by the accepted OPEN
    open_seq: Option<u64>,
    next_send_seq: u64,
    receiver: Receiver,
    /// Sequence of the peer's CLOSE
    peer_close_seq: Option<u64>,
    created_at: Instant,
    last_activity: Instant,
    crypto: Option<CryptoContext>,
}

impl Session {
    /// Create an idle session for `peer`.
    #[must_use]
    pub fn new(peer: PeerId) -> Self {
        let now = Instant::now();
        Self {
            peer,
            state: SessionState::Idle,
            resource: None,
            open_seq: None,
            next_send_seq: 0,
            receiver: Receiver::new(0),
            peer_close_seq: None,
            created_at: now,
            last_activity: now,
            crypto: None,
        }
    }

    /// Peer this session belongs to.
    #[must_use]
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Resource named by the accepted OPEN.
    #[must_use]
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// Sequence carried by the accepted OPEN.
    #[must_use]
    pub fn open_seq(&self) -> Option<u64> {
        self.open_seq
    }

    /// Check if a state transition is valid
    #[must_use]
    pub fn can_transition(&self, to: SessionState) -> bool {
        use SessionState::{CloseWait1, CloseWait2, Closed, Established, Idle, OpenReceived};
        matches!(
            (self.state, to),
            (Idle, OpenReceived)
                | (OpenReceived, Established | CloseWait1)
                | (Established, CloseWait1)
                | (CloseWait1, CloseWait2)
                | (CloseWait2, Closed)
        ) || (to == Closed && self.state != Closed)
    }

    /// Transition to a new state
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::InvalidTransition` if the transition is not
    /// allowed from the current state.
    pub fn transition_to(&mut self, to: SessionState) -> Result<()> {
        if !self.can_transition(to) {
            return Err(ProtocolError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        tracing::debug!(
            "Session {} state transition: {:?} -> {:?}",
            self.peer,
            self.state,
            to
        );
        self.state = to;
        Ok(())
    }

    /// Accept `OPEN(resource, seq)`: reserve `seq + 1` for the handshake ACK
    /// and start both data directions at `seq + 2`. Returns the OPEN_ACK
    /// sequence.
    ///
    /// # Errors
    ///
    /// Fails if the session is not idle or `seq + 2` overflows.
    pub fn accept_open(&mut self, resource: &str, seq: u64) -> Result<u64> {
        let ack_seq = seq.checked_add(1).ok_or(ProtocolError::SequenceExhausted)?;
        let first_data = seq.checked_add(2).ok_or(ProtocolError::SequenceExhausted)?;
        self.transition_to(SessionState::OpenReceived)?;

        self.resource = Some(resource.to_string());
        self.open_seq = Some(seq);
        self.next_send_seq = first_data;
        self.receiver = Receiver::new(first_data);
        Ok(ack_seq)
    }

    /// Sequence the handshake ACK must carry.
    #[must_use]
    pub fn handshake_ack_seq(&self) -> Option<u64> {
        self.open_seq.and_then(|seq| seq.checked_add(1))
    }

    /// Sequence of the first DATA unit after the handshake.
    #[must_use]
    pub fn first_data_seq(&self) -> Option<u64> {
        self.open_seq.and_then(|seq| seq.checked_add(2))
    }

    /// Next sequence this side will send.
    #[must_use]
    pub fn next_send_seq(&self) -> u64 {
        self.next_send_seq
    }

    /// Record send progress. Never moves backwards.
    pub fn advance_send_seq(&mut self, next: u64) {
        self.next_send_seq = self.next_send_seq.max(next);
    }

    /// Next DATA sequence this side will accept.
    #[must_use]
    pub fn next_expected_recv_seq(&self) -> u64 {
        self.receiver.next_expected()
    }

    /// Inbound transfer state.
    #[must_use]
    pub fn receiver(&self) -> &Receiver {
        &self.receiver
    }

    /// Mutable inbound transfer state.
    pub fn receiver_mut(&mut self) -> &mut Receiver {
        &mut self.receiver
    }

    /// Record the peer's CLOSE sequence. Returns our CLOSE sequence.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::SequenceExhausted` if `seq + 1` overflows.
    pub fn record_peer_close(&mut self, seq: u64) -> Result<u64> {
        let own = seq.checked_add(1).ok_or(ProtocolError::SequenceExhausted)?;
        self.peer_close_seq = Some(seq);
        Ok(own)
    }

    /// Sequence of the peer's CLOSE, once received.
    #[must_use]
    pub fn peer_close_seq(&self) -> Option<u64> {
        self.peer_close_seq
    }

    /// Sequence of our own CLOSE, once sent.
    #[must_use]
    pub fn own_close_seq(&self) -> Option<u64> {
        self.peer_close_seq.and_then(|seq| seq.checked_add(1))
    }

    /// Mark activity now.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Time since the last activity.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Whether the session has been inactive for at least `max_idle`.
    #[must_use]
    pub fn is_idle(&self, max_idle: Duration) -> bool {
        self.idle_for() >= max_idle
    }

    /// Age of the session.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Crypto state, if a key exchange completed.
    #[must_use]
    pub fn crypto(&self) -> Option<&CryptoContext> {
        self.crypto.as_ref()
    }

    /// Mutable crypto state.
    pub fn crypto_mut(&mut self) -> Option<&mut CryptoContext> {
        self.crypto.as_mut()
    }

    /// Bind crypto state to this session.
    pub fn set_crypto(&mut self, ctx: CryptoContext) {
        self.crypto = Some(ctx);
    }

    /// Key snapshot for sealing one outgoing message.
    #[must_use]
    pub fn sealing_key(&self) -> Option<Arc<SessionKey>> {
        self.crypto.as_ref().map(CryptoContext::sealing_key)
    }
}
