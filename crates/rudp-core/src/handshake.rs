//! Handshake engine.
//!
//! Drives the responder side of the three-way open and four-way close:
//!
//! ```text
//! Peer                              Responder
//!   OPEN(r, S)          ─────▶      IDLE -> OPEN_RECEIVED
//!                       ◀─────      OPEN_ACK(r, S+1)
//!   ACK(S+1)            ─────▶      -> ESTABLISHED
//!          ...  DATA from S+2 in either direction  ...
//!   CLOSE(C)            ─────▶      -> CLOSE_WAIT_1
//!                       ◀─────      ACK(C), CLOSE(C+1)
//!   ACK(C+1)            ─────▶      -> CLOSE_WAIT_2 -> CLOSED
//! ```
//!
//! Every function here is a pure step over a locked [`Session`]: it mutates
//! the session, and returns the replies to send and the side effect the
//! caller must carry out once the lock is released.

use crate::codec::{Message, tag};
use crate::config::Role;
use crate::error::{DecodeError, ProtocolError, Result};
use crate::resource::ResourceStore;
use crate::session::{Session, SessionState};
use crate::transfer::{Delivery, Unit};

/// Work left to the caller after a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Nothing beyond sending the replies
    None,
    /// OPEN accepted; retransmit OPEN_ACK while the session stays OPEN_RECEIVED
    AwaitHandshakeAck,
    /// Handshake complete in the source role; start the send loop
    StartSending,
    /// ACK belonging to the running send loop
    RouteAck(u64),
    /// Sink role received the whole resource
    Deliver {
        /// Resource name from the OPEN
        resource: String,
        /// Received units, decrypt-failure markers included
        units: Vec<Unit>,
    },
    /// Peer closed; stop any send loop and retransmit our CLOSE until acknowledged
    Closing,
    /// Four-way close complete; remove the session
    Closed,
}

/// Outcome of one handshake step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// Messages to send to the peer, in order
    pub replies: Vec<Message>,
    /// Side effect to perform after unlocking
    pub effect: Effect,
}

impl Step {
    fn nothing() -> Self {
        Self {
            replies: Vec::new(),
            effect: Effect::None,
        }
    }

    fn reply(message: Message) -> Self {
        Self {
            replies: vec![message],
            effect: Effect::None,
        }
    }

    fn with(mut self, effect: Effect) -> Self {
        self.effect = effect;
        self
    }
}

/// Handle `OPEN(resource, seq)`.
///
/// # Errors
///
/// - `ResourceUnavailable` if the store does not offer (source) or accept
///   (sink) `resource`; the session stays IDLE
/// - `AlreadyOpen` for a different OPEN on a session that is already open;
///   a copy of the accepted OPEN arriving after the handshake is dropped
pub fn on_open(
    session: &mut Session,
    resource: &str,
    seq: u64,
    role: Role,
    store: &dyn ResourceStore,
) -> Result<Step> {
    match session.state() {
        SessionState::Idle => {
            if seq.checked_add(2).is_none() {
                return Err(DecodeError::InvalidNumber {
                    field: "seq",
                    value: seq.to_string(),
                }
                .into());
            }
            let available = match role {
                Role::Source => store.contains(resource),
                Role::Sink => store.permits(resource),
            };
            if !available {
                return Err(ProtocolError::ResourceUnavailable(resource.to_string()));
            }
            let ack = session.accept_open(resource, seq)?;
            session.touch();
            tracing::info!(
                "Session {} opened for {:?} (seq {}, role {:?})",
                session.peer(),
                resource,
                seq,
                role
            );
            Ok(Step::reply(Message::OpenAck {
                resource: resource.to_string(),
                seq: ack,
            })
            .with(Effect::AwaitHandshakeAck))
        }
        state if is_same_open(session, resource, seq) => {
            session.touch();
            if state == SessionState::OpenReceived {
                tracing::debug!("Duplicate OPEN from {}, resending OPEN_ACK", session.peer());
                Ok(Step::reply(Message::OpenAck {
                    resource: resource.to_string(),
                    seq: seq + 1,
                }))
            } else {
                tracing::debug!("Ignoring retransmitted OPEN from {}", session.peer());
                Ok(Step::nothing())
            }
        }
        _ => Err(ProtocolError::AlreadyOpen),
    }
}

fn is_same_open(session: &Session, resource: &str, seq: u64) -> bool {
    session.open_seq() == Some(seq) && session.resource() == Some(resource)
}

/// Handle `ACK(seq)`.
///
/// # Errors
///
/// - `UnknownSession` when no OPEN was accepted
/// - `SequenceMismatch` for a handshake ACK with the wrong sequence
pub fn on_ack(session: &mut Session, seq: u64, role: Role) -> Result<Step> {
    match session.state() {
        SessionState::Idle => Err(ProtocolError::UnknownSession(session.peer())),
        SessionState::OpenReceived => {
            let expected = session
                .handshake_ack_seq()
                .ok_or(ProtocolError::SequenceExhausted)?;
            if seq != expected {
                return Err(ProtocolError::SequenceMismatch {
                    expected,
                    actual: seq,
                });
            }
            session.transition_to(SessionState::Established)?;
            session.touch();
            tracing::info!("Session {} established", session.peer());
            Ok(Step::nothing().with(match role {
                Role::Source => Effect::StartSending,
                Role::Sink => Effect::None,
            }))
        }
        SessionState::Established => {
            session.touch();
            match role {
                Role::Source => Ok(Step::nothing().with(Effect::RouteAck(seq))),
                Role::Sink => Ok(Step::nothing()),
            }
        }
        SessionState::CloseWait1 if session.own_close_seq() == Some(seq) => {
            session.transition_to(SessionState::CloseWait2)?;
            session.transition_to(SessionState::Closed)?;
            tracing::info!("Session {} closed", session.peer());
            Ok(Step::nothing().with(Effect::Closed))
        }
        _ => Ok(Step::nothing()),
    }
}

/// Handle `DATA(seq, payload)` in the sink role.
///
/// # Errors
///
/// - `UnexpectedMessage` in the source role, where the peer never sends data
/// - `UnknownSession` when no OPEN was accepted
pub fn on_data(session: &mut Session, seq: u64, payload: &[u8], role: Role) -> Result<Step> {
    if role == Role::Source {
        return Err(ProtocolError::UnexpectedMessage {
            message: tag::DATA,
            state: session.state(),
        });
    }

    match session.state() {
        SessionState::Idle => return Err(ProtocolError::UnknownSession(session.peer())),
        SessionState::OpenReceived => {
            if session.first_data_seq() != Some(seq) {
                return Ok(Step::nothing());
            }
            session.transition_to(SessionState::Established)?;
            tracing::info!(
                "Session {} established by first DATA (handshake ACK lost)",
                session.peer()
            );
        }
        SessionState::Established => {}
        _ => return Ok(Step::nothing()),
    }

    session.touch();
    let outcome = session.receiver_mut().on_data(seq, payload)?;
    let step = Step::reply(Message::Ack { seq: outcome.ack });

    if outcome.delivery == (Delivery::EndOfData { first: true }) {
        let resource = session.resource().unwrap_or_default().to_string();
        let units = session.receiver().units().to_vec();
        return Ok(step.with(Effect::Deliver { resource, units }));
    }
    Ok(step)
}

/// Handle `CLOSE(seq)`.
///
/// # Errors
///
/// Returns `UnknownSession` when no OPEN was accepted.
pub fn on_close(session: &mut Session, seq: u64) -> Result<Step> {
    match session.state() {
        SessionState::Idle => Err(ProtocolError::UnknownSession(session.peer())),
        SessionState::OpenReceived | SessionState::Established => {
            let own = session.record_peer_close(seq)?;
            session.transition_to(SessionState::CloseWait1)?;
            session.touch();
            tracing::info!("Session {} closing (peer CLOSE {})", session.peer(), seq);
            Ok(Step {
                replies: vec![Message::Ack { seq }, Message::Close { seq: own }],
                effect: Effect::Closing,
            })
        }
        SessionState::CloseWait1 if session.peer_close_seq() == Some(seq) => {
            let own = session.own_close_seq().ok_or(ProtocolError::SequenceExhausted)?;
            session.touch();
            Ok(Step {
                replies: vec![Message::Ack { seq }, Message::Close { seq: own }],
                effect: Effect::None,
            })
        }
        _ => Ok(Step::nothing()),
    }
}
