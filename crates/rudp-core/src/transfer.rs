//! Reliable stop-and-wait transfer.
//!
//! The sender transmits one DATA unit, waits for its ACK, and retransmits
//! the unchanged unit on timeout up to a bounded number of attempts. The
//! receiver applies only the unit whose sequence equals the next expected
//! one and answers anything else by re-acknowledging the last applied
//! sequence, which makes duplicate delivery idempotent.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::{ProtocolError, Result};

/// Retransmission limits for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait per attempt
    pub ack_timeout: Duration,
    /// Sends per unit before giving up
    pub max_attempts: u32,
}

/// One slot of a received resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    /// Applied payload
    Applied(Vec<u8>),
    /// A frame for this transfer arrived but could not be decrypted
    DecryptFailed,
}

/// How a DATA unit was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Payload appended, expected sequence advanced
    Applied,
    /// End-of-data sentinel; `first` is false for repeats
    EndOfData {
        /// First time the sentinel was seen
        first: bool,
    },
    /// Duplicate or out-of-order; nothing changed
    Duplicate,
}

/// Receiver decision for one DATA unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataOutcome {
    /// Sequence to acknowledge
    pub ack: u64,
    /// What happened to the unit
    pub delivery: Delivery,
}

/// Receiving half of a transfer.
#[derive(Debug, Clone)]
pub struct Receiver {
    next_expected: u64,
    units: Vec<Unit>,
    finished: bool,
}

impl Receiver {
    /// Expect the first unit at `first_seq`.
    #[must_use]
    pub fn new(first_seq: u64) -> Self {
        Self {
            next_expected: first_seq,
            units: Vec::new(),
            finished: false,
        }
    }

    /// Handle `DATA(seq, payload)`.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::SequenceExhausted` if advancing would overflow.
    pub fn on_data(&mut self, seq: u64, payload: &[u8]) -> Result<DataOutcome> {
        if seq != self.next_expected {
            tracing::debug!(
                "Out-of-order DATA {} (expected {}), re-acking",
                seq,
                self.next_expected
            );
            return Ok(self.reack());
        }

        if payload.is_empty() {
            let first = !self.finished;
            self.finished = true;
            return Ok(DataOutcome {
                ack: seq,
                delivery: Delivery::EndOfData { first },
            });
        }

        if self.finished {
            return Ok(self.reack());
        }

        self.next_expected = seq.checked_add(1).ok_or(ProtocolError::SequenceExhausted)?;
        self.units.push(Unit::Applied(payload.to_vec()));
        Ok(DataOutcome {
            ack: seq,
            delivery: Delivery::Applied,
        })
    }

    fn reack(&self) -> DataOutcome {
        DataOutcome {
            ack: self.next_expected.saturating_sub(1),
            delivery: Delivery::Duplicate,
        }
    }

    /// Record a frame that failed to decrypt. Sequence state is unchanged.
    pub fn record_decrypt_failure(&mut self) {
        if !self.finished {
            self.units.push(Unit::DecryptFailed);
        }
    }

    /// Sequence the next unit must carry.
    #[must_use]
    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// Whether the sentinel has arrived.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Everything recorded so far, markers included.
    #[must_use]
    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    /// Applied payloads in order.
    pub fn payloads(&self) -> impl Iterator<Item = &[u8]> {
        self.units.iter().filter_map(|unit| match unit {
            Unit::Applied(bytes) => Some(bytes.as_slice()),
            Unit::DecryptFailed => None,
        })
    }

    /// Number of decrypt-failure markers.
    #[must_use]
    pub fn decrypt_failures(&self) -> usize {
        self.units
            .iter()
            .filter(|unit| matches!(unit, Unit::DecryptFailed))
            .count()
    }

    /// Consume into the recorded units.
    #[must_use]
    pub fn into_units(self) -> Vec<Unit> {
        self.units
    }
}

/// What a sender observed while waiting for an acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckEvent {
    /// ACK for some sequence
    Ack(u64),
    /// Nothing arrived in time
    TimedOut,
    /// The session is going away
    Cancelled,
}

/// Link between the sender algorithm and a concrete session.
#[async_trait]
pub trait UnitChannel: Send {
    /// Transmit `DATA(seq, payload)`.
    async fn send_data(&mut self, seq: u64, payload: &[u8]) -> Result<()>;

    /// Wait up to `timeout` for the next acknowledgment.
    async fn next_ack(&mut self, timeout: Duration) -> Result<AckEvent>;

    /// Reject a unit that cannot be framed. Called for every unit before
    /// the first send.
    fn check_unit(&self, _seq: u64, _payload: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Summary of a completed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    /// Data units delivered, sentinel excluded
    pub units: usize,
    /// Retransmissions across all units
    pub retransmissions: u32,
    /// Sequence of the acknowledged sentinel
    pub sentinel_seq: u64,
}

/// Send `units` starting at `first_seq`, then the sentinel.
///
/// # Errors
///
/// - `EmptyUnit` / `UnitTooLarge` before anything is sent
/// - `TransferAborted` once a unit exhausts `policy.max_attempts`
/// - `Cancelled` if the channel reports cancellation
pub async fn send_units<C: UnitChannel + ?Sized>(
    channel: &mut C,
    first_seq: u64,
    units: &[Vec<u8>],
    policy: RetryPolicy,
) -> Result<SendReport> {
    let mut seq = first_seq;
    for (index, unit) in units.iter().enumerate() {
        if unit.is_empty() {
            return Err(ProtocolError::EmptyUnit(index));
        }
        channel.check_unit(seq, unit)?;
        seq = seq.checked_add(1).ok_or(ProtocolError::SequenceExhausted)?;
    }

    let mut retransmissions = 0;
    let mut seq = first_seq;
    for unit in units {
        retransmissions += deliver(channel, seq, unit, policy).await?;
        seq += 1;
    }
    retransmissions += deliver(channel, seq, &[], policy).await?;

    Ok(SendReport {
        units: units.len(),
        retransmissions,
        sentinel_seq: seq,
    })
}

/// Send one unit until acknowledged. Returns the retransmission count.
async fn deliver<C: UnitChannel + ?Sized>(
    channel: &mut C,
    seq: u64,
    payload: &[u8],
    policy: RetryPolicy,
) -> Result<u32> {
    for attempt in 1..=policy.max_attempts {
        channel.send_data(seq, payload).await?;
        if await_ack(channel, seq, policy.ack_timeout).await? {
            return Ok(attempt - 1);
        }
        tracing::warn!(
            "No ACK for DATA {} (attempt {}/{})",
            seq,
            attempt,
            policy.max_attempts
        );
    }
    Err(ProtocolError::TransferAborted {
        seq,
        attempts: policy.max_attempts,
    })
}

/// Wait for `ACK(seq)`, skipping stale acknowledgments. Returns false on
/// timeout.
async fn await_ack<C: UnitChannel + ?Sized>(
    channel: &mut C,
    seq: u64,
    timeout: Duration,
) -> Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }
        match channel.next_ack(remaining).await? {
            AckEvent::Ack(acked) if acked == seq => return Ok(true),
            AckEvent::Ack(stale) => {
                tracing::debug!("Ignoring stale ACK {} while waiting for {}", stale, seq);
            }
            AckEvent::TimedOut => return Ok(false),
            AckEvent::Cancelled => return Err(ProtocolError::Cancelled),
        }
    }
}
