//! Fault-injecting transport wrapper.
//!
//! Wraps any [`Transport`] and silently drops outgoing datagrams chosen by a
//! [`DropPolicy`]. Used to exercise retransmission paths over a real socket.

use crate::transport::{Transport, TransportResult, TransportStats};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Which outgoing datagrams to drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPolicy {
    /// Deliver everything.
    None,
    /// Drop every `n`th datagram (1-based), e.g. `EveryNth(3)` drops the 3rd, 6th, ...
    EveryNth(u64),
    /// Drop the first `n` datagrams, then deliver.
    First(u64),
    /// Drop everything.
    All,
}

impl DropPolicy {
    fn drops(self, ordinal: u64) -> bool {
        match self {
            Self::None => false,
            Self::EveryNth(0) => false,
            Self::EveryNth(n) => ordinal % n == 0,
            Self::First(n) => ordinal <= n,
            Self::All => true,
        }
    }
}

/// Transport that loses datagrams on send.
#[derive(Debug)]
pub struct LossyTransport<T> {
    inner: T,
    policy: DropPolicy,
    attempted: AtomicU64,
    dropped: AtomicU64,
}

impl<T: Transport> LossyTransport<T> {
    /// Wrap `inner`.
    pub fn new(inner: T, policy: DropPolicy) -> Self {
        Self {
            inner,
            policy,
            attempted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Number of datagrams swallowed so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl<T: Transport> Transport for LossyTransport<T> {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        let ordinal = self.attempted.fetch_add(1, Ordering::Relaxed) + 1;
        if self.policy.drops(ordinal) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(ordinal, %addr, "Dropping outgoing datagram");
            return Ok(buf.len());
        }
        self.inner.send_to(buf, addr).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.inner.local_addr()
    }

    async fn close(&self) -> TransportResult<()> {
        self.inner.close().await
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            packets_dropped: self.dropped(),
            ..self.inner.stats()
        }
    }
}
