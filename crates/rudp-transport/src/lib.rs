//! # rudp Transport
//!
//! Datagram transports for rudp. The protocol layer only needs whole-datagram
//! send and receive, expressed by the [`transport::Transport`] trait.
//!
//! - [`udp_async::AsyncUdpTransport`]: Tokio UDP socket with tuned buffers
//! - [`lossy::LossyTransport`]: wrapper that drops outgoing datagrams on a policy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod lossy;
pub mod transport;
pub mod udp_async;

pub use lossy::{DropPolicy, LossyTransport};
pub use transport::{MAX_UDP_PAYLOAD, Transport, TransportError, TransportResult, TransportStats};
pub use udp_async::AsyncUdpTransport;
