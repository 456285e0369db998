//! # rudp Core
//!
//! Reliable, optionally encrypted, stop-and-wait resource transfer over UDP.
//!
//! This crate provides:
//! - The colon-delimited message codec and sealed-frame wrapping
//! - Per-peer sessions and the concurrent session registry
//! - The three-way open / four-way close handshake engine
//! - Stop-and-wait sending and in-order receiving with retransmission
//! - A [`Server`] (responder) and a [`Client`] (initiator)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Server / Client drivers                      │
//! │   (receive loop, per-datagram tasks, timers, key exchange)      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │            Handshake engine        Reliable transfer             │
//! │   (OPEN / ACK / CLOSE steps)    (stop-and-wait, sentinel)       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                 Session registry (one per peer)                  │
//! ├─────────────────────────────────────────────────────────────────┤
//! │               Wire: codec + optional sealed frames               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Sequence numbers
//!
//! A session uses one sequence space. OPEN carries `S`, the handshake
//! acknowledgement `S+1`, and data units start at `S+2`. After `N` units
//! the zero-length sentinel carries `S+2+N`, and CLOSE follows it.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod handshake;
pub mod registry;
pub mod resource;
pub mod server;
pub mod session;
pub mod transfer;
pub mod wire;

pub use client::{Client, FetchOutcome};
pub use codec::{Message, validate_resource_name};
pub use config::{ProtocolConfig, Role};
pub use error::{DecodeError, ProtocolError, Result};
pub use registry::{SessionHandle, SessionRegistry};
pub use resource::{MemoryStore, ResourceStore, join_units, split_units};
pub use server::{Server, ServerHandle};
pub use session::{PeerId, Session, SessionState};
pub use transfer::{Receiver, RetryPolicy, SendReport, Unit};
