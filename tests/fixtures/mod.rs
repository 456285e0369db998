//! Loopback test fixtures.

mod loopback;
mod raw_peer;

pub use loopback::{LoopbackFixture, fast_config};
pub use raw_peer::RawPeer;
