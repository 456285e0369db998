//! Hand-driven peer for scripting exact datagram exchanges.

use std::net::SocketAddr;
use std::time::Duration;

use rand_core::OsRng;
use rudp_core::{Message, wire};
use rudp_crypto::{CryptoContext, Initiator, SessionKey};
use tokio::net::UdpSocket;
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// A UDP socket that speaks the wire format one datagram at a time.
pub struct RawPeer {
    socket: UdpSocket,
    server: SocketAddr,
    crypto: Option<CryptoContext>,
}

impl RawPeer {
    /// Bind a loopback socket aimed at `server`.
    pub async fn connect(server: SocketAddr) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind peer");
        Self {
            socket,
            server,
            crypto: None,
        }
    }

    /// Our address, which is also our session identity at the server.
    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().expect("Peer has no address")
    }

    /// Send literal wire text.
    pub async fn send(&self, text: &str) {
        self.send_bytes(text.as_bytes()).await;
    }

    /// Send raw bytes.
    pub async fn send_bytes(&self, bytes: &[u8]) {
        self.socket
            .send_to(bytes, self.server)
            .await
            .expect("Send failed");
    }

    /// Send `message`, sealed if a key exchange has run.
    pub async fn send_message(&self, message: &Message) {
        let key = if message.is_key_exchange() {
            None
        } else {
            self.crypto.as_ref().map(CryptoContext::sealing_key)
        };
        let frame = wire::encode(message, key.as_deref()).expect("Encode failed");
        self.send_bytes(&frame).await;
    }

    /// Next datagram, or `None` after `within`.
    pub async fn try_recv(&self, within: Duration) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; 65_536];
        match timeout(within, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => Some(buf[..len].to_vec()),
            Ok(Err(e)) => panic!("Receive failed: {e}"),
            Err(_) => None,
        }
    }

    /// Next datagram as text.
    ///
    /// # Panics
    ///
    /// Panics if nothing arrives in time.
    pub async fn recv(&self) -> String {
        let bytes = self
            .try_recv(RECV_TIMEOUT)
            .await
            .expect("Timed out waiting for the server");
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Next datagram decoded, opening it if sealed.
    pub async fn recv_message(&self) -> Message {
        let bytes = self
            .try_recv(RECV_TIMEOUT)
            .await
            .expect("Timed out waiting for the server");
        if wire::is_sealed(&bytes) {
            let ctx = self.crypto.as_ref().expect("Sealed frame before key exchange");
            wire::open(&bytes, ctx).expect("Frame did not open")
        } else {
            Message::decode(&bytes).expect("Server sent a malformed message")
        }
    }

    /// Assert the next datagram is exactly `text`.
    pub async fn expect(&self, text: &str) {
        assert_eq!(self.recv().await, text);
    }

    /// Run KEY_OFFER / KEY_GRANT and return the agreed session key.
    pub async fn key_exchange(&mut self) -> SessionKey {
        let initiator = Initiator::new(&mut OsRng);
        self.send_message(&Message::KeyOffer {
            public_key: initiator.public_key(),
        })
        .await;

        let Message::KeyGrant {
            public_key,
            wrapped_key,
        } = self.recv_message().await
        else {
            panic!("Expected KEY_GRANT");
        };
        let key = initiator
            .accept_grant(&public_key, &wrapped_key)
            .expect("Grant did not unwrap");

        self.crypto = Some(CryptoContext::new(
            initiator.public_key(),
            public_key,
            key.clone(),
            Duration::from_secs(300),
        ));
        key
    }
}
