//! Async UDP transport.

use crate::transport::{MAX_UDP_PAYLOAD, Transport, TransportError, TransportResult, TransportStats};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::net::UdpSocket;

/// Default kernel socket buffer size.
pub const DEFAULT_SOCKET_BUFFER: usize = 512 * 1024;

#[derive(Debug, Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

/// Tokio UDP socket behind the [`Transport`] trait.
///
/// # Examples
///
/// ```no_run
/// use rudp_transport::udp_async::AsyncUdpTransport;
/// use rudp_transport::transport::Transport;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = AsyncUdpTransport::bind("127.0.0.1:0".parse::<std::net::SocketAddr>()?).await?;
/// transport.send_to(b"LIST_REQUEST", "127.0.0.1:22000".parse()?).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct AsyncUdpTransport {
    socket: Arc<UdpSocket>,
    closed: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl AsyncUdpTransport {
    /// Bind with the default socket buffer size.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if any socket setup step fails
    pub async fn bind<A: Into<SocketAddr>>(addr: A) -> TransportResult<Self> {
        Self::bind_with_buffer(addr, DEFAULT_SOCKET_BUFFER).await
    }

    /// Bind and size the kernel send/receive buffers.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if any socket setup step fails
    pub async fn bind_with_buffer<A: Into<SocketAddr>>(
        addr: A,
        buffer_size: usize,
    ) -> TransportResult<Self> {
        let addr = addr.into();
        let bind_err = |e: std::io::Error| TransportError::BindFailed(format!("{addr}: {e}"));

        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };
        let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
            .map_err(bind_err)?;

        socket.set_recv_buffer_size(buffer_size).map_err(bind_err)?;
        socket.set_send_buffer_size(buffer_size).map_err(bind_err)?;
        socket.bind(&addr.into()).map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).map_err(bind_err)?;
        tracing::debug!("UDP transport bound to {:?}", socket.local_addr().ok());

        Ok(Self::from_socket(socket))
    }

    /// Wrap an already-bound Tokio socket.
    #[must_use]
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
            closed: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
        }
    }
}

#[async_trait]
impl Transport for AsyncUdpTransport {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        if buf.len() > MAX_UDP_PAYLOAD {
            return Err(TransportError::Oversized {
                size: buf.len(),
                limit: MAX_UDP_PAYLOAD,
            });
        }

        match self.socket.send_to(buf, addr).await {
            Ok(sent) => {
                self.counters.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                Ok(sent)
            }
            Err(e) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Io(e))
            }
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }

        match self.socket.recv_from(buf).await {
            Ok((size, addr)) => {
                self.counters.bytes_received.fetch_add(size as u64, Ordering::Relaxed);
                self.counters.packets_received.fetch_add(1, Ordering::Relaxed);
                Ok((size, addr))
            }
            Err(e) => {
                self.counters.recv_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Io(e))
            }
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.socket.local_addr().map_err(TransportError::Io)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn stats(&self) -> TransportStats {
        let c = &self.counters;
        TransportStats {
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            packets_sent: c.packets_sent.load(Ordering::Relaxed),
            packets_received: c.packets_received.load(Ordering::Relaxed),
            packets_dropped: 0,
            send_errors: c.send_errors.load(Ordering::Relaxed),
            recv_errors: c.recv_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn loopback() -> AsyncUdpTransport {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        AsyncUdpTransport::bind(addr).await.unwrap()
    }

    #[tokio::test]
    async fn test_udp_bind() {
        let transport = loopback().await;
        let bound = transport.local_addr().unwrap();
        assert_ne!(bound.port(), 0);
        assert!(bound.is_ipv4());
    }

    #[tokio::test]
    async fn test_udp_send_recv_and_stats() {
        let server = loopback().await;
        let client = loopback().await;

        let sent = client
            .send_to(b"OPEN:report.txt:100", server.local_addr().unwrap())
            .await
            .unwrap();
        assert_eq!(sent, 19);

        let mut buf = vec![0u8; 1500];
        let (size, from) = timeout(Duration::from_secs(1), server.recv_from(&mut buf))
            .await
            .expect("Timeout")
            .unwrap();

        assert_eq!(&buf[..size], b"OPEN:report.txt:100");
        assert_eq!(from, client.local_addr().unwrap());
        assert_eq!(client.stats().packets_sent, 1);
        assert_eq!(client.stats().bytes_sent, 19);
        assert_eq!(server.stats().packets_received, 1);
    }

    #[tokio::test]
    async fn test_udp_close() {
        let transport = loopback().await;
        assert!(!transport.is_closed());

        transport.close().await.unwrap();
        assert!(transport.is_closed());

        let result = transport
            .send_to(b"ACK:1", "127.0.0.1:1234".parse().unwrap())
            .await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_udp_rejects_oversized() {
        let transport = loopback().await;
        let big = vec![b'x'; MAX_UDP_PAYLOAD + 1];
        let result = transport
            .send_to(&big, "127.0.0.1:1234".parse().unwrap())
            .await;
        assert!(matches!(result, Err(TransportError::Oversized { .. })));
        assert_eq!(transport.stats().packets_sent, 0);
    }

    #[tokio::test]
    async fn test_clones_share_counters() {
        let server = loopback().await;
        let client = loopback().await;
        let clone = client.clone();

        clone.send_to(b"ACK:7", server.local_addr().unwrap()).await.unwrap();
        assert_eq!(client.stats().packets_sent, 1);
    }

    #[tokio::test]
    async fn test_udp_from_socket() {
        let std_socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        std_socket.set_nonblocking(true).unwrap();

        let tokio_socket = UdpSocket::from_std(std_socket).unwrap();
        let transport = AsyncUdpTransport::from_socket(tokio_socket);

        assert!(!transport.is_closed());
        assert!(transport.local_addr().unwrap().is_ipv4());
    }
}
