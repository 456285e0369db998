//! Initiator.
//!
//! A [`Client`] talks to one responder: it opens a session, pulls or pushes
//! a resource with stop-and-wait, and closes. Calling [`Client::secure`]
//! first makes every later operation run over sealed frames.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use rand_core::{OsRng, RngCore};
use rudp_crypto::{CryptoContext, Initiator, PublicKey};
use rudp_transport::{AsyncUdpTransport, Transport};
use tokio::time::Instant;

use crate::codec::{Message, validate_resource_name};
use crate::config::{INITIAL_SEQ_RANGE, ProtocolConfig};
use crate::error::{ProtocolError, Result};
use crate::resource::join_units;
use crate::transfer::{self, AckEvent, Delivery, Receiver, SendReport, Unit, UnitChannel};
use crate::wire;

const RECV_BUFFER_SIZE: usize = 65_536;

/// What arrived from the responder.
#[derive(Debug)]
enum Inbound {
    Message(Message),
    DecryptFailed,
    /// A KEY_GRANT replaced the session key
    Rekeyed,
}

/// Resource received by [`Client::fetch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Units in order, including markers for frames that failed to decrypt
    pub units: Vec<Unit>,
}

impl FetchOutcome {
    /// Applied payloads in order.
    pub fn payloads(&self) -> impl Iterator<Item = &[u8]> {
        self.units.iter().filter_map(|unit| match unit {
            Unit::Applied(bytes) => Some(bytes.as_slice()),
            Unit::DecryptFailed => None,
        })
    }

    /// Concatenated payloads.
    #[must_use]
    pub fn bytes(&self) -> Vec<u8> {
        join_units(self.payloads())
    }

    /// Number of decrypt-failure markers.
    #[must_use]
    pub fn decrypt_failures(&self) -> usize {
        self.units
            .iter()
            .filter(|unit| matches!(unit, Unit::DecryptFailed))
            .count()
    }
}

/// Protocol initiator.
pub struct Client<T: Transport> {
    transport: T,
    server: SocketAddr,
    config: ProtocolConfig,
    initiator: Initiator,
    crypto: Option<CryptoContext>,
    encrypt: bool,
    buf: Vec<u8>,
}

impl Client<AsyncUdpTransport> {
    /// Bind an ephemeral UDP port for talking to `server`.
    ///
    /// # Errors
    ///
    /// Fails on an invalid config or if the socket cannot be bound.
    pub async fn connect(server: SocketAddr, config: ProtocolConfig) -> Result<Self> {
        let local: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let transport = AsyncUdpTransport::bind(local).await?;
        Self::with_transport(transport, server, config)
    }
}

impl<T: Transport> Client<T> {
    /// Use an existing transport.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::InvalidConfig` if `config` does not validate.
    pub fn with_transport(transport: T, server: SocketAddr, config: ProtocolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            transport,
            server,
            config,
            initiator: Initiator::new(&mut OsRng),
            crypto: None,
            encrypt: false,
            buf: vec![0u8; RECV_BUFFER_SIZE],
        })
    }

    /// Responder address.
    #[must_use]
    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Local address.
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.transport.local_addr()?)
    }

    /// Static key offered in KEY_OFFER and PUBLIC_KEY.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.initiator.public_key()
    }

    /// Whether a session key is installed.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.crypto.is_some()
    }

    /// How many times the session key has been replaced, if any.
    #[must_use]
    pub fn crypto_generation(&self) -> Option<u32> {
        self.crypto.as_ref().map(CryptoContext::generation)
    }

    /// Run the key exchange. Every later operation is sealed, and a new
    /// exchange runs automatically after each close.
    ///
    /// # Errors
    ///
    /// `HandshakeTimeout` if no KEY_GRANT arrives, `Remote` if the
    /// responder refuses.
    pub async fn secure(&mut self) -> Result<()> {
        self.encrypt = true;
        if self.crypto.is_some() {
            return Ok(());
        }

        let offer = Message::KeyOffer {
            public_key: self.initiator.public_key(),
        };
        for attempt in 1..=self.config.max_attempts {
            self.send(&offer).await?;
            let deadline = Instant::now() + self.config.handshake_timeout;
            while let Some(inbound) = self.recv_until(deadline).await? {
                match inbound {
                    Inbound::Message(Message::KeyGrant {
                        public_key,
                        wrapped_key,
                    }) => match self.initiator.accept_grant(&public_key, &wrapped_key) {
                        Ok(key) => {
                            let ctx = CryptoContext::new(
                                self.initiator.public_key(),
                                public_key,
                                key,
                                self.config.key_lifetime,
                            );
                            tracing::info!(
                                "Session key with {} established ({})",
                                self.server,
                                ctx.sealing_key().fingerprint()
                            );
                            self.crypto = Some(ctx);
                            return Ok(());
                        }
                        Err(e) => tracing::warn!("Rejected KEY_GRANT: {}", e),
                    },
                    Inbound::Message(Message::Error { reason }) => {
                        return Err(ProtocolError::Remote(reason));
                    }
                    other => tracing::debug!("Ignoring {:?} during key exchange", other),
                }
            }
            tracing::debug!("No KEY_GRANT after attempt {}", attempt);
        }
        Err(ProtocolError::HandshakeTimeout {
            attempts: self.config.max_attempts,
        })
    }

    /// Replace the session key.
    ///
    /// # Errors
    ///
    /// `EncryptionRequired` without a session key, `HandshakeTimeout` if the
    /// responder never grants a new one.
    pub async fn rekey(&mut self) -> Result<()> {
        let before = self
            .crypto
            .as_ref()
            .map(CryptoContext::generation)
            .ok_or(ProtocolError::EncryptionRequired)?;

        let request = Message::PublicKey {
            public_key: self.initiator.public_key(),
        };
        for _ in 0..self.config.max_attempts {
            self.send(&request).await?;
            let deadline = Instant::now() + self.config.handshake_timeout;
            loop {
                if self.crypto_generation().is_some_and(|g| g > before) {
                    return Ok(());
                }
                match self.recv_until(deadline).await? {
                    None => break,
                    Some(Inbound::Message(Message::Error { reason })) => {
                        return Err(ProtocolError::Remote(reason));
                    }
                    Some(_) => {}
                }
            }
        }
        Err(ProtocolError::HandshakeTimeout {
            attempts: self.config.max_attempts,
        })
    }

    /// Names the responder offers.
    ///
    /// # Errors
    ///
    /// `HandshakeTimeout` if no LIST_RESPONSE arrives.
    pub async fn list(&mut self) -> Result<Vec<String>> {
        self.ensure_secure().await?;
        for _ in 0..self.config.max_attempts {
            self.send(&Message::ListRequest).await?;
            let deadline = Instant::now() + self.config.ack_timeout;
            while let Some(inbound) = self.recv_until(deadline).await? {
                match inbound {
                    Inbound::Message(Message::ListResponse { listing }) => {
                        return Ok(listing
                            .split('\n')
                            .filter(|name| !name.is_empty())
                            .map(str::to_owned)
                            .collect());
                    }
                    Inbound::Message(Message::Error { reason }) => {
                        return Err(ProtocolError::Remote(reason));
                    }
                    _ => {}
                }
            }
        }
        Err(ProtocolError::HandshakeTimeout {
            attempts: self.config.max_attempts,
        })
    }

    /// Pull `resource` from a source-role responder.
    ///
    /// # Errors
    ///
    /// Fails if the handshake times out, the responder reports an error, or
    /// the responder goes quiet mid-transfer.
    pub async fn fetch(&mut self, resource: &str) -> Result<FetchOutcome> {
        validate_resource_name(resource)?;
        self.ensure_secure().await?;

        let open_seq = initial_seq();
        let ack_seq = self.open(resource, open_seq).await?;
        let mut receiver = Receiver::new(ack_seq.checked_add(1).ok_or(ProtocolError::SequenceExhausted)?);
        let silence = self.config.ack_timeout * (self.config.max_attempts + 1);

        let sentinel = loop {
            let deadline = Instant::now() + silence;
            let Some(inbound) = self.recv_until(deadline).await? else {
                return Err(ProtocolError::TransferAborted {
                    seq: receiver.next_expected(),
                    attempts: self.config.max_attempts,
                });
            };
            match inbound {
                Inbound::DecryptFailed => receiver.record_decrypt_failure(),
                Inbound::Rekeyed => {}
                Inbound::Message(Message::Data { seq, payload }) => {
                    let outcome = receiver.on_data(seq, &payload)?;
                    self.refresh_key().await?;
                    self.send(&Message::Ack { seq: outcome.ack }).await?;
                    if outcome.delivery == (Delivery::EndOfData { first: true }) {
                        break seq;
                    }
                }
                Inbound::Message(Message::OpenAck { seq, .. }) if seq == ack_seq => {
                    self.send(&Message::Ack { seq: ack_seq }).await?;
                }
                Inbound::Message(Message::Error { reason }) => {
                    return Err(ProtocolError::Remote(reason));
                }
                Inbound::Message(other) => {
                    tracing::debug!("Ignoring {} during fetch", other);
                }
            }
        };

        let outcome = FetchOutcome {
            units: receiver.into_units(),
        };
        tracing::info!(
            "Fetched {:?} from {} ({} units)",
            resource,
            self.server,
            outcome.units.len()
        );
        self.close(sentinel.checked_add(1).ok_or(ProtocolError::SequenceExhausted)?)
            .await?;
        Ok(outcome)
    }

    /// Push `units` as `resource` to a sink-role responder.
    ///
    /// # Errors
    ///
    /// `EmptyUnit` or `UnitTooLarge` before anything is sent; otherwise the
    /// same failures as [`Client::fetch`].
    pub async fn push(&mut self, resource: &str, units: &[Vec<u8>]) -> Result<SendReport> {
        validate_resource_name(resource)?;
        if let Some(index) = units.iter().position(Vec::is_empty) {
            return Err(ProtocolError::EmptyUnit(index));
        }
        self.ensure_secure().await?;

        let open_seq = initial_seq();
        let ack_seq = self.open(resource, open_seq).await?;
        let first = ack_seq.checked_add(1).ok_or(ProtocolError::SequenceExhausted)?;

        let policy = self.config.retry_policy();
        let report = {
            let mut channel = ClientChannel {
                client: self,
                handshake_ack: ack_seq,
            };
            transfer::send_units(&mut channel, first, units, policy).await?
        };
        tracing::info!(
            "Pushed {:?} to {}: {} units, {} retransmissions",
            resource,
            self.server,
            report.units,
            report.retransmissions
        );

        self.close(
            report
                .sentinel_seq
                .checked_add(1)
                .ok_or(ProtocolError::SequenceExhausted)?,
        )
        .await?;
        Ok(report)
    }

    async fn ensure_secure(&mut self) -> Result<()> {
        if self.encrypt && self.crypto.is_none() {
            self.secure().await?;
        }
        Ok(())
    }

    async fn refresh_key(&mut self) -> Result<()> {
        if self.crypto.as_ref().is_some_and(CryptoContext::is_expired) {
            tracing::debug!("Session key expired, rekeying");
            self.rekey().await?;
        }
        Ok(())
    }

    /// Three-way open. Returns the sequence of the final ACK.
    async fn open(&mut self, resource: &str, seq: u64) -> Result<u64> {
        let expected = seq.checked_add(1).ok_or(ProtocolError::SequenceExhausted)?;
        let open = Message::Open {
            resource: resource.to_string(),
            seq,
        };

        for attempt in 1..=self.config.max_attempts {
            self.send(&open).await?;
            let deadline = Instant::now() + self.config.handshake_timeout;
            while let Some(inbound) = self.recv_until(deadline).await? {
                match inbound {
                    Inbound::Message(Message::OpenAck {
                        resource: acked,
                        seq: ack,
                    }) if acked == resource && ack == expected => {
                        self.send(&Message::Ack { seq: expected }).await?;
                        tracing::debug!("Session {:?} with {} established", resource, self.server);
                        return Ok(expected);
                    }
                    Inbound::Message(Message::Error { reason }) => {
                        return Err(ProtocolError::Remote(reason));
                    }
                    other => tracing::debug!("Ignoring {:?} during open", other),
                }
            }
            tracing::debug!("No OPEN_ACK after attempt {}", attempt);
        }
        Err(ProtocolError::HandshakeTimeout {
            attempts: self.config.max_attempts,
        })
    }

    /// Four-way close starting at `seq`.
    async fn close(&mut self, seq: u64) -> Result<()> {
        let expected = seq.checked_add(1).ok_or(ProtocolError::SequenceExhausted)?;
        let sentinel = seq.saturating_sub(1);

        for _ in 0..self.config.max_attempts {
            self.send(&Message::Close { seq }).await?;
            let deadline = Instant::now() + self.config.ack_timeout;
            while let Some(inbound) = self.recv_until(deadline).await? {
                match inbound {
                    Inbound::Message(Message::Close { seq: theirs }) if theirs == expected => {
                        self.send(&Message::Ack { seq: expected }).await?;
                        tracing::debug!("Session with {} closed", self.server);
                        self.crypto = None;
                        return Ok(());
                    }
                    Inbound::Message(Message::Data { seq: data, payload })
                        if data == sentinel && payload.is_empty() =>
                    {
                        self.send(&Message::Ack { seq: sentinel }).await?;
                    }
                    Inbound::Message(Message::Error { reason }) => {
                        return Err(ProtocolError::Remote(reason));
                    }
                    _ => {}
                }
            }
        }
        Err(ProtocolError::AckTimeout {
            seq,
            attempts: self.config.max_attempts,
        })
    }

    async fn send(&self, message: &Message) -> Result<()> {
        let key = if message.is_key_exchange() {
            None
        } else {
            self.crypto.as_ref().map(CryptoContext::sealing_key)
        };
        let frame = wire::encode_bounded(message, key.as_deref(), self.config.max_datagram_size)?;
        self.transport.send_to(&frame, self.server).await?;
        tracing::trace!("Sent {} to {}", message, self.server);
        Ok(())
    }

    /// Next datagram from the responder before `deadline`. Key grants for
    /// an existing session are installed here and not returned.
    async fn recv_until(&mut self, deadline: Instant) -> Result<Option<Inbound>> {
        loop {
            let received =
                tokio::time::timeout_at(deadline, self.transport.recv_from(&mut self.buf)).await;
            let Ok(received) = received else {
                return Ok(None);
            };
            let (len, from) = received?;
            if from != self.server {
                tracing::debug!("Ignoring datagram from unexpected peer {}", from);
                continue;
            }
            let datagram = &self.buf[..len];

            if wire::is_sealed(datagram) {
                let Some(ctx) = &self.crypto else {
                    tracing::debug!("Sealed frame without a session key");
                    continue;
                };
                match wire::open(datagram, ctx) {
                    Ok(message) => return Ok(Some(Inbound::Message(message))),
                    Err(ProtocolError::DecryptFailure) => {
                        tracing::warn!("Could not decrypt frame from {}", from);
                        return Ok(Some(Inbound::DecryptFailed));
                    }
                    Err(e) => {
                        tracing::debug!("Dropping sealed frame: {}", e);
                        continue;
                    }
                }
            }

            let message = match Message::decode(datagram) {
                Ok(message) => message,
                Err(e) => {
                    tracing::debug!("Dropping malformed datagram: {}", e);
                    continue;
                }
            };
            match message {
                Message::KeyGrant {
                    public_key,
                    wrapped_key,
                } if self.crypto.is_some() => {
                    if self.install_grant(&public_key, &wrapped_key) {
                        return Ok(Some(Inbound::Rekeyed));
                    }
                }
                Message::Error { .. } => return Ok(Some(Inbound::Message(message))),
                message if self.crypto.is_some() && !message.is_key_exchange() => {
                    tracing::warn!("Dropping plaintext {} on encrypted session", message.tag());
                }
                message => return Ok(Some(Inbound::Message(message))),
            }
        }
    }

    /// Install a grant for the current session. Returns true if the key
    /// changed.
    fn install_grant(&mut self, responder: &PublicKey, wrapped_key: &[u8]) -> bool {
        let Some(ctx) = self.crypto.as_mut() else {
            return false;
        };
        if ctx.verify_remote(responder).is_err() {
            tracing::debug!("KEY_GRANT from an unknown key ignored");
            return false;
        }
        match self.initiator.accept_grant(responder, wrapped_key) {
            Ok(key) if key != *ctx.sealing_key() => {
                ctx.install(key);
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::warn!("Rejected KEY_GRANT: {}", e);
                false
            }
        }
    }
}

fn initial_seq() -> u64 {
    u64::from(OsRng.next_u32()) % INITIAL_SEQ_RANGE
}

/// Push side of a transfer over a client.
struct ClientChannel<'a, T: Transport> {
    client: &'a mut Client<T>,
    handshake_ack: u64,
}

#[async_trait]
impl<T: Transport> UnitChannel for ClientChannel<'_, T> {
    async fn send_data(&mut self, seq: u64, payload: &[u8]) -> Result<()> {
        self.client.refresh_key().await?;
        self.client
            .send(&Message::Data {
                seq,
                payload: payload.to_vec(),
            })
            .await
    }

    async fn next_ack(&mut self, timeout: Duration) -> Result<AckEvent> {
        let deadline = Instant::now() + timeout;
        while let Some(inbound) = self.client.recv_until(deadline).await? {
            match inbound {
                Inbound::Message(Message::Ack { seq }) => return Ok(AckEvent::Ack(seq)),
                Inbound::Message(Message::OpenAck { seq, .. }) if seq == self.handshake_ack => {
                    self.client
                        .send(&Message::Ack {
                            seq: self.handshake_ack,
                        })
                        .await?;
                }
                Inbound::Message(Message::Error { reason }) => {
                    return Err(ProtocolError::Remote(reason));
                }
                _ => {}
            }
        }
        Ok(AckEvent::TimedOut)
    }

    fn check_unit(&self, seq: u64, payload: &[u8]) -> Result<()> {
        let plain = Message::Data {
            seq,
            payload: payload.to_vec(),
        }
        .encode()
        .len();
        let size = wire::framed_len(plain, self.client.encrypt || self.client.crypto.is_some());
        let limit = self.client.config.max_datagram_size;
        if size > limit {
            return Err(ProtocolError::UnitTooLarge { size, limit });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;
    use crate::resource::{MemoryStore, ResourceStore, split_units};
    use crate::server::Server;
    use std::sync::Arc;

    fn fast_config(role: Role) -> ProtocolConfig {
        ProtocolConfig {
            role,
            ack_timeout: Duration::from_millis(200),
            handshake_timeout: Duration::from_millis(300),
            ..ProtocolConfig::default()
        }
    }

    async fn serve(role: Role, store: Arc<MemoryStore>) -> crate::server::ServerHandle {
        let transport = AsyncUdpTransport::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap())
            .await
            .unwrap();
        Server::new(transport, store, fast_config(role))
            .unwrap()
            .spawn()
            .unwrap()
    }

    #[test]
    fn test_initial_seq_in_range() {
        for _ in 0..1000 {
            assert!(initial_seq() < INITIAL_SEQ_RANGE);
        }
    }

    #[test]
    fn test_fetch_outcome_skips_markers() {
        let outcome = FetchOutcome {
            units: vec![
                Unit::Applied(b"a\n".to_vec()),
                Unit::DecryptFailed,
                Unit::Applied(b"b\n".to_vec()),
            ],
        };
        assert_eq!(outcome.bytes(), b"a\nb\n");
        assert_eq!(outcome.decrypt_failures(), 1);
    }

    #[tokio::test]
    async fn test_fetch_plaintext() {
        let store = Arc::new(MemoryStore::new());
        store.insert("poem.txt", "roses\nviolets\n\nsugar\n");
        let server = serve(Role::Source, store).await;

        let mut client = Client::connect(server.local_addr(), fast_config(Role::Source))
            .await
            .unwrap();
        let outcome = client.fetch("poem.txt").await.unwrap();

        assert_eq!(outcome.bytes(), b"roses\nviolets\n\nsugar\n");
        assert_eq!(outcome.units.len(), 4);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server.registry().is_empty());
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_push_encrypted() {
        let store = Arc::new(MemoryStore::new());
        let server = serve(Role::Sink, store.clone()).await;

        let mut client = Client::connect(server.local_addr(), fast_config(Role::Sink))
            .await
            .unwrap();
        client.secure().await.unwrap();
        let units = split_units(b"one\ntwo\n");
        let report = client.push("upload.txt", &units).await.unwrap();

        assert_eq!(report.units, 2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get("upload.txt").unwrap(), b"one\ntwo\n");
        assert!(!client.is_secure());
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_missing_resource() {
        let store = Arc::new(MemoryStore::new());
        let server = serve(Role::Source, store).await;

        let mut client = Client::connect(server.local_addr(), fast_config(Role::Source))
            .await
            .unwrap();
        let err = client.fetch("nope.txt").await.unwrap_err();
        assert!(matches!(err, ProtocolError::Remote(ref r) if r.starts_with("ResourceUnavailable")));
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_push_rejects_empty_unit_before_sending() {
        let mut client = Client::connect("127.0.0.1:9".parse().unwrap(), ProtocolConfig::default())
            .await
            .unwrap();
        let err = client
            .push("x.txt", &[b"a".to_vec(), Vec::new()])
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::EmptyUnit(1)));
    }

    #[tokio::test]
    async fn test_list_after_secure() {
        let store = Arc::new(MemoryStore::new());
        store.insert("a.txt", "1");
        store.insert("b.txt", "2");
        let server = serve(Role::Source, store.clone()).await;

        let mut client = Client::connect(server.local_addr(), fast_config(Role::Source))
            .await
            .unwrap();
        client.secure().await.unwrap();
        assert_eq!(client.list().await.unwrap(), store.list());
        server.shutdown().await.unwrap();
    }
}
