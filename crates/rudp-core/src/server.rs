//! Responder.
//!
//! One receive loop reads datagrams off the shared transport and hands each
//! to its own task. Tasks find the peer's session in the registry, lock it,
//! run one handshake step, then send replies and carry out the step's side
//! effect with the lock released. In the source role an established session
//! gets a long-lived send loop that is fed ACKs over a channel.
//!
//! Key exchange messages are always answered in clear. Everything else to
//! or from a peer with crypto state is a sealed frame.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand_core::OsRng;
use rudp_crypto::{CryptoContext, Grant, KeyPair, PublicKey, Responder, SessionKey};
use rudp_transport::{Transport, TransportError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::codec::Message;
use crate::config::{ProtocolConfig, Role};
use crate::error::{ProtocolError, Result};
use crate::handshake::{self, Effect, Step};
use crate::registry::{SessionHandle, SessionRegistry};
use crate::resource::ResourceStore;
use crate::session::{PeerId, Session, SessionState};
use crate::transfer::{self, AckEvent, Unit, UnitChannel};
use crate::wire;

/// Receive buffer size; one byte more than any UDP payload.
const RECV_BUFFER_SIZE: usize = 65_536;

struct Shared<T> {
    transport: T,
    registry: Arc<SessionRegistry>,
    store: Arc<dyn ResourceStore>,
    config: ProtocolConfig,
    responder: Responder,
}

/// Protocol responder bound to one transport.
pub struct Server<T: Transport + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport + 'static> Server<T> {
    /// Create a responder with a fresh static key pair.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::InvalidConfig` if `config` does not validate.
    pub fn new(transport: T, store: Arc<dyn ResourceStore>, config: ProtocolConfig) -> Result<Self> {
        Self::with_keys(transport, store, config, KeyPair::generate(&mut OsRng))
    }

    /// Create a responder with a given static key pair.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::InvalidConfig` if `config` does not validate.
    pub fn with_keys(
        transport: T,
        store: Arc<dyn ResourceStore>,
        config: ProtocolConfig,
        keys: KeyPair,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                transport,
                registry: Arc::new(SessionRegistry::new()),
                store,
                config,
                responder: Responder::new(keys),
            }),
        })
    }

    /// Bound address.
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.shared.transport.local_addr()?)
    }

    /// Live sessions.
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.shared.registry
    }

    /// Static public key offered in KEY_GRANT.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.shared.responder.public_key()
    }

    /// Serve until `shutdown` flips to true or the transport closes.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok`; receive errors are logged and skipped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let config = &self.shared.config;
        let sweeper = tokio::spawn(Arc::clone(&self.shared.registry).run_sweeper(
            config.idle_timeout,
            config.sweep_interval,
            shutdown.clone(),
        ));

        tracing::info!(
            "Serving on {:?} (role {:?}, encryption {})",
            self.shared.transport.local_addr().ok(),
            config.role,
            if config.require_encryption { "required" } else { "optional" }
        );

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = self.shared.transport.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        let datagram = buf[..len].to_vec();
                        let shared = Arc::clone(&self.shared);
                        tokio::spawn(async move {
                            shared.handle_datagram(from, datagram).await;
                        });
                    }
                    Err(TransportError::Closed) => break,
                    Err(e) => tracing::warn!("Receive error: {}", e),
                },
            }
        }

        sweeper.abort();
        self.shared.registry.clear();
        tracing::info!("Server stopped");
        Ok(())
    }

    /// Run on a background task.
    ///
    /// # Errors
    ///
    /// Fails if the local address cannot be read.
    pub fn spawn(self) -> Result<ServerHandle> {
        let local_addr = self.local_addr()?;
        let registry = Arc::clone(&self.shared.registry);
        let (shutdown, signal) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(signal).await });
        Ok(ServerHandle {
            local_addr,
            registry,
            shutdown,
            task,
        })
    }
}

/// Handle to a server running on a background task.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl ServerHandle {
    /// Address the server is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Live sessions.
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Stop the server and wait for it.
    ///
    /// # Errors
    ///
    /// Returns the server's own error, or `Cancelled` if its task panicked.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.send_replace(true);
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("Server task failed: {}", e);
                Err(ProtocolError::Cancelled)
            }
        }
    }
}

impl<T: Transport + 'static> Shared<T> {
    async fn handle_datagram(self: Arc<Self>, peer: PeerId, datagram: Vec<u8>) {
        tracing::debug!("Received {} bytes from {}", datagram.len(), peer);
        if let Err(err) = self.dispatch(peer, &datagram).await {
            if err.warrants_reply() {
                tracing::debug!("Replying ERROR to {}: {}", peer, err);
                if let Err(send_err) = self.send_error(peer, &err).await {
                    tracing::debug!("Could not send ERROR to {}: {}", peer, send_err);
                }
            } else {
                tracing::debug!("Ignoring datagram from {}: {}", peer, err);
            }
            if err.terminates_session() && self.registry.remove(&peer).is_some() {
                tracing::info!("Session {} removed: {}", peer, err);
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, peer: PeerId, datagram: &[u8]) -> Result<()> {
        if wire::is_sealed(datagram) {
            return self.on_sealed(peer, datagram).await;
        }

        match Message::decode(datagram)? {
            Message::KeyOffer { public_key } => self.on_key_offer(peer, public_key).await,
            Message::PublicKey { public_key } => self.on_rekey(peer, public_key).await,
            Message::Error { reason } => {
                tracing::warn!("Peer {} reported error: {}", peer, reason);
                Ok(())
            }
            message => {
                if let Some(handle) = self.registry.get(&peer) {
                    if handle.lock().await.crypto().is_some() {
                        tracing::warn!(
                            "Dropping plaintext {} from {}: session is encrypted",
                            message.tag(),
                            peer
                        );
                        return Ok(());
                    }
                }
                if self.config.require_encryption {
                    return Err(ProtocolError::EncryptionRequired);
                }
                self.on_message(peer, message).await
            }
        }
    }

    async fn on_sealed(self: &Arc<Self>, peer: PeerId, datagram: &[u8]) -> Result<()> {
        let handle = self
            .registry
            .get(&peer)
            .ok_or(ProtocolError::UnknownSession(peer))?;

        let message = {
            let mut session = handle.lock().await;
            let ctx = session.crypto().ok_or(ProtocolError::UnknownSession(peer))?;
            match wire::open(datagram, ctx) {
                Ok(message) => message,
                Err(ProtocolError::DecryptFailure) => {
                    tracing::warn!("Could not decrypt frame from {}", peer);
                    if self.config.role == Role::Sink
                        && session.state() == SessionState::Established
                    {
                        session.receiver_mut().record_decrypt_failure();
                    }
                    return Err(ProtocolError::DecryptFailure);
                }
                Err(e) => return Err(e),
            }
        };

        if matches!(message, Message::Error { .. }) {
            tracing::warn!("Peer {} reported error: {}", peer, message);
            return Ok(());
        }
        self.on_message(peer, message).await
    }

    async fn on_message(self: &Arc<Self>, peer: PeerId, message: Message) -> Result<()> {
        let role = self.config.role;
        match message {
            Message::ListRequest => {
                let listing = self.store.list().join("\n");
                self.send(peer, &Message::ListResponse { listing }).await
            }
            Message::Open { resource, seq } => self.on_open(peer, &resource, seq).await,
            Message::Ack { seq } => self.step(peer, |s| handshake::on_ack(s, seq, role)).await,
            Message::Data { seq, payload } => {
                self.step(peer, |s| handshake::on_data(s, seq, &payload, role))
                    .await
            }
            Message::Close { seq } => self.step(peer, |s| handshake::on_close(s, seq)).await,
            other => {
                tracing::debug!("Ignoring unexpected {} from {}", other.tag(), peer);
                Ok(())
            }
        }
    }

    async fn on_open(self: &Arc<Self>, peer: PeerId, resource: &str, seq: u64) -> Result<()> {
        let (handle, _) = self.registry.get_or_create(peer);
        let (result, key, keep) = {
            let mut session = handle.lock().await;
            let result =
                handshake::on_open(&mut session, resource, seq, self.config.role, self.store.as_ref());
            let keep = session.state() != SessionState::Idle || session.crypto().is_some();
            (result, session.sealing_key(), keep)
        };

        match result {
            Ok(step) => self.finish_step(&handle, step, key).await,
            Err(err) => {
                if !keep {
                    self.registry.remove_handle(&handle);
                }
                Err(err)
            }
        }
    }

    async fn step<F>(self: &Arc<Self>, peer: PeerId, f: F) -> Result<()>
    where
        F: FnOnce(&mut Session) -> Result<Step> + Send,
    {
        let handle = self
            .registry
            .get(&peer)
            .ok_or(ProtocolError::UnknownSession(peer))?;
        let (step, key) = {
            let mut session = handle.lock().await;
            let step = f(&mut session)?;
            (step, session.sealing_key())
        };
        self.finish_step(&handle, step, key).await
    }

    async fn finish_step(
        self: &Arc<Self>,
        handle: &Arc<SessionHandle>,
        step: Step,
        key: Option<Arc<SessionKey>>,
    ) -> Result<()> {
        for reply in &step.replies {
            self.send_with(handle.peer(), reply, key.as_deref()).await?;
        }
        self.apply(handle, step.effect);
        Ok(())
    }

    fn apply(self: &Arc<Self>, handle: &Arc<SessionHandle>, effect: Effect) {
        match effect {
            Effect::None => {}
            Effect::AwaitHandshakeAck => {
                self.spawn_retransmit(handle, SessionState::OpenReceived);
            }
            Effect::StartSending => {
                let shared = Arc::clone(self);
                let handle = Arc::clone(handle);
                tokio::spawn(async move { shared.send_loop(handle).await });
            }
            Effect::RouteAck(seq) => handle.deliver_ack(seq),
            Effect::Deliver { resource, units } => self.deliver(handle.peer(), &resource, units),
            Effect::Closing => {
                handle.stop_transfer();
                self.spawn_retransmit(handle, SessionState::CloseWait1);
            }
            Effect::Closed => {
                self.registry.remove_handle(handle);
            }
        }
    }

    fn deliver(&self, peer: PeerId, resource: &str, units: Vec<Unit>) {
        let total = units.len();
        let payloads: Vec<Vec<u8>> = units
            .into_iter()
            .filter_map(|unit| match unit {
                Unit::Applied(bytes) => Some(bytes),
                Unit::DecryptFailed => None,
            })
            .collect();
        if payloads.len() != total {
            tracing::warn!(
                "{} of {} units of {:?} from {} failed to decrypt",
                total - payloads.len(),
                total,
                resource,
                peer
            );
        }

        let count = payloads.len();
        match self.store.store(resource, payloads) {
            Ok(()) => tracing::info!("Stored {:?} from {} ({} units)", resource, peer, count),
            Err(e) => tracing::warn!("Failed to store {:?} from {}: {}", resource, peer, e),
        }
    }

    /// Resend the pending handshake message while the session stays in
    /// `state`. Gives up and removes the session after `max_attempts` sends.
    fn spawn_retransmit(self: &Arc<Self>, handle: &Arc<SessionHandle>, state: SessionState) {
        let shared = Arc::clone(self);
        let handle = Arc::clone(handle);
        tokio::spawn(async move { shared.retransmit(handle, state).await });
    }

    async fn retransmit(self: Arc<Self>, handle: Arc<SessionHandle>, state: SessionState) {
        let interval = match state {
            SessionState::OpenReceived => self.config.handshake_timeout,
            _ => self.config.ack_timeout,
        };
        let max_attempts = self.config.max_attempts;
        let mut shutdown = handle.shutdown_signal();
        let mut sent = 1;

        loop {
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => return,
            }

            let (message, key) = {
                let session = handle.lock().await;
                if session.state() != state || handle.is_shut_down() {
                    return;
                }
                (pending_message(&session), session.sealing_key())
            };
            let Some(message) = message else {
                return;
            };

            if sent >= max_attempts {
                let err = match state {
                    SessionState::OpenReceived => ProtocolError::HandshakeTimeout {
                        attempts: max_attempts,
                    },
                    _ => ProtocolError::AckTimeout {
                        seq: message_seq(&message),
                        attempts: max_attempts,
                    },
                };
                tracing::warn!("Session {} abandoned in {:?}: {}", handle.peer(), state, err);
                if err.warrants_reply() {
                    if let Err(e) = self
                        .send_with(handle.peer(), &error_message(&err), key.as_deref())
                        .await
                    {
                        tracing::debug!("Could not send ERROR to {}: {}", handle.peer(), e);
                    }
                }
                self.registry.remove_handle(&handle);
                return;
            }

            tracing::debug!(
                "Retransmitting {} to {} ({}/{})",
                message,
                handle.peer(),
                sent + 1,
                max_attempts
            );
            if let Err(e) = self.send_with(handle.peer(), &message, key.as_deref()).await {
                tracing::debug!("Retransmit to {} failed: {}", handle.peer(), e);
            }
            sent += 1;
        }
    }

    async fn send_loop(self: Arc<Self>, handle: Arc<SessionHandle>) {
        let peer = handle.peer();
        let (resource, first_seq, sealed) = {
            let session = handle.lock().await;
            (
                session.resource().map(str::to_owned),
                session.next_send_seq(),
                session.crypto().is_some(),
            )
        };
        let Some(resource) = resource else {
            return;
        };
        let Some(acks) = handle.take_ack_receiver().await else {
            tracing::debug!("Send loop for {} already running", peer);
            return;
        };

        let result = match self.store.load(&resource) {
            Ok(units) => {
                tracing::info!("Sending {:?} to {} ({} units)", resource, peer, units.len());
                let mut channel = SessionChannel {
                    shared: &self,
                    handle: &handle,
                    acks,
                    stop: handle.transfer_stopped(),
                    sealed,
                };
                transfer::send_units(&mut channel, first_seq, &units, self.config.retry_policy())
                    .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(report) => tracing::info!(
                "Sent {:?} to {}: {} units, {} retransmissions",
                resource,
                peer,
                report.units,
                report.retransmissions
            ),
            Err(ProtocolError::Cancelled) => {
                tracing::debug!("Transfer of {:?} to {} cancelled", resource, peer);
            }
            Err(err) => {
                tracing::warn!("Transfer of {:?} to {} failed: {}", resource, peer, err);
                if let Err(send_err) = self.send_error(peer, &err).await {
                    tracing::debug!("Could not send ERROR to {}: {}", peer, send_err);
                }
                if self.registry.remove_handle(&handle) {
                    tracing::info!("Session {} removed after failed transfer", peer);
                }
            }
        }
    }

    async fn on_key_offer(&self, peer: PeerId, offered: PublicKey) -> Result<()> {
        let Grant {
            public_key,
            wrapped_key,
            session_key,
        } = self.responder.grant(&offered, &mut OsRng)?;

        let (handle, _) = self.registry.get_or_create(peer);
        {
            let mut session = handle.lock().await;
            if session.state() != SessionState::Idle {
                return Err(ProtocolError::AlreadyOpen);
            }
            // A repeated offer rotates, so a grant lost in flight still opens.
            match session.crypto_mut() {
                Some(ctx) if ctx.remote_public() == &offered => ctx.install(session_key),
                _ => session.set_crypto(CryptoContext::new(
                    self.responder.public_key(),
                    offered,
                    session_key,
                    self.config.key_lifetime,
                )),
            }
            session.touch();
        }
        tracing::info!("Key exchange with {} complete", peer);

        self.send_with(
            peer,
            &Message::KeyGrant {
                public_key,
                wrapped_key,
            },
            None,
        )
        .await
    }

    async fn on_rekey(&self, peer: PeerId, offered: PublicKey) -> Result<()> {
        let handle = self
            .registry
            .get(&peer)
            .ok_or(ProtocolError::UnknownSession(peer))?;

        let (public_key, wrapped_key) = {
            let mut session = handle.lock().await;
            let ctx = session
                .crypto_mut()
                .ok_or(ProtocolError::UnknownSession(peer))?;
            ctx.verify_remote(&offered)?;
            let Grant {
                public_key,
                wrapped_key,
                session_key,
            } = self.responder.grant(&offered, &mut OsRng)?;
            ctx.install(session_key);
            session.touch();
            (public_key, wrapped_key)
        };
        tracing::info!("Rekeyed session with {}", peer);

        self.send_with(
            peer,
            &Message::KeyGrant {
                public_key,
                wrapped_key,
            },
            None,
        )
        .await
    }

    async fn send_error(&self, peer: PeerId, err: &ProtocolError) -> Result<()> {
        self.send(peer, &error_message(err)).await
    }

    /// Send, sealing if the peer has crypto state.
    async fn send(&self, peer: PeerId, message: &Message) -> Result<()> {
        let key = match self.registry.get(&peer) {
            Some(handle) => handle.lock().await.sealing_key(),
            None => None,
        };
        self.send_with(peer, message, key.as_deref()).await
    }

    async fn send_with(&self, peer: PeerId, message: &Message, key: Option<&SessionKey>) -> Result<()> {
        let frame = wire::encode_bounded(message, key, self.config.max_datagram_size)?;
        self.transport.send_to(&frame, peer).await?;
        tracing::debug!("Sent {} to {}", message, peer);
        Ok(())
    }
}

fn error_message(err: &ProtocolError) -> Message {
    Message::Error {
        reason: err.wire_message(),
    }
}

/// Handshake message the session is waiting to have acknowledged.
fn pending_message(session: &Session) -> Option<Message> {
    match session.state() {
        SessionState::OpenReceived => Some(Message::OpenAck {
            resource: session.resource()?.to_string(),
            seq: session.handshake_ack_seq()?,
        }),
        SessionState::CloseWait1 => Some(Message::Close {
            seq: session.own_close_seq()?,
        }),
        _ => None,
    }
}

fn message_seq(message: &Message) -> u64 {
    match message {
        Message::OpenAck { seq, .. } | Message::Close { seq } => *seq,
        _ => 0,
    }
}

/// Send loop's view of its session.
struct SessionChannel<'a, T> {
    shared: &'a Shared<T>,
    handle: &'a SessionHandle,
    acks: mpsc::Receiver<u64>,
    stop: watch::Receiver<bool>,
    sealed: bool,
}

#[async_trait]
impl<T: Transport + 'static> UnitChannel for SessionChannel<'_, T> {
    async fn send_data(&mut self, seq: u64, payload: &[u8]) -> Result<()> {
        let key = {
            let mut session = self.handle.lock().await;
            session.advance_send_seq(seq.saturating_add(1));
            session.sealing_key()
        };
        let message = Message::Data {
            seq,
            payload: payload.to_vec(),
        };
        self.shared
            .send_with(self.handle.peer(), &message, key.as_deref())
            .await
    }

    async fn next_ack(&mut self, timeout: Duration) -> Result<AckEvent> {
        if *self.stop.borrow() {
            return Ok(AckEvent::Cancelled);
        }
        tokio::select! {
            ack = self.acks.recv() => match ack {
                Some(seq) => {
                    self.handle.lock().await.touch();
                    Ok(AckEvent::Ack(seq))
                }
                None => Ok(AckEvent::Cancelled),
            },
            _ = self.stop.changed() => Ok(AckEvent::Cancelled),
            () = tokio::time::sleep(timeout) => Ok(AckEvent::TimedOut),
        }
    }

    fn check_unit(&self, seq: u64, payload: &[u8]) -> Result<()> {
        let plain = Message::Data {
            seq,
            payload: payload.to_vec(),
        }
        .encode()
        .len();
        let size = wire::framed_len(plain, self.sealed);
        let limit = self.shared.config.max_datagram_size;
        if size > limit {
            return Err(ProtocolError::UnitTooLarge { size, limit });
        }
        Ok(())
    }
}
