//! Session registry.
//!
//! Sessions are stored in a `DashMap` keyed by peer identity. Each entry is
//! a [`SessionHandle`] whose session sits behind its own async mutex, so
//! handlers for unrelated peers never serialize on one another and two
//! handlers for the same peer never see a half-updated session.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, MutexGuard, mpsc, watch};

use crate::session::{PeerId, Session};

/// Buffered ACKs per session before new ones are dropped.
const ACK_QUEUE_DEPTH: usize = 32;

/// Registry entry for one peer.
#[derive(Debug)]
pub struct SessionHandle {
    peer: PeerId,
    session: Mutex<Session>,
    ack_tx: mpsc::Sender<u64>,
    ack_rx: Mutex<Option<mpsc::Receiver<u64>>>,
    stop_transfer: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
}

impl SessionHandle {
    fn new(peer: PeerId) -> Self {
        let (ack_tx, ack_rx) = mpsc::channel(ACK_QUEUE_DEPTH);
        Self {
            peer,
            session: Mutex::new(Session::new(peer)),
            ack_tx,
            ack_rx: Mutex::new(Some(ack_rx)),
            stop_transfer: watch::Sender::new(false),
            shutdown: watch::Sender::new(false),
        }
    }

    /// Peer identity.
    #[must_use]
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Exclusive access to the session.
    pub async fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().await
    }

    /// Exclusive access without waiting.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, Session>> {
        self.session.try_lock().ok()
    }

    /// Hand an ACK to the send loop. Dropped if the loop is not keeping up.
    pub fn deliver_ack(&self, seq: u64) {
        if self.ack_tx.try_send(seq).is_err() {
            tracing::debug!("ACK {} for {} dropped: no send loop listening", seq, self.peer);
        }
    }

    /// Take the ACK stream. Only the first caller gets it.
    pub async fn take_ack_receiver(&self) -> Option<mpsc::Receiver<u64>> {
        self.ack_rx.lock().await.take()
    }

    /// Ask a running send loop to stop.
    pub fn stop_transfer(&self) {
        self.stop_transfer.send_replace(true);
    }

    /// Receiver that flips to `true` when the send loop must stop.
    #[must_use]
    pub fn transfer_stopped(&self) -> watch::Receiver<bool> {
        self.stop_transfer.subscribe()
    }

    /// Whether the session was removed from its registry.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Receiver that flips to `true` once the session is removed.
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn shut_down(&self) {
        self.stop_transfer.send_replace(true);
        self.shutdown.send_replace(true);
    }
}

/// Concurrent map from peer identity to session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<PeerId, Arc<SessionHandle>>,
}

impl SessionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing session for `peer`, or a new idle one. The flag is true if
    /// the session was created by this call.
    pub fn get_or_create(&self, peer: PeerId) -> (Arc<SessionHandle>, bool) {
        match self.sessions.entry(peer) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let handle = Arc::new(SessionHandle::new(peer));
                entry.insert(Arc::clone(&handle));
                tracing::debug!("Created session for {}", peer);
                (handle, true)
            }
        }
    }

    /// Session for `peer`, if any.
    #[must_use]
    pub fn get(&self, peer: &PeerId) -> Option<Arc<SessionHandle>> {
        self.sessions.get(peer).map(|entry| Arc::clone(entry.value()))
    }

    /// Check if a session exists for `peer`.
    #[must_use]
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.sessions.contains_key(peer)
    }

    /// Remove the session for `peer`, cancelling its send loop and timers.
    pub fn remove(&self, peer: &PeerId) -> Option<Arc<SessionHandle>> {
        let (_, handle) = self.sessions.remove(peer)?;
        handle.shut_down();
        Some(handle)
    }

    /// Remove `handle` only if it is still the registered session for its
    /// peer. Returns true if it was removed.
    pub fn remove_handle(&self, handle: &Arc<SessionHandle>) -> bool {
        let removed = self
            .sessions
            .remove_if(&handle.peer, |_, current| Arc::ptr_eq(current, handle))
            .is_some();
        if removed {
            handle.shut_down();
        }
        removed
    }

    /// Evict every session idle for at least `max_idle`. Sessions whose lock
    /// is held are in active use and are skipped. Returns the evicted peers.
    pub fn sweep_idle(&self, max_idle: Duration) -> Vec<PeerId> {
        let mut evicted = Vec::new();
        self.sessions.retain(|peer, handle| {
            let Some(session) = handle.try_lock() else {
                return true;
            };
            if !session.is_idle(max_idle) {
                return true;
            }
            tracing::info!(
                "Evicting idle session {} (state {:?}, idle {:?})",
                peer,
                session.state(),
                session.idle_for()
            );
            drop(session);
            handle.shut_down();
            evicted.push(*peer);
            false
        });
        evicted
    }

    /// Run [`SessionRegistry::sweep_idle`] every `interval` until
    /// `shutdown` flips to true.
    pub async fn run_sweeper(
        self: Arc<Self>,
        max_idle: Duration,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = self.sweep_idle(max_idle);
                    if !evicted.is_empty() {
                        tracing::debug!("Idle sweep evicted {} sessions", evicted.len());
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Number of sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Peers with a session.
    #[must_use]
    pub fn peers(&self) -> Vec<PeerId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Remove every session.
    pub fn clear(&self) {
        for peer in self.peers() {
            self.remove(&peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;

    fn peer(port: u16) -> PeerId {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let registry = SessionRegistry::new();
        let (a, created_a) = registry.get_or_create(peer(1));
        let (b, created_b) = registry.get_or_create(peer(1));

        assert!(created_a);
        assert!(!created_b);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert_eq!(a.lock().await.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_get_and_remove() {
        let registry = SessionRegistry::new();
        assert!(registry.get(&peer(1)).is_none());

        let (handle, _) = registry.get_or_create(peer(1));
        let mut stopped = handle.transfer_stopped();
        assert!(registry.contains(&peer(1)));

        registry.remove(&peer(1)).unwrap();
        assert!(registry.is_empty());
        assert!(handle.is_shut_down());
        assert!(*stopped.borrow_and_update());
    }

    #[tokio::test]
    async fn test_remove_handle_ignores_replacement() {
        let registry = SessionRegistry::new();
        let (old, _) = registry.get_or_create(peer(1));
        registry.remove(&peer(1));
        let (new, _) = registry.get_or_create(peer(1));

        assert!(!registry.remove_handle(&old));
        assert!(registry.contains(&peer(1)));
        assert!(registry.remove_handle(&new));
        assert!(!registry.contains(&peer(1)));
    }

    #[tokio::test]
    async fn test_isolated_registries() {
        let a = SessionRegistry::new();
        let b = SessionRegistry::new();
        a.get_or_create(peer(1));
        assert!(b.get(&peer(1)).is_none());
    }

    #[tokio::test]
    async fn test_sweep_idle() {
        let registry = SessionRegistry::new();
        let (stale, _) = registry.get_or_create(peer(1));
        tokio::time::sleep(Duration::from_millis(40)).await;
        let (fresh, _) = registry.get_or_create(peer(2));

        let evicted = registry.sweep_idle(Duration::from_millis(30));

        assert_eq!(evicted, vec![peer(1)]);
        assert!(stale.is_shut_down());
        assert!(!fresh.is_shut_down());
        assert!(registry.contains(&peer(2)));
    }

    #[tokio::test]
    async fn test_sweep_skips_locked_session() {
        let registry = SessionRegistry::new();
        let (handle, _) = registry.get_or_create(peer(1));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let guard = handle.lock().await;
        assert!(registry.sweep_idle(Duration::from_millis(1)).is_empty());
        drop(guard);
        assert_eq!(registry.sweep_idle(Duration::from_millis(1)), vec![peer(1)]);
    }

    #[tokio::test]
    async fn test_touch_prevents_eviction() {
        let registry = SessionRegistry::new();
        let (handle, _) = registry.get_or_create(peer(1));
        tokio::time::sleep(Duration::from_millis(40)).await;
        handle.lock().await.touch();

        assert!(registry.sweep_idle(Duration::from_millis(30)).is_empty());
    }

    #[tokio::test]
    async fn test_ack_routing() {
        let registry = SessionRegistry::new();
        let (handle, _) = registry.get_or_create(peer(1));
        let mut acks = handle.take_ack_receiver().await.unwrap();
        assert!(handle.take_ack_receiver().await.is_none());

        handle.deliver_ack(102);
        handle.deliver_ack(103);
        assert_eq!(acks.recv().await, Some(102));
        assert_eq!(acks.recv().await, Some(103));
    }

    #[tokio::test]
    async fn test_sweeper_task_stops_on_shutdown() {
        let registry = Arc::new(SessionRegistry::new());
        registry.get_or_create(peer(1));
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(Arc::clone(&registry).run_sweeper(
            Duration::from_millis(10),
            Duration::from_millis(5),
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(registry.is_empty());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
