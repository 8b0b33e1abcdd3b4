//! Connection registry for Whisper.
//!
//! The registry maps each identity to the one session currently serving it,
//! and separately tracks every live connection by session id. A connection
//! superseded by a newer session for the same identity stays live (and keeps
//! receiving presence notices) until it closes, even though it is no longer
//! routable. It is the only shared mutable state in the relay, and it exposes
//! nothing but atomic per-identity operations.

use crate::identity::{Identity, SessionId};
use crate::message::Delivery;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use whisper_protocol::ServerEvent;

/// The connection side of a session: where deliveries for it are queued.
///
/// Handles are cheap to clone. Two handles are equal when they refer to the
/// same session, regardless of identity.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    identity: Identity,
    display_name: Option<Arc<str>>,
    created_at: u64,
    sender: mpsc::UnboundedSender<Delivery>,
}

impl SessionHandle {
    /// Create a handle that delivers into `sender`.
    #[must_use]
    pub fn new(
        id: SessionId,
        identity: Identity,
        display_name: Option<String>,
        sender: mpsc::UnboundedSender<Delivery>,
    ) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            id,
            identity,
            display_name: display_name.map(Arc::from),
            created_at,
            sender,
        }
    }

    /// The session this handle belongs to.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The identity the session is bound to.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Display name from the credential, if any.
    #[must_use]
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// Creation time in milliseconds since the Unix epoch.
    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Queue a shared event. Returns `false` if the connection is gone.
    pub fn deliver(&self, event: Arc<ServerEvent>) -> bool {
        self.sender.send(Delivery::Event(event)).is_ok()
    }

    /// Queue an event. Returns `false` if the connection is gone.
    pub fn send(&self, event: ServerEvent) -> bool {
        self.deliver(Arc::new(event))
    }

    /// Ask the connection to close. Returns `false` if it is already gone.
    pub fn evict(&self) -> bool {
        self.sender.send(Delivery::Evict).is_ok()
    }

    /// Whether the receiving side has shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl PartialEq for SessionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SessionHandle {}

/// Identity to session map, plus the set of live connections.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: DashMap<Identity, SessionHandle>,
    live: DashMap<SessionId, SessionHandle>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` under its identity, replacing any existing entry.
    ///
    /// Returns the superseded handle. Its connection is left untouched; closing
    /// it is the caller's decision.
    pub fn register(&self, handle: SessionHandle) -> Option<SessionHandle> {
        let identity = handle.identity().clone();
        let session = handle.id();
        self.live.insert(session, handle.clone());
        let previous = self.sessions.insert(identity.clone(), handle);

        match &previous {
            Some(old) => debug!(
                identity = %identity,
                session = %session,
                superseded = %old.id(),
                "Session replaced existing registration"
            ),
            None => debug!(identity = %identity, session = %session, "Session registered"),
        }

        previous
    }

    /// Remove `session` from the live set, and the entry for `identity` only if
    /// it still belongs to `session`.
    ///
    /// The ownership check and the removal happen under the same shard lock.
    /// Returns `false` when a newer session owns the entry, or there is none.
    pub fn unregister(&self, identity: &Identity, session: SessionId) -> bool {
        self.live.remove(&session);

        let removed = self
            .sessions
            .remove_if(identity, |_, current| current.id() == session)
            .is_some();

        if removed {
            debug!(identity = %identity, session = %session, "Session unregistered");
        } else {
            trace!(identity = %identity, session = %session, "Stale unregister ignored");
        }

        removed
    }

    /// The session currently registered for `identity`.
    #[must_use]
    pub fn lookup(&self, identity: &Identity) -> Option<SessionHandle> {
        self.sessions.get(identity).map(|entry| entry.value().clone())
    }

    /// Clone every registered handle.
    ///
    /// Callers fan out over the snapshot so no shard lock is held while sending.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SessionHandle> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Clone every live connection, including superseded ones still open.
    #[must_use]
    pub fn connections(&self) -> Vec<SessionHandle> {
        self.live.iter().map(|entry| entry.value().clone()).collect()
    }

    /// All registered identities.
    #[must_use]
    pub fn identities(&self) -> Vec<Identity> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_sessions: self.sessions.len(),
            live_connections: self.live.len(),
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of registered sessions.
    pub active_sessions: usize,
    /// Number of open connections, superseded ones included.
    pub live_connections: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SessionIdSequence;

    fn handle(
        seq: &SessionIdSequence,
        identity: &str,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            SessionHandle::new(seq.next_id(), Identity::new(identity), None, tx),
            rx,
        )
    }

    #[test]
    fn test_register_lookup() {
        let seq = SessionIdSequence::new();
        let registry = Registry::new();
        let (alice, _rx) = handle(&seq, "alice");

        assert!(registry.register(alice.clone()).is_none());
        assert_eq!(registry.lookup(&Identity::new("alice")), Some(alice));
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(&Identity::new("bob")).is_none());
    }

    #[test]
    fn test_register_replaces_previous() {
        let seq = SessionIdSequence::new();
        let registry = Registry::new();
        let (first, _rx1) = handle(&seq, "alice");
        let (second, _rx2) = handle(&seq, "alice");

        registry.register(first.clone());
        let superseded = registry.register(second.clone());

        assert_eq!(superseded, Some(first.clone()));
        assert_eq!(registry.lookup(&Identity::new("alice")), Some(second));
        assert_eq!(registry.len(), 1);
        // The registry never touches the superseded connection.
        assert!(!first.is_closed());
    }

    #[test]
    fn test_stale_unregister_keeps_newer_entry() {
        let seq = SessionIdSequence::new();
        let registry = Registry::new();
        let (first, _rx1) = handle(&seq, "alice");
        let (second, _rx2) = handle(&seq, "alice");
        let alice = Identity::new("alice");

        registry.register(first.clone());
        registry.register(second.clone());

        assert!(!registry.unregister(&alice, first.id()));
        assert_eq!(registry.lookup(&alice), Some(second.clone()));

        assert!(registry.unregister(&alice, second.id()));
        assert!(registry.lookup(&alice).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregister_unknown_identity() {
        let registry = Registry::new();
        let seq = SessionIdSequence::new();
        assert!(!registry.unregister(&Identity::new("ghost"), seq.next_id()));
    }

    #[test]
    fn test_handle_delivery() {
        let seq = SessionIdSequence::new();
        let (alice, mut rx) = handle(&seq, "alice");

        assert!(alice.send(ServerEvent::hello()));
        assert!(alice.evict());
        assert!(matches!(rx.try_recv(), Ok(Delivery::Event(_))));
        assert!(matches!(rx.try_recv(), Ok(Delivery::Evict)));

        drop(rx);
        assert!(alice.is_closed());
        assert!(!alice.send(ServerEvent::hello()));
    }

    #[test]
    fn test_concurrent_register_unregister() {
        let seq = SessionIdSequence::new();
        let registry = Registry::new();
        let alice = Identity::new("alice");

        let handles: Vec<_> = (0..64).map(|_| handle(&seq, "alice")).collect();

        std::thread::scope(|scope| {
            for (h, _) in &handles {
                let registry = &registry;
                let alice = &alice;
                scope.spawn(move || {
                    registry.register(h.clone());
                    registry.unregister(alice, h.id());
                });
            }
        });

        // The last registration is always followed by its own unregister.
        assert!(registry.is_empty());
        assert!(registry.connections().is_empty());
    }

    #[test]
    fn test_snapshot_and_stats() {
        let seq = SessionIdSequence::new();
        let registry = Registry::new();
        let (alice, _rx1) = handle(&seq, "alice");
        let (bob, _rx2) = handle(&seq, "bob");

        registry.register(alice);
        registry.register(bob);

        assert_eq!(registry.snapshot().len(), 2);
        let mut ids = registry.identities();
        ids.sort();
        assert_eq!(ids, vec![Identity::new("alice"), Identity::new("bob")]);
        assert_eq!(
            registry.stats(),
            RegistryStats {
                active_sessions: 2,
                live_connections: 2
            }
        );
    }

    #[test]
    fn test_superseded_connection_stays_live_until_unregistered() {
        let seq = SessionIdSequence::new();
        let registry = Registry::new();
        let (first, _rx1) = handle(&seq, "alice");
        let (second, _rx2) = handle(&seq, "alice");
        let alice = Identity::new("alice");

        registry.register(first.clone());
        registry.register(second.clone());

        assert_eq!(registry.len(), 1);
        let mut live: Vec<_> = registry.connections().iter().map(SessionHandle::id).collect();
        live.sort();
        assert_eq!(live, vec![first.id(), second.id()]);

        // Stale unregister keeps the identity entry but drops the connection.
        assert!(!registry.unregister(&alice, first.id()));
        assert_eq!(registry.connections(), vec![second.clone()]);
        assert_eq!(registry.lookup(&alice), Some(second.clone()));

        assert!(registry.unregister(&alice, second.id()));
        assert!(registry.connections().is_empty());
        assert_eq!(registry.stats().live_connections, 0);
    }
}
