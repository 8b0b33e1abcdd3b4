//! Session lifecycle.
//!
//! Each connection is driven through a small state machine:
//!
//! ```text
//! Connecting ──authenticate──▶ Authenticated ──activate──▶ Active ──close──▶ Closed
//!      │                                                                   ▲
//!      └──────────────────────── auth failure ─────────────────────────────┘
//! ```
//!
//! Activation registers the session; closing deregisters it (only if it still
//! owns the registry entry) and announces the departure to everyone else.
//! A [`Session`] closes itself on drop, so cleanup runs exactly once whatever
//! path the connection task takes out.

use crate::auth::{AuthError, TokenVerifier};
use crate::identity::{Claims, Identity, SessionId, SessionIdSequence};
use crate::message::Delivery;
use crate::registry::{Registry, SessionHandle};
use crate::relay::{Relay, RelayOutcome};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use whisper_protocol::events::RECIPIENT_OFFLINE;
use whisper_protocol::ServerEvent;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Transport handshake in progress.
    Connecting,
    /// Identity verified, not yet registered.
    Authenticated,
    /// Registered and serving events.
    Active,
    /// Terminal.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Authenticated => "authenticated",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Credential verification failed.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Operation requires an active session.
    #[error("Session is not active (state: {0})")]
    NotActive(SessionState),

    /// The requested transition is not part of the lifecycle.
    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: SessionState,
        /// Requested state.
        to: SessionState,
    },
}

/// Session configuration.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Close the previous connection when a newer session registers the same
    /// identity. When `false` the old connection stays open but no longer
    /// receives messages addressed to the identity.
    pub evict_previous: bool,
}

/// Creates sessions and holds what they share.
pub struct SessionManager {
    registry: Arc<Registry>,
    relay: Relay,
    verifier: Arc<dyn TokenVerifier>,
    ids: SessionIdSequence,
    config: SessionConfig,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.registry.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager with a fresh registry.
    #[must_use]
    pub fn new(verifier: Arc<dyn TokenVerifier>, config: SessionConfig) -> Self {
        let registry = Arc::new(Registry::new());
        info!(evict_previous = config.evict_previous, "Creating session manager");

        Self {
            relay: Relay::new(Arc::clone(&registry)),
            registry,
            verifier,
            ids: SessionIdSequence::new(),
            config,
        }
    }

    /// The shared registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The shared relay.
    #[must_use]
    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Start a session for a new transport connection.
    #[must_use]
    pub fn begin(&self) -> Session {
        let id = self.ids.next_id();
        debug!(session = %id, "Session connecting");

        Session {
            id,
            state: SessionState::Connecting,
            claims: None,
            handle: None,
            relay: self.relay.clone(),
            verifier: Arc::clone(&self.verifier),
            evict_previous: self.config.evict_previous,
        }
    }
}

/// One connection's view of the lifecycle.
pub struct Session {
    id: SessionId,
    state: SessionState,
    claims: Option<Claims>,
    handle: Option<SessionHandle>,
    relay: Relay,
    verifier: Arc<dyn TokenVerifier>,
    evict_previous: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("identity", &self.identity())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Session id.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Verified identity, once authenticated.
    #[must_use]
    pub fn identity(&self) -> Option<&Identity> {
        self.claims.as_ref().map(|c| &c.identity)
    }

    /// Verified claims, once authenticated.
    #[must_use]
    pub fn claims(&self) -> Option<&Claims> {
        self.claims.as_ref()
    }

    /// Verify the connection's credential.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Auth`] and moves to `Closed` if verification
    /// fails, or [`SessionError::InvalidTransition`] outside `Connecting`.
    pub fn authenticate(&mut self, credential: Option<&str>) -> Result<&Claims, SessionError> {
        self.expect_state(SessionState::Connecting, SessionState::Authenticated)?;

        match self.verifier.verify(credential) {
            Ok(claims) => {
                debug!(session = %self.id, identity = %claims.identity, "Session authenticated");
                self.state = SessionState::Authenticated;
                Ok(&*self.claims.insert(claims))
            }
            Err(e) => {
                warn!(session = %self.id, reason = e.reason(), "Authentication failed");
                self.state = SessionState::Closed;
                Err(e.into())
            }
        }
    }

    /// Register the session and start serving it.
    ///
    /// The greeting is queued before registration, so it is always the first
    /// delivery the connection sees.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidTransition`] outside `Authenticated`.
    pub fn activate(&mut self) -> Result<mpsc::UnboundedReceiver<Delivery>, SessionError> {
        self.expect_state(SessionState::Authenticated, SessionState::Active)?;
        let Some(claims) = self.claims.as_ref() else {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: SessionState::Active,
            });
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SessionHandle::new(
            self.id,
            claims.identity.clone(),
            claims.display_name.clone(),
            tx,
        );
        handle.send(ServerEvent::hello());

        if let Some(previous) = self.relay.registry().register(handle.clone()) {
            if self.evict_previous && previous.evict() {
                debug!(session = %self.id, evicted = %previous.id(), "Evicting superseded session");
            }
        }

        info!(
            session = %self.id,
            identity = %handle.identity(),
            name = handle.display_name().unwrap_or(""),
            "Session active"
        );

        self.handle = Some(handle);
        self.state = SessionState::Active;
        Ok(rx)
    }

    /// Send a private message to `recipient`.
    ///
    /// An offline recipient is reported back to this session only, as an
    /// `errorMessage` event.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotActive`] outside `Active`.
    pub fn send_private(
        &self,
        recipient: &Identity,
        message: serde_json::Value,
    ) -> Result<RelayOutcome, SessionError> {
        let handle = match (&self.handle, self.state) {
            (Some(handle), SessionState::Active) => handle,
            _ => return Err(SessionError::NotActive(self.state)),
        };

        let outcome = self.relay.send(handle.identity(), recipient, message);
        if outcome == RelayOutcome::RecipientOffline {
            handle.send(ServerEvent::error(RECIPIENT_OFFLINE));
        }
        Ok(outcome)
    }

    /// Queue an event on this session's own connection.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotActive`] outside `Active`.
    pub fn reply(&self, event: ServerEvent) -> Result<(), SessionError> {
        match (&self.handle, self.state) {
            (Some(handle), SessionState::Active) => {
                handle.send(event);
                Ok(())
            }
            _ => Err(SessionError::NotActive(self.state)),
        }
    }

    /// Close the session.
    ///
    /// The first close of an active session deregisters it and, if it still
    /// owned its registry entry, announces the departure. Returns `true` only
    /// for that first close; later calls are no-ops.
    pub fn close(&mut self) -> bool {
        let previous = std::mem::replace(&mut self.state, SessionState::Closed);
        let Some(handle) = self.handle.take() else {
            return false;
        };
        if previous != SessionState::Active {
            return false;
        }

        if self.relay.registry().unregister(handle.identity(), handle.id()) {
            self.relay.announce_departure(handle.identity(), handle.id());
        } else {
            debug!(
                session = %self.id,
                identity = %handle.identity(),
                "Superseded session closed; identity still present"
            );
        }

        info!(session = %self.id, identity = %handle.identity(), "Session closed");
        true
    }

    fn expect_state(&self, from: SessionState, to: SessionState) -> Result<(), SessionError> {
        if self.state == from {
            Ok(())
        } else {
            Err(SessionError::InvalidTransition {
                from: self.state,
                to,
            })
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
