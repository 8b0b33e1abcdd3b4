//! Identity-routed message relay.
//!
//! The relay resolves recipients through the [`Registry`] and pushes events
//! onto their delivery queues. Delivery is best effort: there is no retry and
//! nothing is kept for recipients that are not connected.

use crate::identity::{Identity, SessionId};
use crate::message::Envelope;
use crate::registry::Registry;
use std::sync::Arc;
use tracing::{debug, trace};
use whisper_protocol::ServerEvent;

/// Result of one relay attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Queued on the recipient's connection.
    Delivered,
    /// No live session for the recipient.
    RecipientOffline,
}

impl RelayOutcome {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayOutcome::Delivered => "delivered",
            RelayOutcome::RecipientOffline => "recipient_offline",
        }
    }
}

/// Forwards private messages and presence notifications.
#[derive(Debug, Clone)]
pub struct Relay {
    registry: Arc<Registry>,
}

impl Relay {
    /// Create a relay over `registry`.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// The registry this relay routes through.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Forward `payload` from `sender` to whoever is registered as `recipient`.
    ///
    /// The recipient sees the sender's stable identity, never a connection id.
    pub fn send(
        &self,
        sender: &Identity,
        recipient: &Identity,
        payload: serde_json::Value,
    ) -> RelayOutcome {
        self.relay(sender, Envelope::new(recipient.clone(), payload))
    }

    /// Forward a prepared envelope.
    pub fn relay(&self, sender: &Identity, envelope: Envelope) -> RelayOutcome {
        let Some(target) = self.registry.lookup(&envelope.recipient) else {
            debug!(sender = %sender, recipient = %envelope.recipient, "Recipient offline");
            return RelayOutcome::RecipientOffline;
        };

        // The entry can outlive its connection task briefly; a closed queue
        // counts as offline.
        if target.send(envelope.into_event(sender)) {
            trace!(sender = %sender, recipient = %target.identity(), session = %target.id(), "Relayed");
            RelayOutcome::Delivered
        } else {
            debug!(sender = %sender, recipient = %target.identity(), "Recipient queue closed");
            RelayOutcome::RecipientOffline
        }
    }

    /// Tell every other live connection that `identity` went offline.
    ///
    /// Superseded connections that are still open are notified too; only the
    /// departing session itself is skipped. Returns the number notified.
    pub fn announce_departure(&self, identity: &Identity, departing: SessionId) -> usize {
        let event = Arc::new(ServerEvent::user_disconnected(identity.as_str()));

        let notified = self
            .registry
            .connections()
            .into_iter()
            .filter(|handle| handle.id() != departing)
            .filter(|handle| handle.deliver(Arc::clone(&event)))
            .count();

        debug!(identity = %identity, notified, "Announced departure");
        notified
    }
}
