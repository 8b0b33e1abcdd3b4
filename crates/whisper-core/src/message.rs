//! Internal message types for Whisper.
//!
//! These types are used internally for routing and delivery.

use crate::identity::Identity;
use serde_json::Value;
use std::sync::Arc;
use whisper_protocol::ServerEvent;

/// An item on a session's outbound queue.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// An event to write to the connection (shared for zero-copy broadcast).
    Event(Arc<ServerEvent>),
    /// The session was superseded and should close its connection.
    Evict,
}

impl Delivery {
    /// Wrap an event.
    #[must_use]
    pub fn event(event: ServerEvent) -> Self {
        Delivery::Event(Arc::new(event))
    }

    /// The carried event, if any.
    #[must_use]
    pub fn as_event(&self) -> Option<&ServerEvent> {
        match self {
            Delivery::Event(event) => Some(event.as_ref()),
            Delivery::Evict => None,
        }
    }
}

/// A directed message for one relay attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Who should receive the payload.
    pub recipient: Identity,
    /// Opaque application payload.
    pub payload: Value,
}

impl Envelope {
    /// Create a new envelope.
    #[must_use]
    pub fn new(recipient: impl Into<Identity>, payload: Value) -> Self {
        Self {
            recipient: recipient.into(),
            payload,
        }
    }

    /// Turn the envelope into the event the recipient sees.
    #[must_use]
    pub fn into_event(self, sender: &Identity) -> ServerEvent {
        ServerEvent::private_message(sender.as_str(), self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_names_sender() {
        let envelope = Envelope::new("bob", json!("hi"));
        assert_eq!(envelope.recipient.as_str(), "bob");

        let event = envelope.into_event(&Identity::new("alice"));
        assert_eq!(event, ServerEvent::private_message("alice", json!("hi")));
    }

    #[test]
    fn test_delivery_event_access() {
        let delivery = Delivery::event(ServerEvent::hello());
        assert_eq!(delivery.as_event(), Some(&ServerEvent::hello()));
        assert!(Delivery::Evict.as_event().is_none());
    }
}
