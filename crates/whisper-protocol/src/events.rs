//! Event types for the Whisper protocol.
//!
//! Every event travels as an adjacently tagged object:
//! `{"event": "<name>", "data": <payload>}`. Payload field names are camelCase
//! so browser clients can use them without translation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Greeting sent to a session once it becomes active.
pub const HELLO_GREETING: &str = "Welcome to the app!";

/// Text of the error sent back when a recipient is not connected.
pub const RECIPIENT_OFFLINE: &str = "Recipient not found or offline";

/// Text of the error sent back for an undecodable inbound event.
pub const MALFORMED_EVENT: &str = "Malformed event";

/// Text of the error sent to a connection replaced by a newer session.
pub const SESSION_SUPERSEDED: &str = "Session superseded by a newer connection";

/// Event name identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Hello,
    PrivateMessage,
    ErrorMessage,
    UserDisconnected,
    Ping,
    Pong,
}

impl EventType {
    /// The name used on the wire.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Hello => "hello",
            EventType::PrivateMessage => "privateMessage",
            EventType::ErrorMessage => "errorMessage",
            EventType::UserDisconnected => "userDisconnected",
            EventType::Ping => "ping",
            EventType::Pong => "pong",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Ask the relay to forward `message` to `recipient_id`.
    #[serde(rename = "privateMessage", rename_all = "camelCase")]
    PrivateMessage {
        /// Identity of the intended recipient.
        recipient_id: String,
        /// Opaque application payload.
        message: Value,
    },

    /// Application-level keepalive. The `data` field may be omitted.
    #[serde(rename = "ping")]
    Ping(Option<Heartbeat>),
}

/// Payload of a client ping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Optional client timestamp, echoed back in the pong.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl ClientEvent {
    /// Get the event type.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            ClientEvent::PrivateMessage { .. } => EventType::PrivateMessage,
            ClientEvent::Ping(_) => EventType::Ping,
        }
    }

    /// Create a new private message request.
    #[must_use]
    pub fn private_message(recipient_id: impl Into<String>, message: impl Into<Value>) -> Self {
        ClientEvent::PrivateMessage {
            recipient_id: recipient_id.into(),
            message: message.into(),
        }
    }

    /// Create a new ping.
    #[must_use]
    pub fn ping(timestamp: Option<u64>) -> Self {
        ClientEvent::Ping(Some(Heartbeat { timestamp }))
    }

    /// Timestamp carried by a ping, if any.
    #[must_use]
    pub fn ping_timestamp(&self) -> Option<u64> {
        match self {
            ClientEvent::Ping(heartbeat) => heartbeat.and_then(|h| h.timestamp),
            ClientEvent::PrivateMessage { .. } => None,
        }
    }
}

/// Events sent by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Greeting on successful activation.
    #[serde(rename = "hello")]
    Hello(String),

    /// A message forwarded from another session.
    #[serde(rename = "privateMessage", rename_all = "camelCase")]
    PrivateMessage {
        /// Stable identity of the sender.
        sender_id: String,
        /// Payload exactly as the sender supplied it.
        message: Value,
    },

    /// Human-readable, non-fatal error for this connection.
    #[serde(rename = "errorMessage")]
    ErrorMessage(String),

    /// An identity went offline.
    #[serde(rename = "userDisconnected")]
    UserDisconnected(String),

    /// Reply to a client ping.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from the ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ServerEvent {
    /// Get the event type.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            ServerEvent::Hello(_) => EventType::Hello,
            ServerEvent::PrivateMessage { .. } => EventType::PrivateMessage,
            ServerEvent::ErrorMessage(_) => EventType::ErrorMessage,
            ServerEvent::UserDisconnected(_) => EventType::UserDisconnected,
            ServerEvent::Pong { .. } => EventType::Pong,
        }
    }

    /// Create the standard greeting.
    #[must_use]
    pub fn hello() -> Self {
        ServerEvent::Hello(HELLO_GREETING.to_string())
    }

    /// Create a forwarded private message.
    #[must_use]
    pub fn private_message(sender_id: impl Into<String>, message: Value) -> Self {
        ServerEvent::PrivateMessage {
            sender_id: sender_id.into(),
            message,
        }
    }

    /// Create an error message.
    #[must_use]
    pub fn error(text: impl Into<String>) -> Self {
        ServerEvent::ErrorMessage(text.into())
    }

    /// Create a departure notification.
    #[must_use]
    pub fn user_disconnected(identity: impl Into<String>) -> Self {
        ServerEvent::UserDisconnected(identity.into())
    }

    /// Create a pong.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        ServerEvent::Pong { timestamp }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_private_message_shape() {
        let event: ClientEvent = serde_json::from_value(json!({
            "event": "privateMessage",
            "data": { "recipientId": "bob", "message": "hi" }
        }))
        .unwrap();

        assert_eq!(event, ClientEvent::private_message("bob", "hi"));
        assert_eq!(event.event_type(), EventType::PrivateMessage);
    }

    #[test]
    fn test_client_ping_without_timestamp() {
        let event: ClientEvent = serde_json::from_value(json!({
            "event": "ping",
            "data": {}
        }))
        .unwrap();

        assert_eq!(event, ClientEvent::ping(None));
    }

    #[test]
    fn test_client_ping_data_optional() {
        let bare: ClientEvent = serde_json::from_value(json!({ "event": "ping" })).unwrap();
        assert_eq!(bare.event_type(), EventType::Ping);
        assert_eq!(bare.ping_timestamp(), None);

        let null: ClientEvent =
            serde_json::from_value(json!({ "event": "ping", "data": null })).unwrap();
        assert_eq!(null, bare);

        let stamped: ClientEvent =
            serde_json::from_value(json!({ "event": "ping", "data": { "timestamp": 42 } }))
                .unwrap();
        assert_eq!(stamped.ping_timestamp(), Some(42));
    }

    #[test]
    fn test_private_message_still_requires_data() {
        let result = serde_json::from_value::<ClientEvent>(json!({ "event": "privateMessage" }));
        assert!(result.is_err());
    }

    #[test]
    fn test_server_event_shapes() {
        assert_eq!(
            serde_json::to_value(ServerEvent::hello()).unwrap(),
            json!({ "event": "hello", "data": "Welcome to the app!" })
        );
        assert_eq!(
            serde_json::to_value(ServerEvent::private_message("alice", json!({"text": "hi"})))
                .unwrap(),
            json!({
                "event": "privateMessage",
                "data": { "senderId": "alice", "message": { "text": "hi" } }
            })
        );
        assert_eq!(
            serde_json::to_value(ServerEvent::user_disconnected("bob")).unwrap(),
            json!({ "event": "userDisconnected", "data": "bob" })
        );
        assert_eq!(
            serde_json::to_value(ServerEvent::error(RECIPIENT_OFFLINE)).unwrap(),
            json!({ "event": "errorMessage", "data": "Recipient not found or offline" })
        );
    }

    #[test]
    fn test_unknown_event_rejected() {
        let result = serde_json::from_value::<ClientEvent>(json!({
            "event": "subscribe",
            "data": { "channel": "lobby" }
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_event_type_names() {
        assert_eq!(EventType::UserDisconnected.to_string(), "userDisconnected");
        assert_eq!(ServerEvent::pong(Some(7)).event_type(), EventType::Pong);
    }
}
