//! # whisper-protocol
//!
//! Wire protocol definitions for the Whisper presence and private-message relay.
//!
//! Events are socket.io-shaped objects, `{"event": name, "data": payload}`,
//! carried either as JSON text frames or as length-prefixed MessagePack binary
//! frames.
//!
//! ## Events
//!
//! - `privateMessage` - Directed message, routed by recipient identity
//! - `hello` - Greeting once a session is active
//! - `errorMessage` - Non-fatal error for the sender
//! - `userDisconnected` - Presence departure broadcast
//! - `ping` / `pong` - Application keepalive
//!
//! ## Example
//!
//! ```rust
//! use whisper_protocol::{codec, ClientEvent};
//!
//! let event = ClientEvent::private_message("bob", "hi");
//!
//! let encoded = codec::encode(&event).unwrap();
//! let decoded: ClientEvent = codec::decode(&encoded).unwrap();
//! assert_eq!(event, decoded);
//! ```

pub mod codec;
pub mod events;

pub use codec::{decode, encode, Encoded, ProtocolError, WireFormat};
pub use events::{ClientEvent, EventType, Heartbeat, ServerEvent};
