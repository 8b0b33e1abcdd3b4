//! # whisper-core
//!
//! Core types and routing for the Whisper presence and private-message relay.
//!
//! This crate provides the building blocks behind every connection:
//!
//! - **Auth** - Bearer token verification against a shared secret
//! - **Registry** - At most one live session per identity
//! - **Relay** - Identity-routed private messages and departure notices
//! - **Session** - Per-connection lifecycle state machine
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│   Session   │────▶│    Relay    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                        │      │                │
//!                        ▼      ▼                ▼
//!              ┌──────────┐  ┌─────────────────────────┐
//!              │ Verifier │  │        Registry         │
//!              └──────────┘  └─────────────────────────┘
//! ```

pub mod auth;
pub mod identity;
pub mod message;
pub mod registry;
pub mod relay;
pub mod session;

pub use auth::{AuthError, JwtVerifier, TokenRejection, TokenVerifier};
pub use identity::{Claims, Identity, SessionId};
pub use message::{Delivery, Envelope};
pub use registry::{Registry, RegistryStats, SessionHandle};
pub use relay::{Relay, RelayOutcome};
pub use session::{Session, SessionConfig, SessionError, SessionManager, SessionState};
