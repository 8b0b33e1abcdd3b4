//! # Whisper Server
//!
//! HTTP and WebSocket front end for the Whisper relay: liveness and health
//! endpoints, authenticated upgrades and the per-connection event loop.

pub mod config;
pub mod handlers;
pub mod metrics;

pub use config::Config;
pub use handlers::{router, run_server, AppState};
