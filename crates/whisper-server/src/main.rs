//! # Whisper Server
//!
//! Realtime presence and private-message relay.
//!
//! ## Usage
//!
//! ```bash
//! # Run with the signing secret from the environment
//! WHISPER_SECRET=changeme whisper
//!
//! # Run with a config file
//! WHISPER_CONFIG=/path/to/whisper.toml whisper
//!
//! # Override the listening address
//! WHISPER_PORT=8080 WHISPER_HOST=0.0.0.0 whisper
//! ```

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use whisper_server::{config, handlers, metrics};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "whisper=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Whisper server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
