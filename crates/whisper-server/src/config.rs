//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (WHISPER_*)
//! - TOML configuration file

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use whisper_core::{JwtVerifier, SessionConfig};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Credential verification.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Session lifecycle behaviour.
    #[serde(default)]
    pub session: SessionSettings,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Credential verification configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared HS256 secret used by the identity service to sign tokens.
    #[serde(default = "default_secret")]
    pub secret: String,

    /// Allowed clock skew past token expiry, in seconds.
    #[serde(default)]
    pub leeway_secs: u64,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret", &"<redacted>")
            .field("leeway_secs", &self.leeway_secs)
            .finish()
    }
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Close the older connection when the same identity connects again.
    #[serde(default = "default_evict_previous")]
    pub evict_previous: bool,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum inbound WebSocket message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("WHISPER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("WHISPER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(7000)
}

fn default_secret() -> String {
    std::env::var("WHISPER_SECRET")
        .or_else(|_| std::env::var("SECRETKEY"))
        .unwrap_or_default()
}

fn default_evict_previous() -> bool {
    std::env::var("WHISPER_EVICT_PREVIOUS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            auth: AuthConfig::default(),
            session: SessionSettings::default(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: default_secret(),
            leeway_secs: 0,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            evict_previous: default_evict_previous(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl AuthConfig {
    /// Build the token verifier for this configuration.
    #[must_use]
    pub fn verifier(&self) -> JwtVerifier {
        JwtVerifier::new(self.secret.as_bytes()).with_leeway(self.leeway_secs)
    }
}

impl SessionSettings {
    /// Session manager settings.
    #[must_use]
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            evict_previous: self.evict_previous,
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// `WHISPER_CONFIG` names an explicit file; otherwise the usual locations
    /// are searched.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or the
    /// result fails validation.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("WHISPER_CONFIG") {
            let expanded = shellexpand::tilde(&path);
            return Self::from_file(expanded.as_ref());
        }

        let config_paths = [
            "whisper.toml",
            "/etc/whisper/whisper.toml",
            "~/.config/whisper/whisper.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Check settings that have no usable default.
    ///
    /// # Errors
    ///
    /// Returns an error if the signing secret is empty or the WebSocket path
    /// would shadow the liveness route.
    pub fn validate(&self) -> Result<()> {
        if self.auth.secret.is_empty() {
            bail!("No signing secret configured (set auth.secret, WHISPER_SECRET or SECRETKEY)");
        }
        if !self.transport.websocket_path.starts_with('/') || self.transport.websocket_path == "/"
        {
            bail!(
                "Invalid websocket_path {:?}: must start with '/' and not be the root",
                self.transport.websocket_path
            );
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }
}
