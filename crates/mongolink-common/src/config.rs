//! Client configuration
//!
//! `ClientConfig` is the already-parsed connection descriptor the driver core
//! consumes. Connection-string parsing lives outside this crate; a config can
//! be built in code or loaded from a TOML/JSON file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Default port for servers listed without one
pub const DEFAULT_PORT: u16 = 27017;

/// Smallest heartbeat period the monitor accepts
pub const MIN_HEARTBEAT_INTERVAL_MS: u64 = 500;

/// Largest application name the handshake may carry
pub const MAX_APP_NAME_BYTES: usize = 128;

/// Main configuration structure for a client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Seed list, `host` or `host:port`
    pub seeds: Vec<String>,
    /// Credentials used to authenticate every application connection
    pub credentials: Option<Credentials>,
    /// TLS configuration
    pub tls: TlsConfig,
    /// Period between topology probes
    pub heartbeat_interval_ms: u64,
    /// TCP connect timeout
    pub connect_timeout_ms: u64,
    /// How long selection may wait for a suitable server (0 = fail fast)
    pub server_selection_timeout_ms: u64,
    /// Application name sent in the handshake metadata
    pub app_name: Option<String>,
    /// Expected replica set name
    pub replica_set: Option<String>,
    /// Talk to the single seed only, ignoring discovered peers
    pub direct_connection: bool,
    /// Upper bound on a single wire message
    pub max_message_size_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            seeds: vec![format!("localhost:{DEFAULT_PORT}")],
            credentials: None,
            tls: TlsConfig::default(),
            heartbeat_interval_ms: 10_000,
            connect_timeout_ms: 10_000,
            server_selection_timeout_ms: 0,
            app_name: None,
            replica_set: None,
            direct_connection: false,
            max_message_size_bytes: 48 * 1024 * 1024, // 48MB
        }
    }
}

impl ClientConfig {
    /// Create a configuration for the given seed list with all other fields defaulted
    pub fn with_seeds<I, S>(seeds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            seeds: seeds.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Load configuration from a TOML or JSON file
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: ClientConfig = if path.as_ref().extension().map_or(false, |ext| ext == "toml") {
            toml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse TOML config: {}", e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse JSON config: {}", e)))?
        };

        config.validate()?;
        debug!(
            path = %path.as_ref().display(),
            seeds = config.seeds.len(),
            replica_set = ?config.replica_set,
            "loaded client config"
        );
        Ok(config)
    }

    /// Reject configurations the core cannot act on
    pub fn validate(&self) -> Result<()> {
        if self.seeds.is_empty() {
            return Err(Error::Config("seed list is empty".to_string()));
        }
        if self.seeds.iter().any(|s| s.trim().is_empty()) {
            return Err(Error::Config("seed list contains an empty address".to_string()));
        }
        if self.direct_connection && self.seeds.len() != 1 {
            return Err(Error::Config(
                "direct connection requires exactly one seed".to_string(),
            ));
        }
        if let Some(name) = &self.app_name {
            if name.len() > MAX_APP_NAME_BYTES {
                return Err(Error::Config(format!(
                    "app name exceeds {MAX_APP_NAME_BYTES} bytes"
                )));
            }
        }
        if let Some(credentials) = &self.credentials {
            if credentials.username.is_empty() {
                return Err(Error::Config("username must not be empty".to_string()));
            }
        }
        if self.max_message_size_bytes < 16 {
            return Err(Error::Config("max message size is below header size".to_string()));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(MIN_HEARTBEAT_INTERVAL_MS))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `None` means selection fails immediately when no server matches
    pub fn server_selection_timeout(&self) -> Option<Duration> {
        (self.server_selection_timeout_ms > 0)
            .then(|| Duration::from_millis(self.server_selection_timeout_ms))
    }
}

/// Username/password credentials
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Database the user is defined in
    #[serde(default = "default_auth_source")]
    pub source: String,
    /// Mechanism to use; negotiated from the handshake when absent
    #[serde(default)]
    pub mechanism: Option<AuthMechanism>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            source: default_auth_source(),
            mechanism: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_mechanism(mut self, mechanism: AuthMechanism) -> Self {
        self.mechanism = Some(mechanism);
        self
    }
}

// Keep passwords out of debug logs
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("source", &self.source)
            .field("mechanism", &self.mechanism)
            .finish()
    }
}

fn default_auth_source() -> String {
    "admin".to_string()
}

/// Supported SASL mechanisms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthMechanism {
    #[serde(rename = "SCRAM-SHA-1")]
    ScramSha1,
    #[serde(rename = "SCRAM-SHA-256")]
    ScramSha256,
}

impl AuthMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMechanism::ScramSha1 => "SCRAM-SHA-1",
            AuthMechanism::ScramSha256 => "SCRAM-SHA-256",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "SCRAM-SHA-1" => Some(AuthMechanism::ScramSha1),
            "SCRAM-SHA-256" => Some(AuthMechanism::ScramSha256),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Enable TLS on every connection
    pub enabled: bool,
    /// Additional CA bundle (PEM) trusted next to the webpki roots
    pub ca_file: Option<String>,
    /// Override the name used for certificate verification
    pub server_name: Option<String>,
}
