//! ClawRelay configuration management

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main ClawRelay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// HTTP/WebSocket server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// CLI process configuration
    #[serde(default)]
    pub cli: CliConfig,

    /// Session bridge configuration
    #[serde(default)]
    pub bridge: BridgeConfig,
}

impl RelayConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RelayConfig = toml::from_str(&content).map_err(|e| {
            crate::Error::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the bridge cannot operate with
    pub fn validate(&self) -> crate::Result<()> {
        if self.bridge.outbound_buffer_limit == 0 {
            return Err(crate::Error::Config(
                "bridge.outbound_buffer_limit must be greater than zero".to_string(),
            ));
        }
        if self.cli.dial_back_timeout_secs == 0 {
            return Err(crate::Error::Config(
                "cli.dial_back_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on (also embedded in the CLI dial-back URL)
    pub port: u16,

    /// Allowed CORS origins (empty = any)
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3456,
            cors_origins: Vec::new(),
        }
    }
}

/// CLI process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Explicit CLI binary path; resolved from PATH when unset
    pub binary: Option<PathBuf>,

    /// Arguments placed before the generated ones (wrapper scripts)
    pub leading_args: Vec<String>,

    /// Extra arguments appended after the generated ones
    pub extra_args: Vec<String>,

    /// Seconds to wait for the CLI to dial back before failing the session
    pub dial_back_timeout_secs: u64,

    /// Kill CLI processes when the server shuts down
    pub kill_on_shutdown: bool,

    /// Extra environment variables for the CLI process
    pub env: HashMap<String, String>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            binary: None,
            leading_args: Vec::new(),
            extra_args: Vec::new(),
            dial_back_timeout_secs: 30,
            kill_on_shutdown: false,
            env: HashMap::new(),
        }
    }
}

impl CliConfig {
    pub fn dial_back_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_back_timeout_secs)
    }
}

/// Session bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Maximum CLI messages buffered while no browser is attached.
    /// The oldest message is dropped when the limit is reached.
    pub outbound_buffer_limit: usize,

    /// Milliseconds to wait for the process exit status after the CLI
    /// socket closes (or for the socket close after the process exits)
    pub exit_grace_ms: u64,

    /// Remove exited sessions with no attached browser after this many
    /// seconds. Disabled when unset.
    pub exited_session_ttl_secs: Option<u64>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            outbound_buffer_limit: 1000,
            exit_grace_ms: 3000,
            exited_session_ttl_secs: None,
        }
    }
}

impl BridgeConfig {
    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }

    pub fn exited_session_ttl(&self) -> Option<Duration> {
        self.exited_session_ttl_secs.map(Duration::from_secs)
    }
}
