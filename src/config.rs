//! Configuration for the evalbridge client.
//!
//! Searches for a config file in order:
//!
//! 1. `EVALBRIDGE_CONFIG` environment variable
//! 2. `<config dir>/evalbridge/config.toml` (XDG on Linux, Library on macOS)
//!
//! Missing files fall back to defaults. Individual values can then be
//! overridden with `EVALBRIDGE_HOST`, `EVALBRIDGE_PORT`,
//! `EVALBRIDGE_SERVER_PATH` and `EVALBRIDGE_SOCKET`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::server::ServerCommand;
use crate::session::{Connector, InboundFraming, TcpConnector};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 7878;

/// Client configuration. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Unix socket to use instead of `host`/`port`.
    pub socket_path: Option<PathBuf>,
    /// Program that runs the evaluation server.
    pub server_path: String,
    pub server_args: Vec<String>,
    /// Start the server when the client starts.
    pub auto_start: bool,
    /// Connect once the server has started.
    pub auto_connect: bool,
    pub framing: InboundFraming,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            socket_path: None,
            server_path: String::new(),
            server_args: Vec::new(),
            auto_start: true,
            auto_connect: true,
            framing: InboundFraming::default(),
        }
    }
}

impl Config {
    /// Load from the default location and apply environment overrides.
    pub fn load() -> Result<Self> {
        let env: HashMap<String, String> = std::env::vars().collect();
        let path = env
            .get("EVALBRIDGE_CONFIG")
            .map(PathBuf::from)
            .or_else(default_config_path);

        let config = match path {
            Some(path) if path.exists() => Self::from_file(&path)?,
            Some(path) => {
                debug!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            None => Self::default(),
        };

        config.with_env_overrides(&env)
    }

    /// Parse a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Apply `EVALBRIDGE_*` overrides from `env`.
    pub fn with_env_overrides(mut self, env: &HashMap<String, String>) -> Result<Self> {
        if let Some(host) = env.get("EVALBRIDGE_HOST") {
            self.host = host.clone();
        }
        if let Some(port) = env.get("EVALBRIDGE_PORT") {
            self.port = port
                .parse()
                .with_context(|| format!("Invalid EVALBRIDGE_PORT value: {}", port))?;
        }
        if let Some(server_path) = env.get("EVALBRIDGE_SERVER_PATH") {
            self.server_path = server_path.clone();
        }
        if let Some(socket) = env.get("EVALBRIDGE_SOCKET") {
            self.socket_path = Some(PathBuf::from(socket));
        }
        Ok(self)
    }

    /// Command used to launch the backend.
    pub fn server_command(&self) -> ServerCommand {
        ServerCommand::new(self.server_path.clone()).with_args(self.server_args.clone())
    }

    /// Connector for the configured endpoint.
    pub fn connector(&self) -> Box<dyn Connector> {
        match self.socket_connector() {
            Some(connector) => connector,
            None => Box::new(TcpConnector::new(self.host.clone(), self.port)),
        }
    }

    #[cfg(unix)]
    fn socket_connector(&self) -> Option<Box<dyn Connector>> {
        let path = self.socket_path.as_ref()?;
        Some(Box::new(crate::session::UnixConnector::new(path.clone())))
    }

    #[cfg(not(unix))]
    fn socket_connector(&self) -> Option<Box<dyn Connector>> {
        None
    }

    /// Human-readable endpoint for status text.
    pub fn endpoint(&self) -> String {
        self.connector().endpoint()
    }
}

/// `<config dir>/evalbridge/config.toml`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("evalbridge").join("config.toml"))
}
