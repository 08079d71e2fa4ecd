//! Configuration management for the cycle server daemon.
//!
//! This module handles loading, validation, and conversion of the daemon
//! configuration from TOML files and command-line arguments.

use crate::cli::{CliArgs, Mode};
use anyhow::Context;
use cycle_server::config::{DEFAULT_AGENT_PORT, DEFAULT_RELAY_PORT};
use cycle_server::{RelayConfig, ServerConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

fn default_max_connections() -> usize {
    1000
}

fn default_multi_threaded() -> bool {
    true
}

/// Default cycle length in milliseconds
fn default_cycle_interval() -> u64 {
    20
}

fn default_sync_poll_interval() -> u64 {
    1
}

fn default_recv_chunk_size() -> usize {
    64 * 1024
}

fn default_relay_listen() -> String {
    format!("127.0.0.1:{DEFAULT_RELAY_PORT}")
}

fn default_relay_upstream() -> String {
    format!("127.0.0.1:{DEFAULT_AGENT_PORT}")
}

fn default_relay_period() -> u64 {
    20
}

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Cycle server settings
    pub server: ServerSettings,
    /// Agent relay settings
    #[serde(default)]
    pub relay: RelaySettings,
    /// Logging configuration settings
    pub logging: LoggingSettings,
}

/// Cycle server settings.
///
/// Controls network binding, connection limits and the coordinator modes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Network address agents connect to (e.g., "127.0.0.1:3100")
    pub bind_address: String,
    /// Maximum number of concurrent agent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Wait for every agent's sync token before each cycle
    #[serde(default)]
    pub sync_mode: bool,
    /// Produce sense payloads on per-agent worker threads
    #[serde(default = "default_multi_threaded")]
    pub multi_threaded: bool,
    /// Minimum cycle length in milliseconds (0 runs cycles back to back)
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_ms: u64,
    /// Sync wait poll interval in milliseconds
    #[serde(default = "default_sync_poll_interval")]
    pub sync_poll_interval_ms: u64,
    /// Bytes read from a socket at a time
    #[serde(default = "default_recv_chunk_size")]
    pub recv_chunk_size: usize,
}

/// Agent relay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Address agents connect to
    #[serde(default = "default_relay_listen")]
    pub listen_address: String,
    /// Cycle server the relay forwards to
    #[serde(default = "default_relay_upstream")]
    pub upstream_address: String,
    /// Forwarding period in milliseconds
    #[serde(default = "default_relay_period")]
    pub period_ms: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            listen_address: default_relay_listen(),
            upstream_address: default_relay_upstream(),
            period_ms: default_relay_period(),
        }
    }
}

/// Logging system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                bind_address: format!("127.0.0.1:{DEFAULT_AGENT_PORT}"),
                max_connections: default_max_connections(),
                sync_mode: false,
                multi_threaded: default_multi_threaded(),
                cycle_interval_ms: default_cycle_interval(),
                sync_poll_interval_ms: default_sync_poll_interval(),
                recv_chunk_size: default_recv_chunk_size(),
            },
            relay: RelaySettings::default(),
            logging: LoggingSettings {
                level: "info".to_string(),
                json_format: false,
            },
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, creates a default configuration file at the
    /// specified path and returns the default configuration.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// The loaded or default configuration, or an error if loading/creation failed.
    pub async fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Applies command-line overrides.
    pub fn apply_cli(&mut self, args: &CliArgs) {
        if let Some(bind) = &args.bind_address {
            self.server.bind_address = bind.clone();
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if args.json_logs {
            self.logging.json_format = true;
        }
        if args.sync {
            self.server.sync_mode = true;
        }
        if args.single_threaded {
            self.server.multi_threaded = false;
        }
        if let Mode::Relay {
            listen,
            upstream,
            period_ms,
        } = &args.mode
        {
            if let Some(listen) = listen {
                self.relay.listen_address = listen.clone();
            }
            if let Some(upstream) = upstream {
                self.relay.upstream_address = upstream.clone();
            }
            if let Some(period) = period_ms {
                self.relay.period_ms = *period;
            }
        }
    }

    /// Converts the file settings into the cycle server configuration.
    pub fn to_server_config(&self) -> anyhow::Result<ServerConfig> {
        Ok(ServerConfig {
            bind_address: self
                .server
                .bind_address
                .parse()
                .with_context(|| format!("Invalid bind address: {}", self.server.bind_address))?,
            max_connections: self.server.max_connections,
            sync_mode: self.server.sync_mode,
            multi_threaded: self.server.multi_threaded,
            cycle_interval: Duration::from_millis(self.server.cycle_interval_ms),
            sync_poll_interval: Duration::from_millis(self.server.sync_poll_interval_ms),
            recv_chunk_size: self.server.recv_chunk_size,
        })
    }

    /// Converts the relay settings into the relay configuration.
    pub fn to_relay_config(&self) -> anyhow::Result<RelayConfig> {
        Ok(RelayConfig {
            listen_address: self.relay.listen_address.parse().with_context(|| {
                format!("Invalid relay listen address: {}", self.relay.listen_address)
            })?,
            upstream_address: self.relay.upstream_address.parse().with_context(|| {
                format!("Invalid relay upstream address: {}", self.relay.upstream_address)
            })?,
            period: Duration::from_millis(self.relay.period_ms),
        })
    }

    /// Validates the configuration for consistency and correctness.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the configuration is valid, or an error string describing the issue.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            return Err(format!(
                "Invalid bind address: {}",
                &self.server.bind_address
            ));
        }
        if self.server.max_connections == 0 {
            return Err("max_connections must be greater than 0".to_string());
        }
        if self.server.sync_poll_interval_ms == 0 {
            return Err("sync_poll_interval_ms must be greater than 0".to_string());
        }
        if self.server.recv_chunk_size == 0 {
            return Err("recv_chunk_size must be greater than 0".to_string());
        }

        for (name, address) in [
            ("relay listen", &self.relay.listen_address),
            ("relay upstream", &self.relay.upstream_address),
        ] {
            if address.parse::<SocketAddr>().is_err() {
                return Err(format!("Invalid {name} address: {address}"));
            }
        }
        if self.relay.period_ms == 0 {
            return Err("Relay period_ms must be greater than 0".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }
}
