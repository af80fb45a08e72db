//! Standalone listener configuration.
//!
//! Process settings come from the environment; the listener itself is
//! described by a JSON file that is re-read while the process runs.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::ConfigError;
use crate::filter_chain::{FactoryConfig, FilterChainDescriptor};
use crate::listener::{
    ListenerConfig, ListenerFilterFactory, DEFAULT_LISTENER_FILTERS_TIMEOUT,
    DEFAULT_PER_CONNECTION_BUFFER_LIMIT_BYTES,
};
use crate::tls_inspector::{TlsInspectorFactory, DEFAULT_MAX_CLIENT_HELLO_BYTES, TLS_INSPECTOR};

/// Default period between listener file reloads.
pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_millis(2000);

const MIN_RELOAD_INTERVAL_MS: u64 = 100;

/// Process configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// JSON listener description.
    pub config_file: PathBuf,

    /// How often the listener file is checked for changes.
    pub reload_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let config_file = lookup("PORTCULLIS_CONFIG_FILE")
            .map(PathBuf::from)
            .context("Missing listener file. Set PORTCULLIS_CONFIG_FILE.")?;

        let reload_interval_ms: u64 = lookup("PORTCULLIS_RELOAD_INTERVAL_MS")
            .map(|v| v.parse())
            .transpose()
            .context("PORTCULLIS_RELOAD_INTERVAL_MS must be an integer (milliseconds).")?
            .unwrap_or(DEFAULT_RELOAD_INTERVAL.as_millis() as u64);
        let reload_interval = Duration::from_millis(reload_interval_ms.max(MIN_RELOAD_INTERVAL_MS));

        let log_level = lookup("PORTCULLIS_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            config_file,
            reload_interval,
            log_level,
        })
    }
}

fn default_listener_filters_timeout_ms() -> u64 {
    DEFAULT_LISTENER_FILTERS_TIMEOUT.as_millis() as u64
}

fn default_buffer_limit() -> u32 {
    DEFAULT_PER_CONNECTION_BUFFER_LIMIT_BYTES
}

/// The listener file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ListenerFile {
    pub name: String,
    pub address: SocketAddr,
    #[serde(default)]
    pub listener_filters: Vec<FactoryConfig>,
    /// Zero disables the listener filter timeout.
    #[serde(default = "default_listener_filters_timeout_ms")]
    pub listener_filters_timeout_ms: u64,
    #[serde(default)]
    pub continue_on_listener_filters_timeout: bool,
    #[serde(default = "default_buffer_limit")]
    pub per_connection_buffer_limit_bytes: u32,
    #[serde(default)]
    pub filter_chains: Vec<FilterChainDescriptor>,
}

impl ListenerFile {
    /// Read and parse a listener file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read listener file {}", path.display()))?;
        Self::parse(&contents)
            .with_context(|| format!("Failed to parse listener file {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(serde_json::from_str(contents)?)
    }

    /// Digest of a file's raw contents, used to skip reloads of unchanged files.
    pub fn digest(contents: &[u8]) -> String {
        hex::encode(Sha256::digest(contents))
    }

    /// Listener settings described by the file.
    pub fn listener_config(&self) -> Result<ListenerConfig, ConfigError> {
        let mut config = ListenerConfig::new(&self.name, self.address.into());
        config.listener_filters_timeout = Duration::from_millis(self.listener_filters_timeout_ms);
        config.continue_on_listener_filters_timeout = self.continue_on_listener_filters_timeout;
        config.per_connection_buffer_limit_bytes = self.per_connection_buffer_limit_bytes;
        for filter in &self.listener_filters {
            config = config.with_listener_filter(listener_filter_factory(filter)?);
        }
        Ok(config)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TlsInspectorConfig {
    max_client_hello_bytes: Option<usize>,
}

fn listener_filter_factory(
    filter: &FactoryConfig,
) -> Result<Arc<dyn ListenerFilterFactory>, ConfigError> {
    match filter.name.as_str() {
        TLS_INSPECTOR => {
            let config: TlsInspectorConfig = if filter.config.is_null() {
                TlsInspectorConfig::default()
            } else {
                serde_json::from_value(filter.config.clone()).map_err(|_| {
                    ConfigError::UnknownFactory {
                        kind: "listener filter config",
                        name: filter.name.clone(),
                    }
                })?
            };
            Ok(Arc::new(TlsInspectorFactory::new(
                config
                    .max_client_hello_bytes
                    .unwrap_or(DEFAULT_MAX_CLIENT_HELLO_BYTES),
            )))
        }
        name => Err(ConfigError::UnknownFactory {
            kind: "listener filter",
            name: name.to_string(),
        }),
    }
}
