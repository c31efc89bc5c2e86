//! Configuration management for the livetap service.
//!
//! Settings are layered, later sources overriding earlier ones:
//! 1. Default configuration (embedded in binary)
//! 2. User-specified configuration file (`--config`)
//! 3. Environment variables prefixed with `LIVETAP`, nested keys separated
//!    by `__` (e.g. `LIVETAP_SESSION__QUEUE_CAPACITY=128`)
//! 4. Command-line arguments

use clap::Parser;
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::PathBuf;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Command-line arguments.
#[derive(Parser, Debug, Default)]
#[command(author, version, about)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Upstream feed address (host:port)
    #[arg(long, env = "LIVETAP_UPSTREAM_ADDRESS")]
    pub upstream: Option<String>,

    /// TCP line-protocol listen address
    #[arg(long, env = "LIVETAP_TCP_ADDRESS")]
    pub tcp_address: Option<String>,

    /// WebSocket listen address
    #[arg(long, env = "LIVETAP_WS_ADDRESS")]
    pub ws_address: Option<String>,

    /// Per-client delivery queue capacity
    #[arg(long, env = "LIVETAP_QUEUE_CAPACITY")]
    pub queue_capacity: Option<usize>,

    /// Record field used to index the recent-record cache
    #[arg(long, env = "LIVETAP_CACHE_KEY")]
    pub cache_key: Option<String>,

    /// Number of recent records cached per stream (0 disables)
    #[arg(long, env = "LIVETAP_CACHE_CAPACITY")]
    pub cache_capacity: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Settings {
    pub upstream: UpstreamConfig,
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub cache: CacheConfig,
}

/// Where stream actors connect.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpstreamConfig {
    pub address: String,
}

/// Client-facing listeners.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerConfig {
    pub tcp_address: String,
    pub ws_address: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionConfig {
    /// Records buffered per client before new ones are dropped
    pub queue_capacity: usize,
}

/// Recent-record cache kept by every stream actor.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CacheConfig {
    /// Dotted path of the string field records are indexed by
    pub key: String,
    /// Maximum records kept; 0 disables the cache
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key: "unique_request_id".to_string(),
            capacity: 64,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig {
                address: "127.0.0.1:3535".to_string(),
            },
            server: ServerConfig {
                tcp_address: "127.0.0.1:3536".to_string(),
                ws_address: "127.0.0.1:8080".to_string(),
            },
            session: SessionConfig { queue_capacity: 64 },
            cache: CacheConfig::default(),
        }
    }
}

impl Settings {
    /// Loads configuration from all available sources.
    pub fn new(cli: &CliArgs) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml));

        if let Some(ref path) = cli.config {
            builder = builder.add_source(File::from(path.clone()));
        }

        builder = builder.add_source(
            Environment::with_prefix("LIVETAP")
                .prefix_separator("_")
                .separator("__"),
        );

        if let Some(ref upstream) = cli.upstream {
            builder = builder.set_override("upstream.address", upstream.as_str())?;
        }
        if let Some(ref address) = cli.tcp_address {
            builder = builder.set_override("server.tcp_address", address.as_str())?;
        }
        if let Some(ref address) = cli.ws_address {
            builder = builder.set_override("server.ws_address", address.as_str())?;
        }
        if let Some(capacity) = cli.queue_capacity {
            builder = builder.set_override("session.queue_capacity", capacity as i64)?;
        }
        if let Some(ref key) = cli.cache_key {
            builder = builder.set_override("cache.key", key.as_str())?;
        }
        if let Some(capacity) = cli.cache_capacity {
            builder = builder.set_override("cache.capacity", capacity as i64)?;
        }

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.queue_capacity == 0 {
            return Err(ConfigError::Message(
                "session.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.cache.key.is_empty() {
            return Err(ConfigError::Message("cache.key must not be empty".to_string()));
        }
        Ok(())
    }
}
