//! Server configuration module
//!
//! Handles loading and parsing of server configuration from files and environment variables.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Server name used in logs
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Maximum number of connected clients
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// Marker registry and host loop settings
    #[serde(default)]
    pub markers: MarkerSettings,

    /// Known icon types
    #[serde(default = "default_icon_types")]
    pub icon_types: Vec<IconTypeConfig>,

    /// Enable debug logging
    #[serde(default)]
    pub debug: bool,

    /// Emit logs as JSON
    #[serde(default)]
    pub log_json: bool,
}

/// Marker registry and host loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerSettings {
    /// Refresh interval reported while no marker exists, in seconds
    #[serde(default = "default_interval_secs")]
    pub default_interval_secs: f64,

    /// Slack when deciding whether a marker is due, in seconds
    #[serde(default = "default_refresh_tolerance")]
    pub refresh_tolerance_secs: f64,

    /// Shortest sleep between registry ticks
    #[serde(default = "default_min_host_interval")]
    pub min_host_interval_ms: u64,

    /// Longest sleep between registry ticks
    #[serde(default = "default_max_host_interval")]
    pub max_host_interval_ms: u64,

    /// Edge length of a relevance grid cell in world units
    #[serde(default = "default_grid_cell_size")]
    pub grid_cell_size: f32,

    /// Outbound packet queue length per client
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

/// One icon type entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IconTypeConfig {
    pub name: String,

    /// Default lifetime in seconds; omit for unlimited
    #[serde(default)]
    pub default_ttl_secs: Option<f64>,

    /// Random extra lifetime in seconds
    #[serde(default)]
    pub ttl_jitter_secs: f64,
}

// Default value functions
fn default_server_name() -> String {
    "WorldIcon".to_string()
}

fn default_max_clients() -> usize {
    2000
}

fn default_interval_secs() -> f64 {
    1.0
}

fn default_refresh_tolerance() -> f64 {
    0.01
}

fn default_min_host_interval() -> u64 {
    50
}

fn default_max_host_interval() -> u64 {
    1000
}

fn default_grid_cell_size() -> f32 {
    64.0
}

fn default_outbound_buffer() -> usize {
    256
}

fn default_icon_types() -> Vec<IconTypeConfig> {
    vec![
        IconTypeConfig {
            name: "objective".to_string(),
            default_ttl_secs: None,
            ttl_jitter_secs: 0.0,
        },
        IconTypeConfig {
            name: "ping".to_string(),
            default_ttl_secs: Some(8.0),
            ttl_jitter_secs: 0.0,
        },
        IconTypeConfig {
            name: "loot".to_string(),
            default_ttl_secs: Some(60.0),
            ttl_jitter_secs: 15.0,
        },
    ]
}

impl Default for MarkerSettings {
    fn default() -> Self {
        Self {
            default_interval_secs: default_interval_secs(),
            refresh_tolerance_secs: default_refresh_tolerance(),
            min_host_interval_ms: default_min_host_interval(),
            max_host_interval_ms: default_max_host_interval(),
            grid_cell_size: default_grid_cell_size(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config/server.toml"),
            server_name: default_server_name(),
            max_clients: default_max_clients(),
            markers: MarkerSettings::default(),
            icon_types: default_icon_types(),
            debug: false,
            log_json: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from file and environment variables
    pub async fn load() -> Result<Self> {
        // Determine config path from environment or use default
        let config_path = env::var("WORLDICON_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/server.toml"));

        // Try to load from file
        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| {
                    format!("Failed to read config file: {}", config_path.display())
                })?;

            Self::from_toml(&content).with_context(|| {
                format!("Failed to parse config file: {}", config_path.display())
            })?
        } else {
            tracing::warn!(
                "Config file not found at {}, using defaults",
                config_path.display()
            );
            Self::default()
        };

        config.config_path = config_path;

        // Override with environment variables
        config.apply_env_overrides();

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Parse a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("WORLDICON_SERVER_NAME") {
            self.server_name = val;
        }
        if let Ok(val) = env::var("WORLDICON_DEBUG") {
            self.debug = parse_flag(&val);
        }
        if let Ok(val) = env::var("WORLDICON_LOG_JSON") {
            self.log_json = parse_flag(&val);
        }
        if let Ok(val) = env::var("WORLDICON_GRID_CELL_SIZE") {
            if let Ok(size) = val.parse() {
                self.markers.grid_cell_size = size;
            }
        }
        if let Ok(val) = env::var("WORLDICON_DEFAULT_INTERVAL") {
            if let Ok(secs) = val.parse() {
                self.markers.default_interval_secs = secs;
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let markers = &self.markers;

        if self.max_clients == 0 {
            anyhow::bail!("Max clients must be at least 1");
        }

        if !(markers.default_interval_secs > 0.0) {
            anyhow::bail!("Default marker interval must be positive");
        }

        if !(markers.refresh_tolerance_secs >= 0.0)
            || markers.refresh_tolerance_secs >= markers.default_interval_secs
        {
            anyhow::bail!("Refresh tolerance must be non-negative and below the default interval");
        }

        if markers.min_host_interval_ms == 0
            || markers.min_host_interval_ms > markers.max_host_interval_ms
        {
            anyhow::bail!("Host interval bounds must satisfy 0 < min <= max");
        }

        if !(markers.grid_cell_size > 0.0) || !markers.grid_cell_size.is_finite() {
            anyhow::bail!("Grid cell size must be a positive number");
        }

        if markers.outbound_buffer == 0 {
            anyhow::bail!("Outbound buffer must hold at least one packet");
        }

        let mut seen = std::collections::HashSet::new();
        for entry in &self.icon_types {
            if entry.name.is_empty() {
                anyhow::bail!("Icon type names must not be empty");
            }
            if !seen.insert(entry.name.as_str()) {
                anyhow::bail!("Duplicate icon type: {}", entry.name);
            }
            if entry.default_ttl_secs.is_some_and(|ttl| ttl < 0.0) || entry.ttl_jitter_secs < 0.0 {
                anyhow::bail!("Icon type {} has a negative lifetime", entry.name);
            }
        }

        Ok(())
    }
}

fn parse_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}
