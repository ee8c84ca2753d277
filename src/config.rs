//! Configuration for the Strata display server
//!
//! Loads configuration from TOML file at `~/.config/strata/config.toml`
//! (or the path in `STRATA_CONFIG`).
//! Auto-generates default config file on first run if missing.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use strata_shm::{ShmConfig, DEFAULT_SEGMENT_NAME, SHM_BACKEND_NAME};
use strata_wire::protocol::CLIENT_ID_RANGE;
use tracing::{debug, info, warn};

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "STRATA_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub compositor: CompositorConfig,
}

impl Config {
    /// Load configuration from file, or use defaults if file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from(&config_path)
    }

    /// Load from an explicit path, writing the defaults there if it is missing
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            // Auto-generate default config file
            if let Err(e) = Self::save_default(config_path) {
                warn!("Failed to create default config file: {}", e);
            }
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file {:?}", config_path))?;

        let config: Config = toml::from_str(&content)
            .context("Failed to parse config file")?;
        config.validate()?;

        info!("Configuration loaded from {:?}", config_path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Get the path to the config file
    pub fn config_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }

        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("strata");

        Ok(config_dir.join("config.toml"))
    }

    /// Save default configuration to file
    fn save_default(path: &Path) -> Result<()> {
        // Create config directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        let default_config = Self::default();
        let toml_string = toml::to_string_pretty(&default_config)
            .context("Failed to serialize default config")?;

        fs::write(path, toml_string)
            .context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.server.socket_name.is_empty() {
            anyhow::bail!("server.socket_name must not be empty");
        }
        if self.server.first_client_id.checked_add(CLIENT_ID_RANGE).is_none() {
            anyhow::bail!("server.first_client_id leaves no room for a client id range");
        }
        if self.backend.slots == 0 {
            anyhow::bail!("backend.slots must be at least 1");
        }
        Ok(())
    }
}

/// Listening socket and id allocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Abstract-namespace socket name
    pub socket_name: String,
    /// Id range base handed to the first client; later clients follow in steps of 256
    pub first_client_id: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_name: strata_wire::SOCKET_NAME.to_string(),
            first_client_id: CLIENT_ID_RANGE,
        }
    }
}

/// Buffer backend selection and sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend name advertised to clients
    pub name: String,
    /// Backend arguments (the shared-memory object name for "shm")
    pub args: String,
    /// Buffer handle slots
    pub slots: u32,
    /// Bytes of buffer memory
    pub data_size: usize,
    /// Keep buffers in process-private memory (clients cannot attach)
    pub anonymous: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        let shm = ShmConfig::default();
        Self {
            name: SHM_BACKEND_NAME.to_string(),
            args: DEFAULT_SEGMENT_NAME.to_string(),
            slots: shm.slots,
            data_size: shm.data_size,
            anonymous: false,
        }
    }
}

impl BackendConfig {
    pub fn shm(&self) -> ShmConfig {
        ShmConfig {
            slots: self.slots,
            data_size: self.data_size,
        }
    }
}

/// Headless compositor canvas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositorConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 768,
        }
    }
}
