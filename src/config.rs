//! Configuration schema, defaults, and loading.
//!
//! Precedence: defaults < config file < CLI flags
use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::streaming::channel::DATA_CHUNK_SIZE;
use crate::streaming::receiver::ReceiverConfig;
use crate::streaming::sender::SenderConfig;

/// Largest accepted content chunk.
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Default config file location: `<config dir>/filepush/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("filepush").join("config.toml"))
}

/// Sending side settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PushConfig {
    /// Content chunk size in bytes
    pub chunk_size: usize,
    /// Bound on each FILE_ACK wait. Unset waits forever.
    pub ack_timeout_ms: Option<u64>,
    /// Bound on opening the transport. Unset waits forever.
    pub connect_timeout_ms: Option<u64>,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            chunk_size: DATA_CHUNK_SIZE,
            ack_timeout_ms: None,
            connect_timeout_ms: None,
        }
    }
}

impl PushConfig {
    pub fn ack_timeout(&self) -> Option<Duration> {
        self.ack_timeout_ms.map(Duration::from_millis)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn sender_config(&self) -> SenderConfig {
        SenderConfig {
            chunk_size: self.chunk_size,
            ack_timeout: self.ack_timeout(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.chunk_size > 0,
            "Invalid config: push.chunk_size must be > 0"
        );
        ensure!(
            self.chunk_size <= MAX_CHUNK_SIZE,
            "Invalid config: push.chunk_size must be <= {MAX_CHUNK_SIZE}"
        );
        ensure!(
            self.ack_timeout_ms != Some(0),
            "Invalid config: push.ack_timeout_ms must be > 0 when set"
        );
        Ok(())
    }
}

/// Receiving side settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReceiveSettings {
    /// Directory pushed trees are written under
    pub root: Option<PathBuf>,
    /// KEEP_ALIVE interval. Unset never sends one.
    pub keep_alive_ms: Option<u64>,
}

impl ReceiveSettings {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.keep_alive_ms != Some(0),
            "Invalid config: receive.keep_alive_ms must be > 0 when set"
        );
        Ok(())
    }

    /// Resolve into a receiver config; `fallback_root` is used when none is configured.
    pub fn receiver_config(&self, fallback_root: &Path) -> ReceiverConfig {
        ReceiverConfig {
            root: self
                .root
                .clone()
                .unwrap_or_else(|| fallback_root.to_path_buf()),
            keep_alive: self.keep_alive_ms.map(Duration::from_millis),
        }
    }
}

/// Fully resolved configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub push: PushConfig,
    pub receive: ReceiveSettings,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.push.validate()?;
        self.receive.validate()?;
        Ok(())
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Load an explicit file, else the default location if it exists, else defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match config_path() {
            Some(path) if path.is_file() => {
                tracing::debug!("Loading config from {}", path.display());
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }
}
