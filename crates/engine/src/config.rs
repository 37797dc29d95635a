//! Container configuration via `bento.toml`
//!
//! A `ContainerConfig` can be built in code with the `with_*` methods or
//! read from a TOML file. Either way it is validated before a container is
//! opened with it.

use bento_core::Error;
use bento_durability::FormatVersion;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Config file name conventionally placed next to a container.
pub const CONFIG_FILE_NAME: &str = "bento.toml";

/// Smallest accepted update-stream buffer size in bytes.
pub const MIN_IO_BUFFER_SIZE: usize = 64;

fn default_io_buffer_size() -> usize {
    4096
}

fn default_max_io_buffers() -> usize {
    4
}

fn default_track_free_space() -> bool {
    true
}

/// Container configuration
///
/// # Example
///
/// ```toml
/// format = "current"
/// io_buffer_size = 4096
/// max_io_buffers = 4
/// track_free_space = true
/// # max_touch_entries = 100000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Update-log format revision.
    #[serde(default)]
    pub format: FormatVersion,
    /// Flush threshold of update-stream buffers, in bytes.
    #[serde(default = "default_io_buffer_size")]
    pub io_buffer_size: usize,
    /// Maximum number of update-stream buffers held at once.
    #[serde(default = "default_max_io_buffers")]
    pub max_io_buffers: usize,
    /// Cap on live touch entries; `None` means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_touch_entries: Option<usize>,
    /// Recycle byte ranges released in the updating container.
    #[serde(default = "default_track_free_space")]
    pub track_free_space: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        ContainerConfig {
            format: FormatVersion::default(),
            io_buffer_size: default_io_buffer_size(),
            max_io_buffers: default_max_io_buffers(),
            max_touch_entries: None,
            track_free_space: default_track_free_space(),
        }
    }
}

impl ContainerConfig {
    /// Create config for testing
    ///
    /// Uses the smallest buffer so that multi-flush streams are exercised.
    pub fn for_testing() -> Self {
        ContainerConfig {
            io_buffer_size: MIN_IO_BUFFER_SIZE,
            ..Default::default()
        }
    }

    /// Set the update-log format
    pub fn with_format(mut self, format: FormatVersion) -> Self {
        self.format = format;
        self
    }

    /// Set the update-stream buffer size
    pub fn with_io_buffer_size(mut self, size: usize) -> Self {
        self.io_buffer_size = size;
        self
    }

    /// Set the number of buffers that may be held at once
    pub fn with_max_io_buffers(mut self, count: usize) -> Self {
        self.max_io_buffers = count;
        self
    }

    /// Cap the number of live touch entries
    pub fn with_max_touch_entries(mut self, limit: usize) -> Self {
        self.max_touch_entries = Some(limit);
        self
    }

    /// Enable or disable free-space recycling
    pub fn with_free_space_tracking(mut self, track: bool) -> Self {
        self.track_free_space = track;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.io_buffer_size < MIN_IO_BUFFER_SIZE {
            return Err(ConfigError::BufferTooSmall(self.io_buffer_size));
        }
        if self.max_io_buffers == 0 {
            return Err(ConfigError::NoBuffers);
        }
        if self.max_touch_entries == Some(0) {
            return Err(ConfigError::NoTouchEntries);
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Bento container configuration
#
# Update-log format: "current" (default) or "legacy"
#   "legacy" writes 2-byte generation numbers
format = "current"

# Update-stream buffer size in bytes (minimum 64)
io_buffer_size = 4096

# Update-stream buffers that may be held at once
max_io_buffers = 4

# Recycle byte ranges freed by edits in the updating container
track_free_space = true

# Cap on live touch entries per session (default: unbounded)
# max_touch_entries = 100000
"#
    }

    /// Read, parse and validate config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: ContainerConfig = toml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<(), Error> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<(), Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Buffer below the minimum size
    #[error("io_buffer_size {0} is below the minimum of 64 bytes")]
    BufferTooSmall(usize),

    /// No buffers may be held
    #[error("max_io_buffers must be at least 1")]
    NoBuffers,

    /// No touch entries may be created
    #[error("max_touch_entries must be at least 1 when set")]
    NoTouchEntries,
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}
