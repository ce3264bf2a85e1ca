// Configuration management for Rewind

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::encoding::ContainerFormat;
use crate::recording::{ContinuousOptions, EventOptions, SnapshotOptions};

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory where saved clips are written
    pub storage_path: PathBuf,

    /// Container used for saved clips
    pub container: ContainerFormat,

    /// Sizing of the in-memory frame ring
    pub buffer: BufferConfig,

    /// "Save the last few seconds"
    pub snapshot: SnapshotConfig,

    /// "Save everything until stopped"
    pub continuous: ContinuousConfig,

    /// "Save around events"
    pub event: EventConfig,
}

/// Frame ring sizing. The ring holds roughly `span_secs` of video at the
/// given bitrate and frame rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub bitrate_bps: u32,
    pub frame_rate: f64,
    pub span_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub settle_delay_secs: f64,
    pub span_secs: f64,
    /// Added to the settle delay to get the history required before the clip
    pub min_margin_secs: f64,
    pub min_length_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuousConfig {
    pub chunk_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub margin_secs: f64,
    pub chunk_secs: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_path: get_default_storage_path(),
            container: ContainerFormat::default(),
            buffer: BufferConfig::default(),
            snapshot: SnapshotConfig::default(),
            continuous: ContinuousConfig::default(),
            event: EventConfig::default(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            bitrate_bps: 6 * 1024 * 1024,
            frame_rate: 30.0,
            span_secs: 7.0,
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            settle_delay_secs: 0.5,
            span_secs: 3.0,
            min_margin_secs: 1.0,
            min_length_secs: 2.0,
        }
    }
}

impl Default for ContinuousConfig {
    fn default() -> Self {
        Self { chunk_secs: 1.0 }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            margin_secs: 2.0,
            chunk_secs: 1.0,
        }
    }
}

/// Seconds from the config file as a duration; negative and non-finite values clamp to zero
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::ZERO)
}

impl Config {
    /// Load config from `path`, failing on a missing or malformed file
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load config from `path` or return the default
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match Self::load_from(path) {
                Ok(config) => return config,
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", path.display(), e);
                }
            }
        }

        Self::default()
    }

    /// Save config to `path`
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;

        Ok(())
    }

    pub fn snapshot_options(&self) -> SnapshotOptions {
        SnapshotOptions {
            settle_delay: secs(self.snapshot.settle_delay_secs),
            span: secs(self.snapshot.span_secs),
            min_margin: secs(self.snapshot.min_margin_secs),
            min_length: secs(self.snapshot.min_length_secs),
        }
    }

    pub fn continuous_options(&self) -> ContinuousOptions {
        ContinuousOptions {
            chunk: secs(self.continuous.chunk_secs),
        }
    }

    pub fn event_options(&self) -> EventOptions {
        EventOptions {
            margin: secs(self.event.margin_secs),
            chunk: secs(self.event.chunk_secs),
        }
    }
}

/// Get the default storage path for saved clips
fn get_default_storage_path() -> PathBuf {
    dirs::video_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Videos")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Rewind")
}

/// Default config file location
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rewind")
        .join("config.toml")
}
