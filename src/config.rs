use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const CONFIG_FILE_NAME: &str = "config.json";
const APP_DIR_NAME: &str = "podsync";

/// User settings, read from JSON. Missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Number of `Fxx` bucket directories files are spread across.
    pub num_buckets: u32,
    /// Skip files whose title, artist, album and size match a track already
    /// on the device.
    pub skip_duplicates: bool,
    pub log_to_file: bool,
    /// Overrides the platform log directory.
    pub log_dir: Option<PathBuf>,
    /// Bitrate recorded for files whose bitrate could not be read.
    pub default_bitrate_kbps: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            num_buckets: crate::allocator::DEFAULT_BUCKETS,
            skip_duplicates: true,
            log_to_file: true,
            log_dir: None,
            default_bitrate_kbps: crate::track_builder::DEFAULT_BITRATE_KBPS,
        }
    }
}

impl SyncConfig {
    /// `<config dir>/podsync/config.json`, when the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Invalid configuration")?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.num_buckets == 0 || self.num_buckets > 100 {
            anyhow::bail!("num_buckets must be between 1 and 100, got {}", self.num_buckets);
        }
        Ok(())
    }

    /// Loads `explicit` if given (it must exist), else the default location if
    /// present, else the built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => {
                    debug!("No config file, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_json(&json)
            .with_context(|| format!("Failed to load config file {}", path.display()))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }
}
