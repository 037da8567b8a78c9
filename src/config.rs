//! Configuration management for sipp-emu.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (SIPP_EMU_SCENARIO_DIR, etc.)
//! 2. Project-local config file (`./sipp-emu.toml`)
//! 3. User config file (`~/.config/sipp-emu/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # sipp-emu.toml
//!
//! # Directory searched for scenario files given by bare name
//! scenario_dir = "/home/user/sipp-scenarios"
//!
//! # Directory searched for frame files given by bare name
//! frame_dir = "/home/user/frames"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::device::memory::SliceGeometry;

/// Global cached configuration.
static CONFIG: OnceLock<Config> = OnceLock::new();

/// sipp-emu configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Directory searched for scenario files.
    /// Paths that do not resolve directly are retried under this directory.
    pub scenario_dir: Option<String>,

    /// Directory searched for frame files.
    pub frame_dir: Option<String>,

    /// Override for the CMX slice size in bytes.
    pub slice_size: Option<u32>,

    /// Override for the first slice available to chunked buffers.
    pub slice_first: Option<u32>,

    /// Override for the last slice available to chunked buffers.
    pub slice_last: Option<u32>,
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `sipp-emu.toml`
    /// 3. User config `~/.config/sipp-emu/config.toml`
    /// 4. Defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load user config first (lowest priority of file configs)
        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }

        // Load project-local config (higher priority)
        if let Some(local_config) = Self::load_local_config() {
            config.merge(local_config);
        }

        // Environment variables override everything
        config.apply_env_overrides();

        config
    }

    /// Get the cached global configuration.
    ///
    /// Loads configuration on first call and caches it.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("Loaded configuration: {:?}", config);
            config
        })
    }

    /// Get the scenario directory, with fallback to default.
    ///
    /// Returns the configured directory, or "scenarios" as fallback.
    pub fn scenario_dir(&self) -> String {
        self.scenario_dir
            .clone()
            .unwrap_or_else(|| "scenarios".to_string())
    }

    /// Get the frame directory, with fallback to default.
    pub fn frame_dir(&self) -> String {
        self.frame_dir
            .clone()
            .unwrap_or_else(|| "frames".to_string())
    }

    /// Get the configured slice geometry override, if any field is set.
    ///
    /// Unset fields keep their hardware defaults.
    pub fn slice_geometry(&self) -> Option<SliceGeometry> {
        if self.slice_size.is_none() && self.slice_first.is_none() && self.slice_last.is_none() {
            return None;
        }
        let defaults = SliceGeometry::default();
        Some(SliceGeometry {
            size: self.slice_size.unwrap_or(defaults.size),
            first: self.slice_first.unwrap_or(defaults.first),
            last: self.slice_last.unwrap_or(defaults.last),
        })
    }

    /// Load user configuration from ~/.config/sipp-emu/config.toml
    fn load_user_config() -> Option<Self> {
        let config_dir = dirs::config_dir()?;
        let config_path = config_dir.join("sipp-emu").join("config.toml");
        Self::load_from_file(&config_path)
    }

    /// Load project-local configuration from ./sipp-emu.toml
    fn load_local_config() -> Option<Self> {
        // Try current directory
        let local_path = Path::new("sipp-emu.toml");
        if let Some(config) = Self::load_from_file(local_path) {
            return Some(config);
        }

        // Try to find project root by looking for Cargo.toml
        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let project_path = Path::new(&manifest_dir).join("sipp-emu.toml");
            if let Some(config) = Self::load_from_file(&project_path) {
                return Some(config);
            }
        }

        None
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Merge another config into this one.
    /// Only overrides fields that are Some in the other config.
    fn merge(&mut self, other: Self) {
        if other.scenario_dir.is_some() {
            self.scenario_dir = other.scenario_dir;
        }
        if other.frame_dir.is_some() {
            self.frame_dir = other.frame_dir;
        }
        if other.slice_size.is_some() {
            self.slice_size = other.slice_size;
        }
        if other.slice_first.is_some() {
            self.slice_first = other.slice_first;
        }
        if other.slice_last.is_some() {
            self.slice_last = other.slice_last;
        }
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("SIPP_EMU_SCENARIO_DIR") {
            log::info!("Using SIPP_EMU_SCENARIO_DIR from environment: {}", path);
            self.scenario_dir = Some(path);
        }
        if let Ok(path) = std::env::var("SIPP_EMU_FRAME_DIR") {
            log::info!("Using SIPP_EMU_FRAME_DIR from environment: {}", path);
            self.frame_dir = Some(path);
        }
    }

    /// Get the path to the user config file (for display/creation).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("sipp-emu").join("config.toml"))
    }

    /// Generate a sample config file content.
    pub fn sample_config() -> String {
        r#"# sipp-emu configuration
# Place this file at ~/.config/sipp-emu/config.toml or ./sipp-emu.toml

# Directory searched for scenario files given by bare name
scenario_dir = "scenarios"

# Directory searched for frame files given by bare name
# frame_dir = "frames"

# CMX slice geometry overrides (defaults match the hardware: 16 slices
# of 128 KiB each)
# slice_size = 131072
# slice_first = 0
# slice_last = 15
"#
        .to_string()
    }
}
