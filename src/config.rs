use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::track::MixSettings;

/// Carrier tone for the left ear, in Hz
pub const DEFAULT_BASE_FREQUENCY: f32 = 200.0;

/// Returns the path to the config file: `~/.config/soundbath/engine.json`
pub fn config_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("soundbath");
    path.push("engine.json");
    path
}

/// Engine configuration.
///
/// Serialized as JSON to the platform config directory.
/// Fields use `#[serde(default)]` so that adding new settings
/// won't break existing config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Left-ear carrier; the right ear gets `base_frequency + beat`
    pub base_frequency: f32,

    /// Directory that root-relative track urls (`/audio/...`) resolve against
    pub asset_root: PathBuf,

    /// Output device name, `None` for the host default
    pub output_device: Option<String>,
    /// Input device name, `None` for the host default
    pub input_device: Option<String>,

    /// Microphone ring buffer capacity in seconds of audio
    pub capture_seconds: f32,

    /// Gain changes ramp over this window to avoid zipper noise
    pub gain_ramp_ms: f32,

    /// Volumes the engine starts with
    pub default_mix: MixSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_frequency: DEFAULT_BASE_FREQUENCY,
            asset_root: PathBuf::from("public"),
            output_device: None,
            input_device: None,
            capture_seconds: 30.0,
            gain_ramp_ms: 5.0,
            default_mix: MixSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Load settings from disk, falling back to defaults on any error.
    pub fn load() -> Self {
        let path = config_path();
        match Self::load_from(&path) {
            Ok(config) => {
                log::info!("Loaded engine config from {}", path.display());
                config
            }
            Err(ConfigError::Read { source, .. }) => {
                log::info!("No config file found ({}), using defaults", source);
                Self::default()
            }
            Err(e) => {
                log::warn!("Failed to parse config ({}), using defaults", e);
                Self::default()
            }
        }
    }

    /// Load and sanitize a config file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&contents)?;
        Ok(config.sanitized())
    }

    /// Save settings to the default location, logging failures.
    pub fn save(&self) {
        if let Err(e) = self.save_to(&config_path()) {
            log::warn!("Failed to save engine config: {}", e);
        }
    }

    /// Save settings as pretty JSON
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(write_err)
    }

    /// Replace out-of-range values with something usable
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if !(self.base_frequency.is_finite() && self.base_frequency > 0.0) {
            log::warn!(
                "base_frequency {} is not usable, using {}",
                self.base_frequency,
                defaults.base_frequency
            );
            self.base_frequency = defaults.base_frequency;
        }
        if !(self.capture_seconds.is_finite() && self.capture_seconds > 0.0) {
            self.capture_seconds = defaults.capture_seconds;
        }
        if !(self.gain_ramp_ms.is_finite() && self.gain_ramp_ms >= 0.0) {
            self.gain_ramp_ms = defaults.gain_ramp_ms;
        }
        self.default_mix = self.default_mix.sanitized();
        self
    }
}
