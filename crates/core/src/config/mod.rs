use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{GardenLiveError, Result};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub visualizer: VisualizerConfig,
    pub sandbox: SandboxConfig,
}

impl AppConfig {
    /// Reads a JSON configuration file. Missing fields fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: AppConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 {
            return Err(GardenLiveError::InvalidInput("sample rate must be positive"));
        }
        if self.audio.block_size == 0 {
            return Err(GardenLiveError::InvalidInput("block size must be positive"));
        }
        if !self.audio.fft_size.is_power_of_two() || self.audio.fft_size < 32 {
            return Err(GardenLiveError::InvalidInput(
                "fft size must be a power of two of at least 32",
            ));
        }
        if !(0.0..=1.0).contains(&self.audio.smoothing) {
            return Err(GardenLiveError::InvalidInput(
                "smoothing must be within [0, 1]",
            ));
        }
        if self.visualizer.bar_count == 0 {
            return Err(GardenLiveError::InvalidInput("bar count must be positive"));
        }
        if self.visualizer.peak_decay_rate < 0.0 {
            return Err(GardenLiveError::InvalidInput(
                "peak decay rate must not be negative",
            ));
        }
        if self.visualizer.frame_rate == 0 {
            return Err(GardenLiveError::InvalidInput("frame rate must be positive"));
        }
        Ok(())
    }
}

/// Configuration specific to the audio subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub block_size: usize,
    /// FFT size of the shared analyser tap.
    pub fft_size: usize,
    /// Analyser smoothing time constant.
    pub smoothing: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            block_size: 1024,
            fft_size: 256,
            smoothing: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizerConfig {
    pub bar_count: usize,
    /// Linear fall per frame of the peak markers.
    pub peak_decay_rate: f32,
    pub frame_rate: u32,
}

impl Default for VisualizerConfig {
    fn default() -> Self {
        Self {
            bar_count: 16,
            peak_decay_rate: 0.02,
            frame_rate: 60,
        }
    }
}

/// Resource limits applied to every pattern evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub max_operations: u64,
    pub max_call_levels: usize,
    pub max_expr_depth: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_operations: 100_000,
            max_call_levels: 64,
            max_expr_depth: 64,
            max_string_size: 10_000,
            max_array_size: 1_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{ "visualizer": { "bar_count": 32 } }"#).unwrap();

        assert_eq!(config.visualizer.bar_count, 32);
        assert_eq!(config.visualizer.frame_rate, 60);
        assert_eq!(config.audio.fft_size, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_fft() {
        let mut config = AppConfig::default();
        config.audio.fft_size = 300;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_bars() {
        let mut config = AppConfig::default();
        config.visualizer.bar_count = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("bar count"));
    }
}
