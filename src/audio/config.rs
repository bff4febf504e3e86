use serde::{Deserialize, Serialize};

use super::analyzer::{MultiplierPreset, SpectrumSpeed};
use super::capture::WAVEFORM_LEN;
use super::dsp::filters::{BAND_COUNT, STRENGTH_MAX};
use super::output::MIN_BUFFER_COUNT;
use super::resampler::validate_rate;
use crate::error::{DspError, DspResult};

/// Maximum absolute equalizer band level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelLimit {
    Db15,
    #[default]
    Db20,
}

impl LevelLimit {
    pub fn millibels(self) -> i32 {
        match self {
            LevelLimit::Db15 => 1_500,
            LevelLimit::Db20 => 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectsConfig {
    pub equalizer_enabled: bool,
    /// Millibels, pre-amp first. Shorter lists leave the remaining bands flat.
    pub band_levels_mb: Vec<i32>,
    pub level_limit: LevelLimit,
    pub bass_boost_enabled: bool,
    pub bass_boost_strength: u16,
    pub virtualizer_enabled: bool,
    pub virtualizer_strength: u16,
    pub agc_enabled: bool,
}

impl Default for EffectsConfig {
    fn default() -> Self {
        Self {
            equalizer_enabled: false,
            band_levels_mb: vec![0; BAND_COUNT],
            level_limit: LevelLimit::default(),
            bass_boost_enabled: false,
            bass_boost_strength: 0,
            virtualizer_enabled: false,
            virtualizer_strength: 0,
            agc_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectrumConfig {
    pub preset: MultiplierPreset,
    pub speed: SpectrumSpeed,
}

/// Playback session parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub src_sample_rate: u32,
    pub src_channels: u16,
    pub dst_sample_rate: u32,
    pub buffer_count: u32,
    /// Total queue capacity in stereo frames, split evenly across buffers.
    pub buffer_size_in_frames: u32,
    /// Visualizer capture length; 0 disables capture.
    pub visualizer_buffer_frames: u32,
    pub effects: EffectsConfig,
    pub spectrum: SpectrumConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            src_sample_rate: 44_100,
            src_channels: 2,
            dst_sample_rate: 48_000,
            buffer_count: 4,
            buffer_size_in_frames: 4_096,
            visualizer_buffer_frames: 8_192,
            effects: EffectsConfig::default(),
            spectrum: SpectrumConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Parses and validates a JSON session description. Missing fields take
    /// their defaults.
    pub fn from_json(json: &str) -> DspResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DspError::InvalidConfig(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> DspResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| DspError::InvalidConfig(format!("Failed to serialize config: {e}")))
    }

    pub fn frames_per_buffer(&self) -> usize {
        (self.buffer_size_in_frames / self.buffer_count.max(1)) as usize
    }

    pub fn validate(&self) -> DspResult<()> {
        validate_rate(self.src_sample_rate)?;
        validate_rate(self.dst_sample_rate)?;
        if self.src_channels != 1 && self.src_channels != 2 {
            return Err(DspError::InvalidChannelCount(self.src_channels));
        }
        if self.buffer_count < MIN_BUFFER_COUNT {
            return Err(DspError::InvalidConfig(format!(
                "buffer_count must be at least {MIN_BUFFER_COUNT}, got {}",
                self.buffer_count
            )));
        }
        if self.buffer_size_in_frames < self.buffer_count {
            return Err(DspError::InvalidConfig(format!(
                "buffer_size_in_frames {} is smaller than buffer_count {}",
                self.buffer_size_in_frames, self.buffer_count
            )));
        }
        let min_visualizer = self.buffer_size_in_frames as usize + WAVEFORM_LEN;
        if self.visualizer_buffer_frames != 0 && (self.visualizer_buffer_frames as usize) < min_visualizer {
            return Err(DspError::InvalidConfig(format!(
                "visualizer_buffer_frames must be 0 or at least {min_visualizer}, got {}",
                self.visualizer_buffer_frames
            )));
        }
        self.effects.validate()
    }
}

impl EffectsConfig {
    pub fn validate(&self) -> DspResult<()> {
        if self.band_levels_mb.len() > BAND_COUNT {
            return Err(DspError::InvalidConfig(format!(
                "at most {BAND_COUNT} band levels allowed, got {}",
                self.band_levels_mb.len()
            )));
        }
        let max = self.level_limit.millibels();
        if let Some(level) = self.band_levels_mb.iter().find(|level| level.abs() > max) {
            return Err(DspError::InvalidConfig(format!(
                "band level {level} mB exceeds the +/-{max} mB limit"
            )));
        }
        for (name, strength) in [
            ("bass_boost_strength", self.bass_boost_strength),
            ("virtualizer_strength", self.virtualizer_strength),
        ] {
            if strength > STRENGTH_MAX {
                return Err(DspError::InvalidConfig(format!(
                    "{name} must be at most {STRENGTH_MAX}, got {strength}"
                )));
            }
        }
        Ok(())
    }
}
