use log::info;

use super::agc::{quantize, GainClip};
use super::filters::Equalizer;
use super::virtualizer::Virtualizer;
use crate::audio::config::EffectsConfig;
use crate::error::{try_zeroed, DspResult};

/// Equalizer (with bass boost), virtualizer and gain clip, applied in that
/// order to 16-bit stereo blocks.
pub struct EffectsChain {
    pub equalizer: Equalizer,
    pub virtualizer: Virtualizer,
    pub gain_clip: GainClip,
    scratch: Vec<f32>,
}

impl EffectsChain {
    /// `max_block_frames` sizes the float scratch buffer; longer blocks are
    /// processed in pieces.
    pub fn new(sample_rate: u32, max_block_frames: usize, config: &EffectsConfig) -> DspResult<Self> {
        let mut chain = Self {
            equalizer: Equalizer::new(sample_rate),
            virtualizer: Virtualizer::new(sample_rate),
            gain_clip: GainClip::new(sample_rate),
            scratch: try_zeroed(max_block_frames.max(1) * 2, "effects scratch")?,
        };
        chain.apply_config(config)?;
        info!(
            "Effects chain ready at {} Hz ({} equalizer bands)",
            sample_rate,
            chain.equalizer.band_count()
        );
        Ok(chain)
    }

    pub fn apply_config(&mut self, config: &EffectsConfig) -> DspResult<()> {
        self.equalizer.set_level_limit(config.level_limit);
        self.equalizer.set_band_levels(&config.band_levels_mb)?;
        self.equalizer.set_enabled(config.equalizer_enabled);
        self.equalizer.set_bass_boost_strength(config.bass_boost_strength);
        self.equalizer.set_bass_boost_enabled(config.bass_boost_enabled);
        self.virtualizer.set_strength(config.virtualizer_strength);
        self.virtualizer.set_enabled(config.virtualizer_enabled);
        self.gain_clip.set_enabled(config.agc_enabled);
        Ok(())
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.equalizer.set_sample_rate(sample_rate);
        self.virtualizer.set_sample_rate(sample_rate);
        self.gain_clip.set_sample_rate(sample_rate);
    }

    pub fn reset(&mut self) {
        self.equalizer.reset();
        self.virtualizer.reset();
        self.gain_clip.reset();
    }

    /// True when every stage would pass samples through unchanged.
    pub fn is_bypassed(&self) -> bool {
        self.equalizer.is_identity() && !self.virtualizer.is_active() && !self.gain_clip.is_enabled()
    }

    /// Processes interleaved stereo samples in place.
    pub fn process(&mut self, pcm: &mut [i16]) {
        if self.is_bypassed() {
            return;
        }
        let chunk_len = self.scratch.len();
        for block in pcm.chunks_mut(chunk_len) {
            let scratch = &mut self.scratch[..block.len()];
            for (dst, &src) in scratch.iter_mut().zip(block.iter()) {
                *dst = src as f32 / 32_768.0;
            }
            self.equalizer.process(scratch);
            self.virtualizer.process(scratch);
            self.gain_clip.process(scratch);
            quantize(scratch, block);
        }
    }
}
