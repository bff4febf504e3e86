//! Spectrum analyzer producing 256 smoothed display bins per frame.

use serde::{Deserialize, Serialize};

use super::dsp::fft::RealFft;
use crate::error::{try_zeroed, DspError, DspResult};

/// Samples in a visualizer waveform and points in the real FFT.
pub const FFT_SIZE: usize = 1024;
pub const SPECTRUM_BINS: usize = 256;
/// Squared amplitudes below this are treated as silence.
const MIN_AMPLITUDE_SQUARED: i32 = 8;

/// Per-bin gain curve applied before display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiplierPreset {
    Voice,
    #[default]
    Music,
}

impl MultiplierPreset {
    /// Monotonically increasing, so higher bins get more gain to offset the
    /// natural high-frequency roll-off.
    pub fn curve(self) -> [f32; SPECTRUM_BINS] {
        let (ceiling, spread, offset, scale) = match self {
            MultiplierPreset::Voice => (512.0, 3_700.0, 0.165, 128.0),
            MultiplierPreset::Music => (256.0, 10_000.0, 0.187, 64.0),
        };
        let mut curve = [0.0_f32; SPECTRUM_BINS];
        for (i, slot) in curve.iter_mut().enumerate() {
            let falloff = (1.0_f64 / (i as f64 / spread + offset)).exp();
            *slot = ((ceiling - falloff) / scale) as f32;
        }
        curve
    }
}

/// Decay speed of falling bins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpectrumSpeed {
    Slow,
    #[default]
    Normal,
    Fast,
}

impl SpectrumSpeed {
    /// Weight of the new value per elapsed millisecond.
    pub fn coefficient_per_ms(self) -> f32 {
        match self {
            SpectrumSpeed::Slow => 0.0625 / 16.0,
            SpectrumSpeed::Normal => 0.09375 / 16.0,
            SpectrumSpeed::Fast => 0.125 / 16.0,
        }
    }

    /// Weight of the new value after `delta_millis`, capped at 1.
    pub fn decay_coefficient(self, delta_millis: u32) -> f32 {
        (self.coefficient_per_ms() * delta_millis as f32).min(1.0)
    }
}

pub struct SpectrumAnalyzer {
    preset: MultiplierPreset,
    speed: SpectrumSpeed,
    multiplier: [f32; SPECTRUM_BINS],
    previous: [f32; SPECTRUM_BINS],
    processed: [u8; SPECTRUM_BINS],
    fft: RealFft,
    work: Vec<f32>,
    packed: Vec<i8>,
}

impl SpectrumAnalyzer {
    pub fn new(preset: MultiplierPreset, speed: SpectrumSpeed) -> DspResult<Self> {
        Ok(Self {
            preset,
            speed,
            multiplier: preset.curve(),
            previous: [0.0; SPECTRUM_BINS],
            processed: [0; SPECTRUM_BINS],
            fft: RealFft::new(FFT_SIZE)?,
            work: try_zeroed(FFT_SIZE, "spectrum work buffer")?,
            packed: try_zeroed(FFT_SIZE, "spectrum packed buffer")?,
        })
    }

    pub fn set_preset(&mut self, preset: MultiplierPreset) {
        if preset != self.preset {
            self.preset = preset;
            self.multiplier = preset.curve();
        }
    }

    pub fn preset(&self) -> MultiplierPreset {
        self.preset
    }

    pub fn set_speed(&mut self, speed: SpectrumSpeed) {
        self.speed = speed;
    }

    pub fn speed(&self) -> SpectrumSpeed {
        self.speed
    }

    pub fn reset(&mut self) {
        self.previous = [0.0; SPECTRUM_BINS];
        self.processed = [0; SPECTRUM_BINS];
    }

    /// Smoothed magnitudes before the 0..=255 clamp.
    pub fn magnitudes(&self) -> &[f32; SPECTRUM_BINS] {
        &self.previous
    }

    pub fn processed(&self) -> &[u8; SPECTRUM_BINS] {
        &self.processed
    }

    /// Updates the bins from packed 8-bit FFT output (`re, im` pairs, with the
    /// Nyquist term in slot 1). Falling bins decay according to the elapsed time.
    pub fn process(&mut self, bfft: &[i8], delta_millis: u32) -> DspResult<&[u8; SPECTRUM_BINS]> {
        if bfft.len() < SPECTRUM_BINS * 2 {
            return Err(DspError::InvalidBuffer("spectrum input needs 512 packed bytes"));
        }

        let coef_new = self.speed.decay_coefficient(delta_millis);
        smooth_bins(
            bfft,
            coef_new,
            &self.multiplier,
            &mut self.previous,
            &mut self.processed,
        );
        Ok(&self.processed)
    }

    /// Runs the FFT over an unsigned 8-bit waveform (128 = silence) and feeds
    /// the packed result through [`SpectrumAnalyzer::process`].
    pub fn process_waveform(
        &mut self,
        waveform: &[u8],
        delta_millis: u32,
    ) -> DspResult<&[u8; SPECTRUM_BINS]> {
        if waveform.len() < FFT_SIZE {
            return Err(DspError::InvalidBuffer("waveform needs 1024 samples"));
        }
        for (slot, &sample) in self.work.iter_mut().zip(waveform) {
            *slot = sample as f32 - 128.0;
        }
        self.fft.forward(&mut self.work)?;

        let scale = 2.0 / FFT_SIZE as f32;
        for (packed, &value) in self.packed.iter_mut().zip(self.work.iter()) {
            *packed = (value * scale).round().clamp(-128.0, 127.0) as i8;
        }

        smooth_bins(
            &self.packed,
            self.speed.decay_coefficient(delta_millis),
            &self.multiplier,
            &mut self.previous,
            &mut self.processed,
        );
        Ok(&self.processed)
    }
}

/// Scales each packed bin by its multiplier. Rising bins jump, falling bins
/// blend toward the new value by `coef_new`.
fn smooth_bins(
    bfft: &[i8],
    coef_new: f32,
    multiplier: &[f32; SPECTRUM_BINS],
    previous: &mut [f32; SPECTRUM_BINS],
    processed: &mut [u8; SPECTRUM_BINS],
) {
    let coef_old = 1.0 - coef_new;
    for bin in 0..SPECTRUM_BINS {
        let re = bfft[bin * 2] as i32;
        // Slot 1 holds the Nyquist term, which is never displayed.
        let im = if bin == 0 { re } else { bfft[bin * 2 + 1] as i32 };
        let amplitude_sq = re * re + im * im;

        let mut magnitude = if amplitude_sq < MIN_AMPLITUDE_SQUARED {
            0.0
        } else {
            multiplier[bin] * (amplitude_sq as f32).sqrt()
        };

        let old = previous[bin];
        if magnitude < old {
            magnitude = coef_new * magnitude + coef_old * old;
        }
        previous[bin] = magnitude;
        processed[bin] = magnitude.min(255.0) as u8;
    }
}
