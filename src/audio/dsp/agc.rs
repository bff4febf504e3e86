//! Automatic gain control that keeps the effects output below full scale.
//!
//! The block peak is measured after the current gain is applied. A peak above
//! `MAX_ALLOWED_SAMPLE` starts (or extends) a reduction period during which the
//! gain falls by 40 dB/s. Once the period ends and enough non-clipping audio has
//! passed, the gain recovers at 0.25 dB/s, never above unity.

use log::debug;

/// 31000 / 32768 of full scale.
pub const MAX_ALLOWED_SAMPLE: f32 = 31_000.0 / 32_768.0;

const REDUCTION_DB_PER_SECOND: f32 = -40.0;
const RECOVERY_DB_PER_SECOND: f32 = 0.25;
const RECOVERY_COOLDOWN_SECONDS: u32 = 3;
const MINIMUM_REDUCTION_MS: u32 = 50;
/// Cooldown value meaning recovery is never scheduled.
const NEVER: u32 = u32::MAX;

pub struct GainClip {
    enabled: bool,
    sample_rate: u32,
    gain: f32,
    reduce_ratio: f32,
    recover_ratio: f32,
    minimum_reduction_frames: u32,
    cooldown_frames: u32,
    frames_left_to_reduce: u32,
    frames_before_recovering: u32,
}

impl GainClip {
    pub fn new(sample_rate: u32) -> Self {
        let mut agc = Self {
            enabled: false,
            sample_rate: 0,
            gain: 1.0,
            reduce_ratio: 1.0,
            recover_ratio: 1.0,
            minimum_reduction_frames: 0,
            cooldown_frames: 0,
            frames_left_to_reduce: 0,
            frames_before_recovering: NEVER,
        };
        agc.set_sample_rate(sample_rate);
        agc
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        if sample_rate == self.sample_rate {
            return;
        }
        self.sample_rate = sample_rate;
        let sr = sample_rate.max(1) as f32;
        self.reduce_ratio = 10.0_f32.powf(REDUCTION_DB_PER_SECOND / 20.0 / sr);
        self.recover_ratio = 10.0_f32.powf(RECOVERY_DB_PER_SECOND / 20.0 / sr);
        self.minimum_reduction_frames = sample_rate * MINIMUM_REDUCTION_MS / 1_000;
        self.cooldown_frames = sample_rate * RECOVERY_COOLDOWN_SECONDS;
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled != self.enabled {
            self.enabled = enabled;
            self.reset();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Back to unity gain with both counters idle.
    pub fn reset(&mut self) {
        self.gain = 1.0;
        self.frames_left_to_reduce = 0;
        self.frames_before_recovering = NEVER;
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Current reduction in millibels, 0 when the gain is unity.
    pub fn gain_reduction_mb(&self) -> i32 {
        if self.gain >= 1.0 {
            0
        } else {
            (-2_000.0 * self.gain.max(f32::MIN_POSITIVE).log10()).round() as i32
        }
    }

    /// Applies the gain to interleaved stereo samples in place and updates the
    /// counters from the block's post-gain peak.
    pub fn process(&mut self, samples: &mut [f32]) {
        if !self.enabled {
            return;
        }

        let mut peak = 0.0_f32;
        for frame in samples.chunks_exact_mut(2) {
            if self.frames_left_to_reduce > 0 {
                self.gain *= self.reduce_ratio;
                self.frames_left_to_reduce -= 1;
            } else if self.frames_before_recovering == 0 && self.gain < 1.0 {
                self.gain = (self.gain * self.recover_ratio).min(1.0);
            }

            frame[0] *= self.gain;
            frame[1] *= self.gain;
            peak = peak.max(frame[0].abs()).max(frame[1].abs());
        }

        let frames = (samples.len() / 2) as u32;
        if peak > MAX_ALLOWED_SAMPLE {
            if self.frames_left_to_reduce == 0 {
                debug!("Gain clip engaged: block peak {:.3}, gain {:.3}", peak, self.gain);
            }
            self.frames_left_to_reduce = self.minimum_reduction_frames.max(1);
            self.frames_before_recovering = self.cooldown_frames;
        } else if self.frames_left_to_reduce == 0
            && self.frames_before_recovering != NEVER
            && self.frames_before_recovering > 0
        {
            self.frames_before_recovering = self.frames_before_recovering.saturating_sub(frames);
            if self.frames_before_recovering == 0 {
                debug!("Gain clip recovering from {} mB", self.gain_reduction_mb());
            }
        }
    }
}

/// Converts normalized samples to 16-bit with rounding and saturation.
pub fn quantize(samples: &[f32], out: &mut [i16]) {
    for (dst, &src) in out.iter_mut().zip(samples) {
        *dst = (src * 32_768.0).round().clamp(-32_768.0, 32_767.0) as i16;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 48_000;

    fn block(frames: usize, amplitude: f32) -> Vec<f32> {
        (0..frames)
            .flat_map(|i| {
                let s = if i % 2 == 0 { amplitude } else { -amplitude };
                [s, s]
            })
            .collect()
    }

    #[test]
    fn disabled_leaves_samples_untouched() {
        let mut agc = GainClip::new(RATE);
        let mut samples = block(256, 1.5);
        agc.process(&mut samples);
        assert_eq!(samples, block(256, 1.5));
        assert_eq!(agc.gain_reduction_mb(), 0);
    }

    #[test]
    fn quiet_input_never_reduces() {
        let mut agc = GainClip::new(RATE);
        agc.set_enabled(true);
        for _ in 0..100 {
            let mut samples = block(256, 0.9);
            agc.process(&mut samples);
        }
        assert_eq!(agc.gain(), 1.0);
    }

    #[test]
    fn gain_falls_every_block_while_clipping() {
        let mut agc = GainClip::new(RATE);
        agc.set_enabled(true);
        let mut samples = block(256, 1.5);
        agc.process(&mut samples);
        let mut previous = agc.gain();
        assert_eq!(previous, 1.0);
        for _ in 0..10 {
            let mut samples = block(256, 1.5);
            agc.process(&mut samples);
            assert!(agc.gain() < previous, "gain {} did not fall", agc.gain());
            assert!(agc.gain() <= 1.0);
            previous = agc.gain();
        }
        assert!(agc.gain_reduction_mb() > 0);
    }

    #[test]
    fn holds_during_cooldown_then_recovers_to_unity() {
        let mut agc = GainClip::new(RATE);
        agc.set_enabled(true);
        for _ in 0..5 {
            let mut samples = block(480, 1.2);
            agc.process(&mut samples);
        }
        // Let the minimum reduction period run out.
        let mut samples = block(RATE as usize / 10, 0.1);
        agc.process(&mut samples);
        let held = agc.gain();
        assert!(held < 1.0);

        let mut elapsed = 0;
        while elapsed < RATE as usize * 2 {
            let mut samples = block(480, 0.1);
            agc.process(&mut samples);
            assert_eq!(agc.gain(), held, "gain moved during cooldown");
            elapsed += 480;
        }

        let mut previous = held;
        for _ in 0..2_000 {
            let mut samples = block(480, 0.1);
            agc.process(&mut samples);
            assert!(agc.gain() >= previous);
            assert!(agc.gain() <= 1.0);
            previous = agc.gain();
        }
        assert!(previous > held);
    }

    #[test]
    fn disabling_restores_unity_gain() {
        let mut agc = GainClip::new(RATE);
        agc.set_enabled(true);
        for _ in 0..4 {
            let mut samples = block(256, 2.0);
            agc.process(&mut samples);
        }
        assert!(agc.gain() < 1.0);
        agc.set_enabled(false);
        assert_eq!(agc.gain(), 1.0);
        assert_eq!(agc.gain_reduction_mb(), 0);
    }

    #[test]
    fn quantize_rounds_and_saturates() {
        let mut out = [0_i16; 5];
        quantize(&[0.0, 0.5, -1.0, 1.5, -2.0], &mut out);
        assert_eq!(out, [0, 16_384, -32_768, 32_767, -32_768]);
    }
}
