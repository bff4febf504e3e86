use super::filters::{BiquadFilter, STRENGTH_MAX};

const CROSSFEED_DELAY_MS: f32 = 0.3;
const CROSSFEED_LP_FREQ: f32 = 700.0;
const CROSSFEED_LP_Q: f32 = 0.707;

/// Headphone virtualizer. Each channel receives a delayed, low-passed copy of the
/// opposite channel scaled by `strength / 1000`.
pub struct Virtualizer {
    enabled: bool,
    strength: u16,
    amount: f32,
    sample_rate: f32,
    delay_left: Vec<f32>,
    delay_right: Vec<f32>,
    delay_pos: usize,
    crossfeed: BiquadFilter,
}

impl Virtualizer {
    pub fn new(sample_rate: u32) -> Self {
        let mut virtualizer = Self {
            enabled: false,
            strength: 0,
            amount: 0.0,
            sample_rate: 0.0,
            delay_left: Vec::new(),
            delay_right: Vec::new(),
            delay_pos: 0,
            crossfeed: BiquadFilter::new(),
        };
        virtualizer.set_sample_rate(sample_rate);
        virtualizer
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        let sr = sample_rate as f32;
        if (sr - self.sample_rate).abs() > f32::EPSILON {
            self.sample_rate = sr;
            let delay_len = ((CROSSFEED_DELAY_MS / 1000.0) * sr).ceil().max(1.0) as usize;
            self.delay_left = vec![0.0; delay_len];
            self.delay_right = vec![0.0; delay_len];
            self.delay_pos = 0;
            self.crossfeed.set_low_pass(sr, CROSSFEED_LP_FREQ, CROSSFEED_LP_Q);
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled && !self.enabled {
            self.reset();
        }
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_strength(&mut self, strength: u16) {
        self.strength = strength.min(STRENGTH_MAX);
        self.amount = self.strength as f32 / STRENGTH_MAX as f32;
    }

    pub fn strength(&self) -> u16 {
        self.strength
    }

    pub fn is_active(&self) -> bool {
        self.enabled && self.strength > 0
    }

    pub fn reset(&mut self) {
        self.delay_left.fill(0.0);
        self.delay_right.fill(0.0);
        self.delay_pos = 0;
        self.crossfeed.reset();
    }

    /// Mixes crossfeed into interleaved stereo samples in place.
    pub fn process(&mut self, samples: &mut [f32]) {
        if !self.is_active() {
            return;
        }
        let amount = self.amount;
        let delay_len = self.delay_left.len();
        for frame in samples.chunks_exact_mut(2) {
            let (left, right) = (frame[0], frame[1]);

            let delayed_left = self.delay_left[self.delay_pos];
            let delayed_right = self.delay_right[self.delay_pos];
            self.delay_left[self.delay_pos] = left;
            self.delay_right[self.delay_pos] = right;
            self.delay_pos += 1;
            if self.delay_pos == delay_len {
                self.delay_pos = 0;
            }

            frame[0] = left + self.crossfeed.process_sample(0, delayed_right) * amount;
            frame[1] = right + self.crossfeed.process_sample(1, delayed_left) * amount;
        }
    }
}
