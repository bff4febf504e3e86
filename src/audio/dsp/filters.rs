use log::debug;

use crate::audio::config::LevelLimit;
use crate::error::{DspError, DspResult};

/// Band 0 is the pre-amp, bands 1..=10 follow `BAND_CENTERS_HZ`.
pub const BAND_COUNT: usize = 11;
pub const PREAMP_BAND: usize = 0;
/// Bass boost is added to the shelf between 62.5 Hz and 125 Hz.
pub const BASS_BOOST_BAND: usize = 2;
/// Strength scale shared by bass boost and virtualizer.
pub const STRENGTH_MAX: u16 = 1_000;
/// Full bass boost strength corresponds to +15 dB.
const BASS_BOOST_MAX_MB: i32 = 1_500;

const BAND_CENTERS_HZ: [f32; BAND_COUNT - 1] = [
    31.25, 62.5, 125.0, 250.0, 500.0, 1_000.0, 2_000.0, 4_000.0, 8_000.0, 16_000.0,
];
/// Shelf corner between a band and the next one, relative to the band center.
const SHELF_CORNER_RATIO: f32 = 1.5;
/// Corners must stay below this fraction of the sample rate.
const SHELF_CORNER_LIMIT: f32 = 0.45;
const SHELF_SLOPE: f32 = 2.0;
/// Lower bound of the term under the square root in the shelf alpha.
const MIN_SHELF_ALPHA_TERM: f32 = 0.5;

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct BiquadCoefficients {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

impl BiquadCoefficients {
    fn identity() -> Self {
        Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
        }
    }

    /// Squared magnitude response at normalized angular frequency `w`.
    fn magnitude_squared(&self, w: f64) -> f64 {
        let (b0, b1, b2) = (self.b0 as f64, self.b1 as f64, self.b2 as f64);
        let (a1, a2) = (self.a1 as f64, self.a2 as f64);
        let cos_w = w.cos();
        let cos_2w = (2.0 * w).cos();
        let num = b0 * b0 + b1 * b1 + b2 * b2 + 2.0 * (b0 * b1 + b1 * b2) * cos_w + 2.0 * b0 * b2 * cos_2w;
        let den = 1.0 + a1 * a1 + a2 * a2 + 2.0 * (a1 + a1 * a2) * cos_w + 2.0 * a2 * cos_2w;
        if den.abs() > 1e-12 {
            num / den
        } else {
            1.0
        }
    }
}

/// Direct form I biquad with independent left/right history.
pub struct BiquadFilter {
    coeffs: BiquadCoefficients,
    x1: [f32; 2],
    x2: [f32; 2],
    y1: [f32; 2],
    y2: [f32; 2],
}

impl BiquadFilter {
    pub fn new() -> Self {
        Self {
            coeffs: BiquadCoefficients::identity(),
            x1: [0.0; 2],
            x2: [0.0; 2],
            y1: [0.0; 2],
            y2: [0.0; 2],
        }
    }

    pub fn reset(&mut self) {
        self.x1 = [0.0; 2];
        self.x2 = [0.0; 2];
        self.y1 = [0.0; 2];
        self.y2 = [0.0; 2];
    }

    #[inline]
    pub fn process_sample(&mut self, channel: usize, x: f32) -> f32 {
        let c = &self.coeffs;
        let y = c.b0 * x + c.b1 * self.x1[channel] + c.b2 * self.x2[channel]
            - c.a1 * self.y1[channel]
            - c.a2 * self.y2[channel];
        self.x2[channel] = self.x1[channel];
        self.x1[channel] = x;
        self.y2[channel] = self.y1[channel];
        self.y1[channel] = y;
        y
    }

    /// Filters interleaved stereo samples in place.
    pub fn process_interleaved(&mut self, samples: &mut [f32]) {
        for frame in samples.chunks_exact_mut(2) {
            frame[0] = self.process_sample(0, frame[0]);
            frame[1] = self.process_sample(1, frame[1]);
        }
    }

    /// Installs new coefficients and clears history.
    pub fn set_low_shelf(&mut self, sample_rate: f32, frequency: f32, gain_mb: i32) {
        self.coeffs = low_shelf_coefficients(sample_rate, frequency, gain_mb);
        self.reset();
    }

    pub fn set_low_pass(&mut self, sample_rate: f32, frequency: f32, q_factor: f32) {
        self.coeffs = low_pass_coefficients(sample_rate, frequency, q_factor);
        self.reset();
    }

    pub fn set_identity(&mut self) {
        self.coeffs = BiquadCoefficients::identity();
        self.reset();
    }

    #[cfg(test)]
    fn is_finite(&self) -> bool {
        self.y1.iter().chain(self.y2.iter()).all(|v| v.is_finite())
    }
}

impl Default for BiquadFilter {
    fn default() -> Self {
        Self::new()
    }
}

struct ShelfStage {
    filter: BiquadFilter,
    gain_mb: i32,
}

/// Telescoping low-shelf equalizer.
///
/// Shelf `i` boosts everything below its corner by `level[i] - level[i + 1]`, so
/// the cascade reproduces each band's absolute level. The last usable band is a
/// flat gain that also carries the pre-amp.
pub struct Equalizer {
    sample_rate: u32,
    enabled: bool,
    limit: LevelLimit,
    levels_mb: [i32; BAND_COUNT],
    bass_boost_enabled: bool,
    bass_boost_strength: u16,
    last_band: usize,
    stages: Vec<ShelfStage>,
    output_gain_mb: i32,
    output_gain: f32,
}

impl Equalizer {
    pub fn new(sample_rate: u32) -> Self {
        let mut eq = Self {
            sample_rate,
            enabled: false,
            limit: LevelLimit::default(),
            levels_mb: [0; BAND_COUNT],
            bass_boost_enabled: false,
            bass_boost_strength: 0,
            last_band: last_band_for(sample_rate),
            stages: (0..BAND_COUNT)
                .map(|_| ShelfStage {
                    filter: BiquadFilter::new(),
                    gain_mb: 0,
                })
                .collect(),
            output_gain_mb: 0,
            output_gain: 1.0,
        };
        eq.recalculate();
        eq
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        if sample_rate != self.sample_rate {
            self.sample_rate = sample_rate;
            self.last_band = last_band_for(sample_rate);
            self.recalculate();
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled != self.enabled {
            self.enabled = enabled;
            self.recalculate();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_level_limit(&mut self, limit: LevelLimit) {
        self.limit = limit;
        let max = limit.millibels();
        for level in &mut self.levels_mb {
            *level = (*level).clamp(-max, max);
        }
        self.recalculate();
    }

    pub fn set_band_level(&mut self, band: usize, level_mb: i32) -> DspResult<()> {
        let slot = self.levels_mb.get_mut(band).ok_or(DspError::InvalidBand {
            index: band,
            count: BAND_COUNT,
        })?;
        let max = self.limit.millibels();
        let clamped = level_mb.clamp(-max, max);
        if *slot != clamped {
            *slot = clamped;
            self.recalculate();
        }
        Ok(())
    }

    /// Replaces the leading band levels (pre-amp first); missing bands are zeroed.
    pub fn set_band_levels(&mut self, levels_mb: &[i32]) -> DspResult<()> {
        if levels_mb.len() > BAND_COUNT {
            return Err(DspError::InvalidBand {
                index: levels_mb.len() - 1,
                count: BAND_COUNT,
            });
        }
        let max = self.limit.millibels();
        self.levels_mb = [0; BAND_COUNT];
        for (slot, level) in self.levels_mb.iter_mut().zip(levels_mb) {
            *slot = (*level).clamp(-max, max);
        }
        self.recalculate();
        Ok(())
    }

    pub fn band_level(&self, band: usize) -> DspResult<i32> {
        self.levels_mb
            .get(band)
            .copied()
            .ok_or(DspError::InvalidBand {
                index: band,
                count: BAND_COUNT,
            })
    }

    pub fn set_bass_boost_enabled(&mut self, enabled: bool) {
        if enabled != self.bass_boost_enabled {
            self.bass_boost_enabled = enabled;
            self.recalculate();
        }
    }

    pub fn set_bass_boost_strength(&mut self, strength: u16) {
        let clamped = strength.min(STRENGTH_MAX);
        if clamped != self.bass_boost_strength {
            self.bass_boost_strength = clamped;
            self.recalculate();
        }
    }

    pub fn bass_boost_strength(&self) -> u16 {
        self.bass_boost_strength
    }

    /// Usable bands including the pre-amp at the current sample rate.
    pub fn band_count(&self) -> usize {
        self.last_band + 1
    }

    /// Center frequency of a band, `None` for the pre-amp or out-of-range bands.
    pub fn band_frequency(band: usize) -> Option<f32> {
        band.checked_sub(1)
            .and_then(|index| BAND_CENTERS_HZ.get(index))
            .copied()
    }

    /// True when processing would leave samples unchanged.
    pub fn is_identity(&self) -> bool {
        self.output_gain_mb == 0 && self.stages.iter().all(|stage| stage.gain_mb == 0)
    }

    /// Zeroes every band's history without touching coefficients.
    pub fn reset(&mut self) {
        for stage in &mut self.stages {
            stage.filter.reset();
        }
    }

    /// Filters interleaved stereo samples in place.
    pub fn process(&mut self, samples: &mut [f32]) {
        for stage in &mut self.stages[1..self.last_band] {
            if stage.gain_mb != 0 {
                stage.filter.process_interleaved(samples);
            }
        }
        if self.output_gain_mb != 0 {
            let gain = self.output_gain;
            for sample in samples.iter_mut() {
                *sample *= gain;
            }
        }
    }

    fn effective_level(&self, band: usize) -> i32 {
        if self.enabled {
            self.levels_mb[band]
        } else {
            0
        }
    }

    fn recalculate(&mut self) {
        let sample_rate = self.sample_rate as f32;
        let last = self.last_band;
        let bass_boost_mb = if self.bass_boost_enabled {
            self.bass_boost_strength as i32 * BASS_BOOST_MAX_MB / STRENGTH_MAX as i32
        } else {
            0
        };

        for band in 0..BAND_COUNT {
            let gain_mb = if band >= 1 && band < last {
                let mut delta = self.effective_level(band) - self.effective_level(band + 1);
                if band == BASS_BOOST_BAND {
                    delta += bass_boost_mb;
                }
                delta
            } else {
                0
            };

            let stage = &mut self.stages[band];
            stage.gain_mb = gain_mb;
            if gain_mb == 0 {
                stage.filter.set_identity();
            } else {
                stage
                    .filter
                    .set_low_shelf(sample_rate, shelf_corner(band), gain_mb);
            }
        }

        self.output_gain_mb = self.effective_level(last) + self.effective_level(PREAMP_BAND);
        self.output_gain = millibels_to_gain(self.output_gain_mb);

        debug!(
            "Equalizer recalculated at {} Hz: {} bands, output gain {} mB, bass boost {} mB",
            self.sample_rate,
            self.band_count(),
            self.output_gain_mb,
            bass_boost_mb
        );
    }

    /// Combined magnitude response (dB) at logarithmically spaced frequencies.
    /// Returns `(frequency_hz, magnitude_db)` pairs.
    pub fn frequency_response(&self, num_points: usize) -> Vec<(f32, f32)> {
        let sample_rate = self.sample_rate as f64;
        let min_hz = 20.0_f64;
        let max_hz = (sample_rate * 0.5).min(20_000.0);
        let n = num_points.max(2);
        let output_mag_sq = (self.output_gain as f64).powi(2);

        (0..n)
            .map(|i| {
                let ratio = i as f64 / (n - 1) as f64;
                let freq = min_hz * (max_hz / min_hz).powf(ratio);
                let w = 2.0 * std::f64::consts::PI * freq / sample_rate;
                let total_mag_sq = self.stages[1..self.last_band]
                    .iter()
                    .filter(|stage| stage.gain_mb != 0)
                    .fold(output_mag_sq, |acc, stage| {
                        acc * stage.filter.coeffs.magnitude_squared(w)
                    });
                (freq as f32, (10.0 * total_mag_sq.max(1e-12).log10()) as f32)
            })
            .collect()
    }

    #[cfg(test)]
    fn is_finite(&self) -> bool {
        self.stages.iter().all(|stage| stage.filter.is_finite())
    }
}

fn shelf_corner(band: usize) -> f32 {
    BAND_CENTERS_HZ[band - 1] * SHELF_CORNER_RATIO
}

/// Index of the band that becomes the flat output gain: the first band whose
/// shelf corner would sit too close to Nyquist.
fn last_band_for(sample_rate: u32) -> usize {
    let limit = sample_rate as f32 * SHELF_CORNER_LIMIT;
    let mut last = 1;
    while last < BAND_COUNT - 1 && shelf_corner(last) < limit {
        last += 1;
    }
    last
}

pub(crate) fn millibels_to_gain(millibels: i32) -> f32 {
    10.0_f32.powf(millibels as f32 / 2_000.0)
}

fn normalize(b0: f32, b1: f32, b2: f32, a0: f32, a1: f32, a2: f32) -> BiquadCoefficients {
    let inv_a0 = if a0.abs() > f32::EPSILON {
        1.0 / a0
    } else {
        1.0
    };
    BiquadCoefficients {
        b0: b0 * inv_a0,
        b1: b1 * inv_a0,
        b2: b2 * inv_a0,
        a1: a1 * inv_a0,
        a2: a2 * inv_a0,
    }
}

/// RBJ low shelf with `A = 10^(mB / 4000)`. The slope starts at 2 and is reduced
/// for large gains so the alpha term stays real.
fn low_shelf_coefficients(sample_rate: f32, frequency: f32, gain_mb: i32) -> BiquadCoefficients {
    let w0 = 2.0 * std::f32::consts::PI * frequency / sample_rate;
    let a = 10.0_f32.powf(gain_mb as f32 / 4_000.0);
    let cos_w0 = w0.cos();
    let sin_w0 = w0.sin();
    let a_sum = a + 1.0 / a;
    let term = (a_sum * (1.0 / SHELF_SLOPE - 1.0) + 2.0).max(MIN_SHELF_ALPHA_TERM);
    let alpha = sin_w0 * 0.5 * term.sqrt();
    let beta = 2.0 * a.sqrt() * alpha;

    normalize(
        a * ((a + 1.0) - (a - 1.0) * cos_w0 + beta),
        2.0 * a * ((a - 1.0) - (a + 1.0) * cos_w0),
        a * ((a + 1.0) - (a - 1.0) * cos_w0 - beta),
        (a + 1.0) + (a - 1.0) * cos_w0 + beta,
        -2.0 * ((a - 1.0) + (a + 1.0) * cos_w0),
        (a + 1.0) + (a - 1.0) * cos_w0 - beta,
    )
}

fn low_pass_coefficients(sample_rate: f32, frequency: f32, q_factor: f32) -> BiquadCoefficients {
    let w0 = 2.0 * std::f32::consts::PI * frequency / sample_rate;
    let alpha = w0.sin() / (2.0 * q_factor.max(0.1));
    let cos_w0 = w0.cos();

    normalize(
        (1.0 - cos_w0) * 0.5,
        1.0 - cos_w0,
        (1.0 - cos_w0) * 0.5,
        1.0 + alpha,
        -2.0 * cos_w0,
        1.0 - alpha,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_block(frames: usize, sample_rate: f32, freq: f32, amplitude: f32, start: usize) -> Vec<f32> {
        (start..start + frames)
            .flat_map(|i| {
                let s = amplitude
                    * (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate).sin();
                [s, s]
            })
            .collect()
    }

    fn response_at(eq: &Equalizer, freq: f32) -> f32 {
        let response = eq.frequency_response(400);
        response
            .iter()
            .min_by(|a, b| (a.0 - freq).abs().total_cmp(&(b.0 - freq).abs()))
            .map(|point| point.1)
            .unwrap_or(f32::NAN)
    }

    #[test]
    fn flat_levels_pass_samples_unchanged() {
        let mut eq = Equalizer::new(44_100);
        eq.set_enabled(true);
        let input: Vec<f32> = (0..2_048).map(|i| ((i * 37 % 65_536) as f32 - 32_768.0) / 32_768.0).collect();
        let mut output = input.clone();
        eq.process(&mut output);
        assert!(eq.is_identity());
        assert_eq!(output, input);
    }

    #[test]
    fn band_count_shrinks_at_low_sample_rates() {
        assert_eq!(Equalizer::new(48_000).band_count(), BAND_COUNT);
        assert_eq!(Equalizer::new(44_100).band_count(), BAND_COUNT);
        assert!(Equalizer::new(12_000).band_count() < BAND_COUNT);
        assert!(Equalizer::new(8_000).band_count() <= Equalizer::new(12_000).band_count());
    }

    #[test]
    fn levels_are_clamped_to_limit() {
        let mut eq = Equalizer::new(48_000);
        eq.set_band_level(3, 5_000).expect("band exists");
        assert_eq!(eq.band_level(3), Ok(2_000));
        eq.set_level_limit(LevelLimit::Db15);
        assert_eq!(eq.band_level(3), Ok(1_500));
        assert_eq!(
            eq.set_band_level(BAND_COUNT, 0),
            Err(DspError::InvalidBand {
                index: BAND_COUNT,
                count: BAND_COUNT
            })
        );
    }

    #[test]
    fn telescoping_shelves_reproduce_band_levels() {
        let mut eq = Equalizer::new(48_000);
        eq.set_enabled(true);
        eq.set_band_levels(&[0, 600, 600, 600, 0, 0, 0, 0, -600, -600, -600])
            .expect("valid levels");
        let low = response_at(&eq, 40.0);
        let mid = response_at(&eq, 1_000.0);
        let high = response_at(&eq, 18_000.0);
        assert!((low - 6.0).abs() < 1.0, "low shelf region at {low} dB");
        assert!(mid.abs() < 1.0, "mid region at {mid} dB");
        assert!((high + 6.0).abs() < 1.0, "high region at {high} dB");
    }

    #[test]
    fn preamp_folds_into_output_gain() {
        let mut eq = Equalizer::new(48_000);
        eq.set_enabled(true);
        eq.set_band_level(PREAMP_BAND, -600).expect("pre-amp exists");
        let mut samples = vec![0.5_f32, -0.5];
        eq.process(&mut samples);
        let expected = 0.5 * millibels_to_gain(-600);
        assert!((samples[0] - expected).abs() < 1e-6);
        assert!((samples[1] + expected).abs() < 1e-6);
    }

    #[test]
    fn bass_boost_only_applies_when_enabled() {
        let mut eq = Equalizer::new(48_000);
        eq.set_bass_boost_strength(1_000);
        assert!(eq.is_identity());
        eq.set_bass_boost_enabled(true);
        assert_eq!(eq.stages[BASS_BOOST_BAND].gain_mb, 1_500);
        let low = response_at(&eq, 20.0);
        assert!((low - 15.0).abs() < 1.5, "bass boost gave {low} dB");
        eq.set_bass_boost_enabled(false);
        assert!(eq.is_identity());
    }

    #[test]
    fn disabled_equalizer_ignores_levels() {
        let mut eq = Equalizer::new(48_000);
        eq.set_band_level(4, 1_200).expect("band exists");
        assert!(eq.is_identity());
        eq.set_enabled(true);
        assert!(!eq.is_identity());
    }

    #[test]
    fn any_change_clears_every_band_state() {
        let mut eq = Equalizer::new(48_000);
        eq.set_enabled(true);
        eq.set_band_levels(&[0, 900, -300, 600, -900, 300, 0, 0, 0, 0, 0])
            .expect("valid levels");
        let mut block = sine_block(512, 48_000.0, 200.0, 0.8, 0);
        eq.process(&mut block);
        eq.set_band_level(7, 300).expect("band exists");
        for stage in &eq.stages {
            assert_eq!(stage.filter.x1, [0.0; 2]);
            assert_eq!(stage.filter.y1, [0.0; 2]);
        }
    }

    #[test]
    fn boosted_band_stays_bounded_for_ten_seconds() {
        let sample_rate = 48_000.0;
        for band in 1..BAND_COUNT - 1 {
            let mut eq = Equalizer::new(48_000);
            eq.set_enabled(true);
            eq.set_band_level(band, 2_000).expect("band exists");
            let freq = Equalizer::band_frequency(band).unwrap_or(1_000.0);
            let mut peak = 0.0_f32;
            let frames_per_block = 4_800;
            for block in 0..100 {
                let mut samples =
                    sine_block(frames_per_block, sample_rate, freq, 1.0, block * frames_per_block);
                eq.process(&mut samples);
                for sample in &samples {
                    assert!(sample.is_finite(), "band {band} produced a non-finite sample");
                    peak = peak.max(sample.abs());
                }
            }
            assert!(eq.is_finite());
            assert!(peak < 40.0, "band {band} peaked at {peak}");
        }
    }

    #[test]
    fn extreme_opposite_levels_stay_finite() {
        let mut eq = Equalizer::new(44_100);
        eq.set_enabled(true);
        eq.set_band_levels(&[0, 2_000, -2_000, 2_000, -2_000, 2_000, -2_000, 2_000, -2_000, 2_000, -2_000])
            .expect("valid levels");
        let mut samples = sine_block(44_100, 44_100.0, 100.0, 1.0, 0);
        eq.process(&mut samples);
        assert!(samples.iter().all(|s| s.is_finite() && s.abs() < 1_000.0));
    }

    #[test]
    fn low_pass_attenuates_high_frequencies() {
        let mut filter = BiquadFilter::new();
        filter.set_low_pass(48_000.0, 700.0, 0.707);
        let mut samples = sine_block(4_800, 48_000.0, 10_000.0, 1.0, 0);
        filter.process_interleaved(&mut samples);
        let tail_peak = samples[4_000..].iter().fold(0.0_f32, |acc, s| acc.max(s.abs()));
        assert!(tail_peak < 0.05, "10 kHz passed at {tail_peak}");
    }
}
