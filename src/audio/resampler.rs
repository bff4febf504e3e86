use log::info;

use crate::error::{try_zeroed, DspError, DspResult};

/// Number of history frames the Lagrange polynomial is fitted through.
pub const LAGRANGE_TAPS: usize = 10;
/// Interpolation happens between taps 4 and 5, the middle of the window.
const CENTER_TAP: usize = 4;
const COEFF_SHIFT: u32 = 15;
const COEFF_ONE: i32 = 1 << COEFF_SHIFT;

pub const MIN_SAMPLE_RATE: u32 = 8_000;
pub const MAX_SAMPLE_RATE: u32 = 192_000;

const SMALL_PRIMES: [u32; 6] = [2, 3, 5, 7, 11, 13];

/// How far one `resample` call got through its source and destination buffers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResampleProgress {
    pub frames_produced: usize,
    pub frames_consumed: usize,
}

/// Streaming polyphase Lagrange resampler from mono/stereo `i16` to stereo `i16`.
///
/// The call is resumable: frames that were not consumed must be passed again on
/// the next call, and the history window carries over so output is continuous
/// across call boundaries.
pub struct Resampler {
    src_rate: u32,
    dst_rate: u32,
    channels: u16,
    fact_src: u32,
    fact_dst: u32,
    coeffs: Vec<[i32; LAGRANGE_TAPS]>,
    /// Source frames to ingest after producing the output at each phase.
    advance: Vec<u32>,
    phase: usize,
    pending: u32,
    left: [i32; LAGRANGE_TAPS],
    right: [i32; LAGRANGE_TAPS],
}

impl Resampler {
    pub fn new(src_rate: u32, dst_rate: u32, channels: u16) -> DspResult<Self> {
        let mut resampler = Self {
            src_rate,
            dst_rate,
            channels,
            fact_src: 1,
            fact_dst: 1,
            coeffs: Vec::new(),
            advance: Vec::new(),
            phase: 0,
            pending: 1,
            left: [0; LAGRANGE_TAPS],
            right: [0; LAGRANGE_TAPS],
        };
        resampler.reconfigure(src_rate, dst_rate, channels)?;
        Ok(resampler)
    }

    /// Regenerates the coefficient table for new rates and discards all history.
    pub fn reconfigure(&mut self, src_rate: u32, dst_rate: u32, channels: u16) -> DspResult<()> {
        validate_rate(src_rate)?;
        validate_rate(dst_rate)?;
        if channels != 1 && channels != 2 {
            return Err(DspError::InvalidChannelCount(channels));
        }

        let (fact_src, fact_dst) = reduce_ratio(src_rate, dst_rate);
        let (coeffs, advance) = if src_rate == dst_rate {
            (Vec::new(), Vec::new())
        } else {
            build_tables(fact_src, fact_dst)?
        };

        self.src_rate = src_rate;
        self.dst_rate = dst_rate;
        self.channels = channels;
        self.fact_src = fact_src;
        self.fact_dst = fact_dst;
        self.coeffs = coeffs;
        self.advance = advance;
        self.reset();

        info!(
            "Resampler configured: {src_rate} Hz x{channels} -> {dst_rate} Hz stereo, ratio {fact_src}/{fact_dst}, {} coefficients",
            self.coefficient_len()
        );
        Ok(())
    }

    /// Clears the history window and rewinds the phase (seek / flush).
    pub fn reset(&mut self) {
        self.left = [0; LAGRANGE_TAPS];
        self.right = [0; LAGRANGE_TAPS];
        self.phase = 0;
        self.pending = 1;
    }

    pub fn is_passthrough(&self) -> bool {
        self.src_rate == self.dst_rate
    }

    pub fn src_rate(&self) -> u32 {
        self.src_rate
    }

    pub fn dst_rate(&self) -> u32 {
        self.dst_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Reduced `(source, destination)` ratio terms.
    pub fn ratio(&self) -> (u32, u32) {
        (self.fact_src, self.fact_dst)
    }

    pub fn phase(&self) -> usize {
        self.phase
    }

    pub fn coefficient_len(&self) -> usize {
        self.coeffs.len() * LAGRANGE_TAPS
    }

    /// Resamples interleaved `src` (mono or stereo, per configuration) into
    /// interleaved stereo `dst`.
    ///
    /// Stops when either the source is exhausted or `dst` is full, and reports
    /// exactly how many source frames were consumed.
    pub fn resample(&mut self, src: &[i16], dst: &mut [i16]) -> ResampleProgress {
        let channels = self.channels as usize;
        let src_frames = src.len() / channels;
        let dst_frames = dst.len() / 2;

        if self.is_passthrough() {
            return copy_frames(src, src_frames, channels, dst, dst_frames);
        }

        let stereo = channels == 2;
        let mut consumed = 0;
        let mut produced = 0;

        while produced < dst_frames {
            while self.pending > 0 {
                if consumed == src_frames {
                    return ResampleProgress {
                        frames_produced: produced,
                        frames_consumed: consumed,
                    };
                }
                let base = consumed * channels;
                push_frame(&mut self.left, src[base] as i32);
                if stereo {
                    push_frame(&mut self.right, src[base + 1] as i32);
                }
                consumed += 1;
                self.pending -= 1;
            }

            let coeffs = &self.coeffs[self.phase];
            let left = saturate(dot(&self.left, coeffs));
            let right = if stereo {
                saturate(dot(&self.right, coeffs))
            } else {
                left
            };
            dst[produced * 2] = left;
            dst[produced * 2 + 1] = right;
            produced += 1;

            self.pending = self.advance[self.phase];
            self.phase += 1;
            if self.phase == self.coeffs.len() {
                self.phase = 0;
            }
        }

        ResampleProgress {
            frames_produced: produced,
            frames_consumed: consumed,
        }
    }
}

pub(crate) fn validate_rate(rate: u32) -> DspResult<()> {
    if (MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&rate) {
        Ok(())
    } else {
        Err(DspError::InvalidSampleRate(rate))
    }
}

/// Divides out the small prime factors both rates share.
pub fn reduce_ratio(src_rate: u32, dst_rate: u32) -> (u32, u32) {
    let mut src = src_rate.max(1);
    let mut dst = dst_rate.max(1);
    for prime in SMALL_PRIMES {
        while src % prime == 0 && dst % prime == 0 {
            src /= prime;
            dst /= prime;
        }
    }
    (src, dst)
}

fn build_tables(fact_src: u32, fact_dst: u32) -> DspResult<(Vec<[i32; LAGRANGE_TAPS]>, Vec<u32>)> {
    let len = fact_dst as usize;
    let mut coeffs = try_zeroed::<[i32; LAGRANGE_TAPS]>(len, "resampler coefficients")?;
    let mut advance = try_zeroed::<u32>(len, "resampler advance table")?;

    for phase in 0..len {
        let position = phase as u64 * fact_src as u64;
        let next = (phase as u64 + 1) * fact_src as u64;
        let fraction = (position % fact_dst as u64) as f64 / fact_dst as f64;
        coeffs[phase] = lagrange_coefficients(fraction);
        advance[phase] = (next / fact_dst as u64 - position / fact_dst as u64) as u32;
    }
    Ok((coeffs, advance))
}

/// Fixed-point Lagrange basis weights for a point `fraction` past the center tap.
/// Rounding error is folded into the largest weight so the taps sum to exactly
/// unity and DC passes unchanged.
fn lagrange_coefficients(fraction: f64) -> [i32; LAGRANGE_TAPS] {
    let x = CENTER_TAP as f64 + fraction;
    let mut coeffs = [0_i32; LAGRANGE_TAPS];
    let mut total = 0_i32;
    for (j, coeff) in coeffs.iter_mut().enumerate() {
        let mut basis = 1.0_f64;
        for m in 0..LAGRANGE_TAPS {
            if m != j {
                basis *= (x - m as f64) / (j as f64 - m as f64);
            }
        }
        *coeff = (basis * COEFF_ONE as f64).round() as i32;
        total += *coeff;
    }

    let largest = (0..LAGRANGE_TAPS)
        .max_by_key(|&j| coeffs[j].abs())
        .unwrap_or(CENTER_TAP);
    coeffs[largest] += COEFF_ONE - total;
    coeffs
}

#[inline]
fn push_frame(window: &mut [i32; LAGRANGE_TAPS], sample: i32) {
    window.copy_within(1.., 0);
    window[LAGRANGE_TAPS - 1] = sample;
}

#[inline]
fn dot(window: &[i32; LAGRANGE_TAPS], coeffs: &[i32; LAGRANGE_TAPS]) -> i64 {
    window
        .iter()
        .zip(coeffs.iter())
        .map(|(sample, coeff)| *sample as i64 * *coeff as i64)
        .sum()
}

#[inline]
fn saturate(accumulator: i64) -> i16 {
    let rounded = (accumulator + (1 << (COEFF_SHIFT - 1))) >> COEFF_SHIFT;
    rounded.clamp(i16::MIN as i64, i16::MAX as i64) as i16
}

fn copy_frames(
    src: &[i16],
    src_frames: usize,
    channels: usize,
    dst: &mut [i16],
    dst_frames: usize,
) -> ResampleProgress {
    let frames = src_frames.min(dst_frames);
    if channels == 2 {
        dst[..frames * 2].copy_from_slice(&src[..frames * 2]);
    } else {
        for (out, sample) in dst[..frames * 2].chunks_exact_mut(2).zip(&src[..frames]) {
            out[0] = *sample;
            out[1] = *sample;
        }
    }
    ResampleProgress {
        frames_produced: frames,
        frames_consumed: frames,
    }
}
