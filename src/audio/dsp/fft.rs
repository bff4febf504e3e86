use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::error::{try_zeroed, DspError, DspResult};

/// In-place real FFT using the packed layout:
/// `a[0] = Re X[0]`, `a[1] = Re X[n/2]`, `a[2k] = Re X[k]`, `a[2k+1] = -Im X[k]`.
///
/// `inverse` returns half the plain inverse sum, so scaling its output by
/// `2 / n` recovers the original signal.
pub struct RealFft {
    len: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl RealFft {
    /// Plans both directions and allocates every working buffer up front.
    pub fn new(len: usize) -> DspResult<Self> {
        if len < 4 || !len.is_power_of_two() {
            return Err(DspError::InvalidBuffer("real FFT length must be a power of two >= 4"));
        }
        let mut planner = FftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(len);
        let inverse = planner.plan_fft_inverse(len);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());
        Ok(Self {
            len,
            forward,
            inverse,
            buffer: try_zeroed(len, "FFT buffer")?,
            scratch: try_zeroed(scratch_len, "FFT scratch")?,
        })
    }

    pub fn size(&self) -> usize {
        self.len
    }

    pub fn forward(&mut self, data: &mut [f32]) -> DspResult<()> {
        self.check_len(data)?;
        for (slot, &sample) in self.buffer.iter_mut().zip(data.iter()) {
            *slot = Complex::new(sample, 0.0);
        }
        self.forward
            .process_with_scratch(&mut self.buffer, &mut self.scratch);

        let half = self.len / 2;
        data[0] = self.buffer[0].re;
        data[1] = self.buffer[half].re;
        for k in 1..half {
            data[2 * k] = self.buffer[k].re;
            data[2 * k + 1] = -self.buffer[k].im;
        }
        Ok(())
    }

    pub fn inverse(&mut self, data: &mut [f32]) -> DspResult<()> {
        self.check_len(data)?;
        let n = self.len;
        let half = n / 2;
        self.buffer[0] = Complex::new(data[0], 0.0);
        self.buffer[half] = Complex::new(data[1], 0.0);
        for k in 1..half {
            let bin = Complex::new(data[2 * k], -data[2 * k + 1]);
            self.buffer[k] = bin;
            self.buffer[n - k] = bin.conj();
        }
        self.inverse
            .process_with_scratch(&mut self.buffer, &mut self.scratch);

        for (sample, bin) in data.iter_mut().zip(self.buffer.iter()) {
            *sample = bin.re * 0.5;
        }
        Ok(())
    }

    fn check_len(&self, data: &[f32]) -> DspResult<()> {
        if data.len() == self.len {
            Ok(())
        } else {
            Err(DspError::InvalidBuffer("real FFT input length mismatch"))
        }
    }
}
