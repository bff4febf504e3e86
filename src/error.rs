//! Error types for the playback DSP core

use thiserror::Error;

/// Errors returned by pipeline construction, configuration and framing.
///
/// Output queue backpressure is not an error: a full queue is reported as zero
/// frames accepted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DspError {
    /// Buffer is too short or not a whole number of frames
    #[error("Invalid buffer: {0}")]
    InvalidBuffer(&'static str),

    /// Sample rate outside the supported range
    #[error("Unsupported sample rate: {0} Hz")]
    InvalidSampleRate(u32),

    /// Only mono and stereo sources are supported
    #[error("Unsupported channel count: {0}")]
    InvalidChannelCount(u16),

    /// Equalizer band index out of range
    #[error("Band index out of range: {index} (band count {count})")]
    InvalidBand { index: usize, count: usize },

    /// Configuration could not be parsed or failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A working buffer could not be allocated
    #[error("Out of memory allocating {0}")]
    OutOfMemory(&'static str),

    /// Bluetooth spectrum frame could not be decoded
    #[error("Malformed spectrum frame: {0}")]
    MalformedFrame(&'static str),
}

impl DspError {
    /// Negative sentinel code for callers bridging to C-style return values.
    pub fn code(&self) -> i32 {
        match self {
            DspError::InvalidBuffer(_) => -1,
            DspError::InvalidSampleRate(_) => -2,
            DspError::InvalidChannelCount(_) => -3,
            DspError::InvalidBand { .. } => -4,
            DspError::InvalidConfig(_) => -5,
            DspError::OutOfMemory(_) => -6,
            DspError::MalformedFrame(_) => -7,
        }
    }
}

/// Result type for DSP operations
pub type DspResult<T> = Result<T, DspError>;

/// Allocates a zeroed vector without aborting on allocation failure.
pub(crate) fn try_zeroed<T: Clone + Default>(len: usize, what: &'static str) -> DspResult<Vec<T>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|_| DspError::OutOfMemory(what))?;
    buffer.resize(len, T::default());
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::DspError;

    #[test]
    fn codes_are_negative_and_distinct() {
        let errors = [
            DspError::InvalidBuffer("x"),
            DspError::InvalidSampleRate(1),
            DspError::InvalidChannelCount(3),
            DspError::InvalidBand { index: 12, count: 11 },
            DspError::InvalidConfig("x".to_string()),
            DspError::OutOfMemory("x"),
            DspError::MalformedFrame("x"),
        ];
        let mut codes: Vec<i32> = errors.iter().map(DspError::code).collect();
        assert!(codes.iter().all(|code| *code < 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn band_error_reports_band_count() {
        let err = DspError::InvalidBand { index: 12, count: 11 };
        assert_eq!(err.to_string(), "Band index out of range: 12 (band count 11)");
    }
}
