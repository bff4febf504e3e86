//! Real-time playback DSP: resampling, equalizer and bass boost, virtualizer,
//! automatic gain control, output queue bookkeeping, visualizer capture and
//! spectrum analysis with Bluetooth framing.

pub mod audio;
pub mod error;

pub use audio::analyzer::{MultiplierPreset, SpectrumAnalyzer, SpectrumSpeed};
pub use audio::bluetooth::{decode_frame, BinCount, SpectrumFramer};
pub use audio::capture::VisualizerCapture;
pub use audio::config::{EffectsConfig, LevelLimit, PipelineConfig, SpectrumConfig};
pub use audio::engine::{AudioPipeline, WriteStatus};
pub use audio::output::{QueuePlayer, QueueStatus};
pub use error::{DspError, DspResult};
