use std::sync::Arc;

use log::{info, trace, warn};

use super::analyzer::SpectrumAnalyzer;
use super::capture::VisualizerCapture;
use super::config::{LevelLimit, PipelineConfig};
use super::dsp::chain::EffectsChain;
use super::dsp::filters::BAND_COUNT;
use super::output::{output_queue, QueuePlayer, QueueStatus, QueueWriter};
use super::resampler::Resampler;
use crate::error::{try_zeroed, DspError, DspResult};

/// Outcome of one [`AudioPipeline::write`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteStatus {
    /// Source frames taken from the caller's buffer.
    pub frames_consumed: usize,
    /// Output frames enqueued for the device.
    pub frames_written: usize,
}

/// Decoded PCM in, device-rate stereo buffers out.
///
/// Each write resamples at most one output buffer's worth of audio, runs the
/// effects chain over it, enqueues it and mirrors it into the visualizer
/// capture. A full queue is reported as zero frames, never as an error.
pub struct AudioPipeline {
    config: PipelineConfig,
    resampler: Resampler,
    effects: EffectsChain,
    queue: QueueWriter,
    capture: Option<Arc<VisualizerCapture>>,
    frames_enqueued: u64,
    block: Vec<i16>,
}

impl AudioPipeline {
    /// Builds the pipeline and returns the device-side end of its output queue.
    pub fn new(config: PipelineConfig) -> DspResult<(Self, QueuePlayer)> {
        config.validate()?;

        let frames_per_buffer = config.frames_per_buffer();
        let resampler = Resampler::new(
            config.src_sample_rate,
            config.dst_sample_rate,
            config.src_channels,
        )?;
        let effects = EffectsChain::new(config.dst_sample_rate, frames_per_buffer, &config.effects)?;
        let (queue, player) = output_queue(config.buffer_count, config.buffer_size_in_frames)?;
        let block = try_zeroed(frames_per_buffer * 2, "pipeline block")?;
        let capture = open_capture(config.visualizer_buffer_frames as usize);

        info!(
            "Audio pipeline ready: {} Hz x{} -> {} Hz stereo, {} x {} frame buffers, visualizer {}",
            config.src_sample_rate,
            config.src_channels,
            config.dst_sample_rate,
            config.buffer_count,
            frames_per_buffer,
            if capture.is_some() { "on" } else { "off" }
        );

        Ok((
            Self {
                config,
                resampler,
                effects,
                queue,
                capture,
                frames_enqueued: 0,
                block,
            },
            player,
        ))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Processes as much of `src` (interleaved, source channel count) as fits
    /// in one output buffer.
    pub fn write(&mut self, src: &[i16]) -> DspResult<WriteStatus> {
        let channels = self.config.src_channels as usize;
        if src.len() % channels != 0 {
            return Err(DspError::InvalidBuffer("source is not a whole number of frames"));
        }

        let capacity = self.queue.available_frames().min(self.block.len() / 2);
        if capacity == 0 {
            trace!("Pipeline write deferred: output queue full");
            return Ok(WriteStatus::default());
        }

        let block = &mut self.block[..capacity * 2];
        let progress = self.resampler.resample(src, block);
        let produced = &mut block[..progress.frames_produced * 2];
        if produced.is_empty() {
            return Ok(WriteStatus {
                frames_consumed: progress.frames_consumed,
                frames_written: 0,
            });
        }

        self.effects.process(produced);
        let written = self.queue.write(produced);
        if written != progress.frames_produced {
            warn!(
                "Output queue accepted {} of {} frames",
                written, progress.frames_produced
            );
        }
        if let Some(capture) = &self.capture {
            capture.write(&produced[..written * 2]);
        }
        self.frames_enqueued += written as u64;

        Ok(WriteStatus {
            frames_consumed: progress.frames_consumed,
            frames_written: written,
        })
    }

    /// Switches to a new source and/or device format. History is discarded;
    /// effect settings are kept.
    pub fn reconfigure(&mut self, src_sample_rate: u32, src_channels: u16, dst_sample_rate: u32) -> DspResult<()> {
        let candidate = PipelineConfig {
            src_sample_rate,
            src_channels,
            dst_sample_rate,
            ..self.config.clone()
        };
        candidate.validate()?;
        self.resampler
            .reconfigure(src_sample_rate, dst_sample_rate, src_channels)?;
        self.effects.set_sample_rate(dst_sample_rate);
        self.effects.reset();
        self.config = candidate;
        info!(
            "Audio pipeline reconfigured: {} Hz x{} -> {} Hz stereo, {} equalizer bands",
            src_sample_rate,
            src_channels,
            dst_sample_rate,
            self.effects.equalizer.band_count()
        );
        Ok(())
    }

    /// Clears resampler history, filter state and the gain envelope (seek).
    pub fn reset(&mut self) {
        self.resampler.reset();
        self.effects.reset();
        info!("Audio pipeline reset");
    }

    pub fn set_equalizer_enabled(&mut self, enabled: bool) {
        self.effects.equalizer.set_enabled(enabled);
        self.config.effects.equalizer_enabled = enabled;
    }

    pub fn set_band_level(&mut self, band: usize, level_mb: i32) -> DspResult<()> {
        self.effects.equalizer.set_band_level(band, level_mb)?;
        self.sync_band_levels();
        Ok(())
    }

    pub fn set_band_levels(&mut self, levels_mb: &[i32]) -> DspResult<()> {
        self.effects.equalizer.set_band_levels(levels_mb)?;
        self.sync_band_levels();
        Ok(())
    }

    pub fn band_level(&self, band: usize) -> DspResult<i32> {
        self.effects.equalizer.band_level(band)
    }

    /// Usable equalizer bands (pre-amp included) at the device rate.
    pub fn band_count(&self) -> usize {
        self.effects.equalizer.band_count()
    }

    pub fn set_level_limit(&mut self, limit: LevelLimit) {
        self.effects.equalizer.set_level_limit(limit);
        self.config.effects.level_limit = limit;
        self.sync_band_levels();
    }

    pub fn frequency_response(&self, num_points: usize) -> Vec<(f32, f32)> {
        self.effects.equalizer.frequency_response(num_points)
    }

    pub fn set_bass_boost_enabled(&mut self, enabled: bool) {
        self.effects.equalizer.set_bass_boost_enabled(enabled);
        self.config.effects.bass_boost_enabled = enabled;
    }

    pub fn set_bass_boost_strength(&mut self, strength: u16) {
        self.effects.equalizer.set_bass_boost_strength(strength);
        self.config.effects.bass_boost_strength = self.effects.equalizer.bass_boost_strength();
    }

    pub fn set_virtualizer_enabled(&mut self, enabled: bool) {
        self.effects.virtualizer.set_enabled(enabled);
        self.config.effects.virtualizer_enabled = enabled;
    }

    pub fn set_virtualizer_strength(&mut self, strength: u16) {
        self.effects.virtualizer.set_strength(strength);
        self.config.effects.virtualizer_strength = self.effects.virtualizer.strength();
    }

    pub fn set_agc_enabled(&mut self, enabled: bool) {
        self.effects.gain_clip.set_enabled(enabled);
        self.config.effects.agc_enabled = enabled;
    }

    /// Current automatic gain reduction in millibels.
    pub fn gain_reduction_mb(&self) -> i32 {
        self.effects.gain_clip.gain_reduction_mb()
    }

    /// Replaces the visualizer capture, lined up with the frames already
    /// written. An invalid size leaves the current capture in place; on
    /// allocation failure the visualizer stays disabled.
    pub fn resize_visualizer(&mut self, size_in_frames: usize) -> DspResult<()> {
        let candidate = PipelineConfig {
            visualizer_buffer_frames: u32::try_from(size_in_frames)
                .map_err(|_| DspError::InvalidBuffer("visualizer buffer too large"))?,
            ..self.config.clone()
        };
        candidate.validate()?;

        self.capture = None;
        self.config.visualizer_buffer_frames = 0;
        if size_in_frames == 0 {
            return Ok(());
        }
        let capture = VisualizerCapture::starting_at(size_in_frames, self.frames_enqueued).map_err(|e| {
            warn!("Visualizer disabled: {e}");
            e
        })?;
        self.capture = Some(Arc::new(capture));
        self.config = candidate;
        Ok(())
    }

    /// Shared handle for the visualizer thread, `None` when capture is off.
    pub fn visualizer(&self) -> Option<Arc<VisualizerCapture>> {
        self.capture.clone()
    }

    pub fn spectrum_analyzer(&self) -> DspResult<SpectrumAnalyzer> {
        SpectrumAnalyzer::new(self.config.spectrum.preset, self.config.spectrum.speed)
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.queue.status()
    }

    fn sync_band_levels(&mut self) {
        let levels: Vec<i32> = (0..BAND_COUNT)
            .filter_map(|band| self.effects.equalizer.band_level(band).ok())
            .collect();
        self.config.effects.band_levels_mb = levels;
    }
}

fn open_capture(size_in_frames: usize) -> Option<Arc<VisualizerCapture>> {
    if size_in_frames == 0 {
        return None;
    }
    match VisualizerCapture::new(size_in_frames) {
        Ok(capture) => Some(Arc::new(capture)),
        Err(e) => {
            warn!("Visualizer disabled: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::capture::WAVEFORM_LEN;
    use crate::audio::config::EffectsConfig;

    fn mono_sine(frames: usize, sample_rate: f32, freq: f32, amplitude: f32) -> Vec<i16> {
        (0..frames)
            .map(|i| (amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate).sin()).round() as i16)
            .collect()
    }

    fn narrowband_config() -> PipelineConfig {
        PipelineConfig {
            src_sample_rate: 8_000,
            src_channels: 1,
            dst_sample_rate: 44_100,
            buffer_count: 4,
            buffer_size_in_frames: 32_768,
            visualizer_buffer_frames: 32_768 + WAVEFORM_LEN as u32,
            effects: EffectsConfig {
                bass_boost_enabled: true,
                bass_boost_strength: 500,
                agc_enabled: true,
                ..EffectsConfig::default()
            },
            ..PipelineConfig::default()
        }
    }

    fn passthrough_config() -> PipelineConfig {
        PipelineConfig {
            src_sample_rate: 48_000,
            src_channels: 2,
            dst_sample_rate: 48_000,
            effects: EffectsConfig {
                agc_enabled: false,
                ..EffectsConfig::default()
            },
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn narrowband_block_upsamples_without_gain_reduction() {
        let (mut pipeline, mut player) = AudioPipeline::new(narrowband_config()).expect("pipeline");
        let src = mono_sine(1_024, 8_000.0, 440.0, 8_000.0);

        let status = pipeline.write(&src).expect("write");
        assert_eq!(status.frames_consumed, 1_024);
        let expected = 1_024.0 * 44_100.0 / 8_000.0;
        assert!(
            (status.frames_written as f64 - expected).abs() <= 1.0,
            "wrote {} frames, expected about {expected}",
            status.frames_written
        );
        assert_eq!(pipeline.gain_reduction_mb(), 0);

        let mut out = vec![0_i16; 8_192 * 2];
        assert_eq!(player.play_next(&mut out), status.frames_written);
        for frame in out[..status.frames_written * 2].chunks_exact(2) {
            assert_eq!(frame[0], frame[1], "mono source should stay centered");
        }
    }

    #[test]
    fn boosted_bass_engages_gain_reduction() {
        let (mut pipeline, _player) = AudioPipeline::new(narrowband_config()).expect("pipeline");
        let src = mono_sine(1_024, 8_000.0, 60.0, 24_000.0);
        pipeline.write(&src).expect("write");
        pipeline.write(&src).expect("write");
        assert!(pipeline.gain_reduction_mb() > 0);
    }

    #[test]
    fn passthrough_pipeline_is_bit_exact() {
        let (mut pipeline, mut player) = AudioPipeline::new(passthrough_config()).expect("pipeline");
        let src: Vec<i16> = (0..2_048).map(|i| (i * 31 % 65_536 - 32_768) as i16).collect();

        let status = pipeline.write(&src).expect("write");
        assert_eq!(status.frames_consumed, 1_024);
        assert_eq!(status.frames_written, 1_024);

        let mut out = vec![0_i16; 2_048];
        assert_eq!(player.play_next(&mut out), 1_024);
        assert_eq!(out, src);
    }

    #[test]
    fn full_queue_applies_backpressure() {
        let (mut pipeline, mut player) = AudioPipeline::new(passthrough_config()).expect("pipeline");
        let src = vec![100_i16; 2_048];
        for _ in 0..3 {
            assert_eq!(pipeline.write(&src).expect("write").frames_written, 1_024);
        }
        assert_eq!(pipeline.write(&src).expect("write"), WriteStatus::default());

        let mut out = vec![0_i16; 2_048];
        player.play_next(&mut out);
        assert_eq!(pipeline.queue_status().head_position_in_frames(), 1_024);
        assert_eq!(pipeline.write(&src).expect("write").frames_written, 1_024);
    }

    #[test]
    fn partial_frames_are_rejected() {
        let (mut pipeline, _player) = AudioPipeline::new(passthrough_config()).expect("pipeline");
        assert_eq!(
            pipeline.write(&[1, 2, 3]),
            Err(DspError::InvalidBuffer("source is not a whole number of frames"))
        );
    }

    #[test]
    fn visualizer_sees_what_was_queued() {
        let (mut pipeline, mut player) = AudioPipeline::new(passthrough_config()).expect("pipeline");
        let visualizer = pipeline.visualizer().expect("visualizer enabled");
        let src = vec![12_800_i16; 2_048];
        pipeline.write(&src).expect("write");
        let mut out = vec![0_i16; 2_048];
        player.play_next(&mut out);

        let mut waveform = [0_u8; WAVEFORM_LEN];
        visualizer.waveform(pipeline.queue_status().head_position_in_frames(), &mut waveform);
        // (12800 + 12800) >> 9 = 50
        assert!(waveform.iter().all(|b| *b == 50 ^ 0x80));
    }

    #[test]
    fn setters_keep_config_in_sync() {
        let (mut pipeline, _player) = AudioPipeline::new(passthrough_config()).expect("pipeline");
        pipeline.set_equalizer_enabled(true);
        pipeline.set_band_level(4, 3_000).expect("band exists");
        assert_eq!(pipeline.band_level(4), Ok(2_000));
        assert_eq!(pipeline.config().effects.band_levels_mb[4], 2_000);
        assert_eq!(pipeline.config().effects.band_levels_mb.len(), BAND_COUNT);

        pipeline.set_level_limit(LevelLimit::Db15);
        assert_eq!(pipeline.config().effects.band_levels_mb[4], 1_500);

        pipeline.set_virtualizer_strength(2_000);
        assert_eq!(pipeline.config().effects.virtualizer_strength, 1_000);
        assert!(pipeline.set_band_level(BAND_COUNT, 0).is_err());
    }

    #[test]
    fn reconfigure_validates_before_applying() {
        let (mut pipeline, _player) = AudioPipeline::new(passthrough_config()).expect("pipeline");
        assert_eq!(
            pipeline.reconfigure(1_000, 2, 48_000),
            Err(DspError::InvalidSampleRate(1_000))
        );
        assert_eq!(pipeline.config().src_sample_rate, 48_000);

        pipeline.reconfigure(22_050, 1, 48_000).expect("reconfigure");
        assert_eq!(pipeline.config().src_channels, 1);
        let status = pipeline.write(&vec![0_i16; 441]).expect("write");
        assert_eq!(status.frames_consumed, 441);
    }

    #[test]
    fn disabling_visualizer_drops_handle() {
        let (mut pipeline, _player) = AudioPipeline::new(passthrough_config()).expect("pipeline");
        pipeline.resize_visualizer(0).expect("disable");
        assert!(pipeline.visualizer().is_none());
        assert!(pipeline.resize_visualizer(100).is_err());
        assert!(pipeline.visualizer().is_none());
        pipeline.resize_visualizer(16_384).expect("resize");
        assert_eq!(pipeline.visualizer().map(|v| v.size_in_frames()), Some(16_384));
        assert_eq!(pipeline.config().visualizer_buffer_frames, 16_384);
    }

    #[test]
    fn visualizer_must_outsize_the_queue() {
        let (mut pipeline, _player) = AudioPipeline::new(passthrough_config()).expect("pipeline");
        assert!(matches!(
            pipeline.resize_visualizer(4_096),
            Err(DspError::InvalidConfig(_))
        ));
        assert_eq!(pipeline.visualizer().map(|v| v.size_in_frames()), Some(8_192));
    }

    #[test]
    fn waveform_tracks_playback_after_flush() {
        let (mut pipeline, mut player) = AudioPipeline::new(passthrough_config()).expect("pipeline");
        let visualizer = pipeline.visualizer().expect("visualizer enabled");
        let loud = vec![12_800_i16; 2_048];
        pipeline.write(&loud).expect("write");
        pipeline.write(&loud).expect("write");
        assert_eq!(player.flush(), 2_048);
        pipeline.reset();

        let quiet = vec![-12_800_i16; 2_048];
        pipeline.write(&quiet).expect("write");
        let mut out = vec![0_i16; 2_048];
        assert_eq!(player.play_next(&mut out), 1_024);
        assert_eq!(&out[..2], &[-12_800, -12_800]);

        let mut waveform = [0_u8; WAVEFORM_LEN];
        visualizer.waveform(pipeline.queue_status().head_position_in_frames(), &mut waveform);
        // (-25600 >> 9) = -50
        assert!(waveform.iter().all(|b| *b == (-50_i8 as u8) ^ 0x80));
    }

    #[test]
    fn resized_visualizer_follows_head() {
        let (mut pipeline, mut player) = AudioPipeline::new(passthrough_config()).expect("pipeline");
        let mut out = vec![0_i16; 2_048];
        for _ in 0..5 {
            pipeline.write(&vec![0_i16; 2_048]).expect("write");
            player.play_next(&mut out);
        }
        pipeline.resize_visualizer(9_000).expect("resize");
        let visualizer = pipeline.visualizer().expect("visualizer enabled");

        pipeline.write(&vec![12_800_i16; 2_048]).expect("write");
        player.play_next(&mut out);
        let mut waveform = [0_u8; WAVEFORM_LEN];
        visualizer.waveform(pipeline.queue_status().head_position_in_frames(), &mut waveform);
        assert!(waveform.iter().all(|b| *b == 50 ^ 0x80));
    }
}
