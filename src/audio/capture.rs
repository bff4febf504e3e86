use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use log::info;

use crate::error::{DspError, DspResult};

/// Samples handed to the visualizer per request.
pub const WAVEFORM_LEN: usize = 1024;
const SILENCE: u8 = 0x80;

/// Circular capture of the post-effects output as unsigned 8-bit mono.
///
/// The audio thread is the only writer; the visualizer thread reads without
/// locking and tolerates seeing a partially updated window.
pub struct VisualizerCapture {
    buffer: Box<[AtomicU8]>,
    write_offset: AtomicUsize,
}

impl VisualizerCapture {
    pub fn new(size_in_frames: usize) -> DspResult<Self> {
        Self::starting_at(size_in_frames, 0)
    }

    /// Creates a capture whose first write lands at frame `position_in_frames`
    /// of the playback timeline.
    pub fn starting_at(size_in_frames: usize, position_in_frames: u64) -> DspResult<Self> {
        if size_in_frames < WAVEFORM_LEN {
            return Err(DspError::InvalidBuffer("visualizer buffer must hold at least 1024 frames"));
        }
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(size_in_frames)
            .map_err(|_| DspError::OutOfMemory("visualizer buffer"))?;
        buffer.extend((0..size_in_frames).map(|_| AtomicU8::new(SILENCE)));
        info!("Visualizer capture allocated: {} frames", size_in_frames);
        Ok(Self {
            buffer: buffer.into_boxed_slice(),
            write_offset: AtomicUsize::new((position_in_frames % size_in_frames as u64) as usize),
        })
    }

    pub fn size_in_frames(&self) -> usize {
        self.buffer.len()
    }

    pub fn write_offset(&self) -> usize {
        self.write_offset.load(Ordering::Acquire)
    }

    /// Appends interleaved stereo frames as `((L + R) >> 9) ^ 0x80`.
    pub fn write(&self, stereo: &[i16]) {
        let size = self.buffer.len();
        let mut offset = self.write_offset.load(Ordering::Relaxed);
        for frame in stereo.chunks_exact(2) {
            let mixed = (frame[0] as i32 + frame[1] as i32) >> 9;
            self.buffer[offset].store((mixed as u8) ^ SILENCE, Ordering::Relaxed);
            offset += 1;
            if offset == size {
                offset = 0;
            }
        }
        self.write_offset.store(offset, Ordering::Release);
    }

    /// Copies the 1024 frames ending at `head_position_in_frames`, which must be
    /// a frame count expressed on the same timeline as the writes.
    pub fn waveform(&self, head_position_in_frames: u64, out: &mut [u8; WAVEFORM_LEN]) {
        let size = self.buffer.len();
        let end = (head_position_in_frames % size as u64) as usize;
        let start = (end + size - WAVEFORM_LEN) % size;

        if start < end {
            for (dst, src) in out.iter_mut().zip(&self.buffer[start..end]) {
                *dst = src.load(Ordering::Relaxed);
            }
        } else {
            let (first, second) = out.split_at_mut(size - start);
            for (dst, src) in first.iter_mut().zip(&self.buffer[start..]) {
                *dst = src.load(Ordering::Relaxed);
            }
            for (dst, src) in second.iter_mut().zip(&self.buffer[..end]) {
                *dst = src.load(Ordering::Relaxed);
            }
        }
    }

    pub fn clear(&self) {
        for slot in self.buffer.iter() {
            slot.store(SILENCE, Ordering::Relaxed);
        }
        self.write_offset.store(0, Ordering::Release);
    }
}
