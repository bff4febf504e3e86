//! Output buffer queue between the pipeline and the audio device.
//!
//! The pipeline thread owns the [`QueueWriter`]; the device callback owns the
//! [`QueuePlayer`]. Completed buffers only advance read-side counters, and the
//! writer only advances write-side counters, so the two sides never lock.

use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc,
};

use log::{info, trace, warn};
use ringbuf::{
    traits::{Consumer as _, Observer as _, Producer as _, Split},
    HeapCons, HeapProd, HeapRb,
};

use crate::error::{DspError, DspResult};

/// Buffers that must stay empty before another one may be enqueued.
pub const MIN_EMPTY_BUFFERS: u32 = 2;
/// One buffer in flight plus the reserved empty ones.
pub const MIN_BUFFER_COUNT: u32 = MIN_EMPTY_BUFFERS + 1;

struct QueueCounters {
    buffer_count: u32,
    buffer_size_in_frames: u32,
    enqueued_buffers: AtomicU32,
    played_buffers: AtomicU32,
    committed_frames: AtomicU32,
    head_position_in_frames: AtomicU64,
}

impl QueueCounters {
    fn in_flight(&self) -> u32 {
        let played = self.played_buffers.load(Ordering::Acquire);
        self.enqueued_buffers
            .load(Ordering::Acquire)
            .wrapping_sub(played)
    }
}

/// Read-only view of the queue counters, shareable with any thread.
#[derive(Clone)]
pub struct QueueStatus {
    counters: Arc<QueueCounters>,
}

impl QueueStatus {
    /// Frames played or flushed since creation. Matches the count of frames
    /// written, less those still queued.
    pub fn head_position_in_frames(&self) -> u64 {
        self.counters.head_position_in_frames.load(Ordering::Acquire)
    }

    /// Frames enqueued but not yet played.
    pub fn committed_frames(&self) -> u32 {
        self.counters.committed_frames.load(Ordering::Acquire)
    }

    pub fn buffers_in_flight(&self) -> u32 {
        self.counters.in_flight()
    }

    pub fn empty_buffers(&self) -> u32 {
        self.counters
            .buffer_count
            .saturating_sub(self.counters.in_flight())
    }

    pub fn played_buffers(&self) -> u32 {
        self.counters.played_buffers.load(Ordering::Acquire)
    }

    pub fn buffer_count(&self) -> u32 {
        self.counters.buffer_count
    }

    pub fn buffer_size_in_frames(&self) -> u32 {
        self.counters.buffer_size_in_frames
    }
}

pub struct QueueWriter {
    samples: HeapProd<i16>,
    lengths: HeapProd<u32>,
    frames_per_buffer: u32,
    counters: Arc<QueueCounters>,
}

pub struct QueuePlayer {
    samples: HeapCons<i16>,
    lengths: HeapCons<u32>,
    counters: Arc<QueueCounters>,
}

/// Creates a queue of `buffer_count` buffers sharing `buffer_size_in_frames`
/// stereo frames of storage.
pub fn output_queue(
    buffer_count: u32,
    buffer_size_in_frames: u32,
) -> DspResult<(QueueWriter, QueuePlayer)> {
    if buffer_count < MIN_BUFFER_COUNT {
        return Err(DspError::InvalidConfig(format!(
            "buffer count {buffer_count} is below the minimum of {MIN_BUFFER_COUNT}"
        )));
    }
    if buffer_size_in_frames < buffer_count {
        return Err(DspError::InvalidConfig(format!(
            "buffer size {buffer_size_in_frames} frames cannot be split into {buffer_count} buffers"
        )));
    }

    let sample_capacity = buffer_size_in_frames as usize * 2;
    let (sample_producer, sample_consumer) = HeapRb::<i16>::try_new(sample_capacity)
        .map_err(|_| DspError::OutOfMemory("output queue"))?
        .split();
    let (length_producer, length_consumer) = HeapRb::<u32>::new(buffer_count as usize).split();
    let counters = Arc::new(QueueCounters {
        buffer_count,
        buffer_size_in_frames,
        enqueued_buffers: AtomicU32::new(0),
        played_buffers: AtomicU32::new(0),
        committed_frames: AtomicU32::new(0),
        head_position_in_frames: AtomicU64::new(0),
    });

    info!(
        "Output queue created: {} buffers, {} frames total ({} per buffer)",
        buffer_count,
        buffer_size_in_frames,
        buffer_size_in_frames / buffer_count
    );

    Ok((
        QueueWriter {
            samples: sample_producer,
            lengths: length_producer,
            frames_per_buffer: buffer_size_in_frames / buffer_count,
            counters: Arc::clone(&counters),
        },
        QueuePlayer {
            samples: sample_consumer,
            lengths: length_consumer,
            counters,
        },
    ))
}

fn invariant_violated(what: &str) {
    if cfg!(debug_assertions) {
        panic!("output queue invariant violated: {what}");
    }
    warn!("Output queue invariant violated: {what}");
}

impl QueueWriter {
    pub fn frames_per_buffer(&self) -> u32 {
        self.frames_per_buffer
    }

    /// Frames the next write may enqueue. Zero when fewer than two buffers are
    /// empty or when the counters are inconsistent.
    pub fn available_frames(&self) -> usize {
        let counters = &self.counters;
        let in_flight = counters.in_flight();
        if in_flight > counters.buffer_count {
            invariant_violated("more buffers in flight than exist");
            return 0;
        }
        if counters.buffer_count - in_flight < MIN_EMPTY_BUFFERS {
            return 0;
        }

        let committed = counters.committed_frames.load(Ordering::Acquire);
        if committed > counters.buffer_size_in_frames {
            invariant_violated("committed frames exceed the buffer size");
            return 0;
        }
        let empty_frames = counters.buffer_size_in_frames - committed;
        empty_frames.min(self.frames_per_buffer) as usize
    }

    /// Enqueues interleaved stereo frames as one buffer. Returns the frames
    /// accepted, 0 under backpressure.
    pub fn write(&mut self, stereo: &[i16]) -> usize {
        let frames = (stereo.len() / 2).min(self.available_frames());
        if frames == 0 {
            trace!("Output queue full; write deferred");
            return 0;
        }

        let pushed = self.samples.push_slice(&stereo[..frames * 2]);
        if pushed != frames * 2 {
            invariant_violated("sample ring shorter than committed frames");
        }
        let frames = pushed / 2;
        self.counters
            .committed_frames
            .fetch_add(frames as u32, Ordering::AcqRel);
        self.counters.enqueued_buffers.fetch_add(1, Ordering::AcqRel);
        // The length push publishes the buffer; its counters must already be raised.
        if self.lengths.try_push(frames as u32).is_err() {
            invariant_violated("buffer length ring full");
            self.counters
                .committed_frames
                .fetch_sub(frames as u32, Ordering::AcqRel);
            self.counters.enqueued_buffers.fetch_sub(1, Ordering::AcqRel);
            return 0;
        }
        frames
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            counters: Arc::clone(&self.counters),
        }
    }
}

impl QueuePlayer {
    /// Plays the oldest buffer into `out` and completes it. Samples that do not
    /// fit in `out` are dropped. Returns the frames completed, 0 when idle.
    pub fn play_next(&mut self, out: &mut [i16]) -> usize {
        let Some(frames) = self.lengths.try_pop() else {
            return 0;
        };
        let samples = frames as usize * 2;
        let copy_len = samples.min(out.len());
        let copied = self.samples.pop_slice(&mut out[..copy_len]);
        self.samples.skip(samples - copied);
        self.complete(frames);
        frames as usize
    }

    /// Drops every queued buffer. The head moves past the dropped frames so it
    /// stays on the same timeline as everything written before it.
    pub fn flush(&mut self) -> usize {
        let mut dropped = 0;
        while let Some(frames) = self.lengths.try_pop() {
            self.samples.skip(frames as usize * 2);
            self.complete(frames);
            dropped += frames as usize;
        }
        dropped
    }

    pub fn has_pending(&self) -> bool {
        !self.lengths.is_empty()
    }

    fn complete(&self, frames: u32) {
        let counters = &self.counters;
        counters
            .head_position_in_frames
            .fetch_add(frames as u64, Ordering::AcqRel);
        counters.committed_frames.fetch_sub(frames, Ordering::AcqRel);
        counters.played_buffers.fetch_add(1, Ordering::AcqRel);
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            counters: Arc::clone(&self.counters),
        }
    }
}
