//! Spectrum bucketing and byte framing for Bluetooth visualizer devices.
//!
//! Frame layout: `SOH, payload type, len_lo << 1, len_hi << 1, payload..., EOT`
//! where `len` is the stuffed payload length split into 7-bit halves. Payload
//! bytes equal to `SOH` or `ESC` are sent as `ESC, byte ^ 1`.

use super::analyzer::SPECTRUM_BINS;
use crate::error::{DspError, DspResult};

pub const SOH: u8 = 0x01;
pub const EOT: u8 = 0x04;
pub const ESC: u8 = 0x1B;
/// Header, fully escaped 256-bin payload and trailer.
pub const MAX_FRAME_LEN: usize = 4 + SPECTRUM_BINS * 2 + 1;
/// Spread of the logarithmic bucket edges, in octaves.
const LOG_SPREAD: f64 = 8.0;
/// Bucket counts up to this one use the bucket maximum; larger ones average.
const MAX_POOLING_LIMIT: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinCount {
    Bins4,
    Bins8,
    Bins16,
    Bins32,
    Bins64,
    Bins128,
    Bins256,
}

impl BinCount {
    pub const ALL: [BinCount; 7] = [
        BinCount::Bins4,
        BinCount::Bins8,
        BinCount::Bins16,
        BinCount::Bins32,
        BinCount::Bins64,
        BinCount::Bins128,
        BinCount::Bins256,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn bins(self) -> usize {
        4 << self.index()
    }

    /// 0x20 for 4 bins through 0x26 for 256 bins.
    pub fn payload_type(self) -> u8 {
        0x20 + self.index() as u8
    }

    pub fn from_payload_type(payload_type: u8) -> Option<Self> {
        payload_type
            .checked_sub(0x20)
            .and_then(|index| Self::ALL.get(index as usize))
            .copied()
    }

    pub fn from_bins(bins: usize) -> Option<Self> {
        Self::ALL.into_iter().find(|count| count.bins() == bins)
    }
}

/// Bucket boundaries over the 256 spectrum bins. `edges[k]..edges[k + 1]` is
/// bucket `k`; every bucket is non-empty and the last edge is 256.
pub fn bucket_edges(count: BinCount) -> Vec<usize> {
    let buckets = count.bins();
    let denominator = 2.0_f64.powf(LOG_SPREAD) - 1.0;
    let mut edges = Vec::with_capacity(buckets + 1);
    edges.push(0);
    for k in 1..buckets {
        let fraction = (2.0_f64.powf(k as f64 * LOG_SPREAD / buckets as f64) - 1.0) / denominator;
        let ideal = (SPECTRUM_BINS as f64 * fraction).round() as usize;
        let previous = edges[k - 1];
        edges.push(ideal.max(previous + 1).min(SPECTRUM_BINS - (buckets - k)));
    }
    edges.push(SPECTRUM_BINS);
    edges
}

/// Pools processed spectrum bins into buckets and frames them for transmission.
/// All buffers are preallocated; encoding never allocates.
pub struct SpectrumFramer {
    edges: Vec<Vec<usize>>,
    buckets: [u8; SPECTRUM_BINS],
    frame: [u8; MAX_FRAME_LEN],
}

impl SpectrumFramer {
    pub fn new() -> Self {
        Self {
            edges: BinCount::ALL.iter().map(|count| bucket_edges(*count)).collect(),
            buckets: [0; SPECTRUM_BINS],
            frame: [0; MAX_FRAME_LEN],
        }
    }

    pub fn edges(&self, count: BinCount) -> &[usize] {
        &self.edges[count.index()]
    }

    pub fn bucket(&mut self, count: BinCount, processed: &[u8; SPECTRUM_BINS]) -> &[u8] {
        let max_pooling = count.bins() <= MAX_POOLING_LIMIT;
        let edges = &self.edges[count.index()];
        for (slot, range) in self.buckets.iter_mut().zip(edges.windows(2)) {
            let bins = &processed[range[0]..range[1]];
            *slot = if max_pooling {
                bins.iter().copied().max().unwrap_or(0)
            } else {
                let sum: u32 = bins.iter().map(|&b| b as u32).sum();
                let len = bins.len() as u32;
                ((sum + len / 2) / len.max(1)) as u8
            };
        }
        &self.buckets[..count.bins()]
    }

    /// Buckets `processed` and returns the complete frame.
    pub fn encode(&mut self, count: BinCount, processed: &[u8; SPECTRUM_BINS]) -> &[u8] {
        self.bucket(count, processed);

        self.frame[0] = SOH;
        self.frame[1] = count.payload_type();
        let mut pos = 4;
        for &value in &self.buckets[..count.bins()] {
            if value == SOH || value == ESC {
                self.frame[pos] = ESC;
                self.frame[pos + 1] = value ^ 1;
                pos += 2;
            } else {
                self.frame[pos] = value;
                pos += 1;
            }
        }
        let len = pos - 4;
        self.frame[2] = ((len & 0x7F) << 1) as u8;
        self.frame[3] = (((len >> 7) & 0x7F) << 1) as u8;
        self.frame[pos] = EOT;
        &self.frame[..=pos]
    }
}

impl Default for SpectrumFramer {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses one frame back into its bucket count and bucket values.
pub fn decode_frame(frame: &[u8]) -> DspResult<(BinCount, Vec<u8>)> {
    if frame.len() < 5 {
        return Err(DspError::MalformedFrame("frame too short"));
    }
    if frame[0] != SOH {
        return Err(DspError::MalformedFrame("missing start of header"));
    }
    let count = BinCount::from_payload_type(frame[1])
        .ok_or(DspError::MalformedFrame("unknown payload type"))?;
    if frame[2] & 1 != 0 || frame[3] & 1 != 0 {
        return Err(DspError::MalformedFrame("length bytes must be even"));
    }
    let len = (frame[2] >> 1) as usize | ((frame[3] >> 1) as usize) << 7;
    if frame.len() != len + 5 {
        return Err(DspError::MalformedFrame("length does not match frame size"));
    }
    if frame[frame.len() - 1] != EOT {
        return Err(DspError::MalformedFrame("missing end of transmission"));
    }

    let mut values = Vec::with_capacity(count.bins());
    let mut payload = frame[4..frame.len() - 1].iter();
    while let Some(&byte) = payload.next() {
        match byte {
            ESC => {
                let escaped = payload
                    .next()
                    .map(|b| b ^ 1)
                    .filter(|b| *b == SOH || *b == ESC)
                    .ok_or(DspError::MalformedFrame("invalid escape sequence"))?;
                values.push(escaped);
            }
            SOH => return Err(DspError::MalformedFrame("unescaped start of header")),
            _ => values.push(byte),
        }
    }
    if values.len() != count.bins() {
        return Err(DspError::MalformedFrame("bucket count does not match payload type"));
    }
    Ok((count, values))
}
