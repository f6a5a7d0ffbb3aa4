//! Waveform math for voice notes: the live intensity strip shown while
//! recording and the rebinned envelopes computed once the clip is decoded.

use std::time::Duration;
use tokio::time::Instant;

/// Width of one bin of the live strip (10 per second).
pub const BIN_WIDTH: Duration = Duration::from_millis(100);
/// Samples per analyser snapshot.
pub const ANALYSER_SIZE: usize = 32;
pub const LIVE_BINS: usize = 64;
/// Envelope resolutions computed from the decoded clip, finest first.
pub const ENVELOPE_BINS: [usize; 8] = [64, 56, 48, 40, 32, 24, 16, 8];
/// Quietest value drawn, so silence still shows as a sliver.
pub const INTENSITY_FLOOR: f32 = 0.02;

/// Decaying estimate of the byte range the microphone has been producing.
/// 128 is silence; the range creeps back toward it when the input quietens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicRange {
    pub min: i32,
    pub max: i32,
}

impl Default for DynamicRange {
    fn default() -> Self {
        Self { min: 127, max: 0 }
    }
}

impl DynamicRange {
    /// Largest distance from silence considered full scale.
    pub fn max_distance(&self) -> i32 {
        (self.max - 127).max(127 - self.min).max(10)
    }

    pub fn update(&self, sample: &Sample) -> Self {
        let min_decay = ((self.min - 126) as f32 * 0.1).floor() as i32;
        let max_decay = ((self.max - 128) as f32 * 0.1).floor() as i32;
        Self {
            min: sample.min.min(self.min + min_decay.max(1)).min(126),
            max: sample.max.max(self.max - max_decay.max(1)).max(128),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub min: i32,
    pub max: i32,
    /// Peak distance above silence, normalized to `max_distance`.
    pub value: f32,
}

/// Reads one time-domain snapshot (bytes centred on 128).
pub fn sample(snapshot: &[u8], max_distance: i32) -> Sample {
    let mut min = 256;
    let mut max = -1;
    let mut peak = 0;
    for &b in snapshot {
        let b = i32::from(b);
        peak = peak.max(b - 127);
        min = min.min(b);
        max = max.max(b);
    }
    let max_distance = max_distance.max(1);
    Sample {
        min,
        max,
        value: peak.min(max_distance) as f32 / max_distance as f32,
    }
}

/// Fixed-length rolling strip, newest value last.
#[derive(Debug, Clone, PartialEq)]
pub struct IntensityBuffer {
    bins: Vec<f32>,
}

impl IntensityBuffer {
    pub fn new(len: usize) -> Self {
        Self {
            bins: vec![0.0; len.max(2)],
        }
    }

    /// Shifts in `v`. A loud previous bin only halves per step so peaks fall
    /// off gradually.
    pub fn push(&mut self, v: f32) {
        let len = self.bins.len();
        self.bins.copy_within(1.., 0);
        let prev = self.bins[len - 2];
        self.bins[len - 1] = if prev > 0.1 { v.max(prev * 0.5) } else { v };
    }

    pub fn bins(&self) -> &[f32] {
        &self.bins
    }
}

/// What the live waveform draws: the strip plus how far (0..1) we are into
/// the next bin, for smooth scrolling.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveIntensity {
    pub bins: Vec<f32>,
    pub offset: f32,
}

impl Default for LiveIntensity {
    fn default() -> Self {
        Self {
            bins: vec![0.0; LIVE_BINS],
            offset: 0.0,
        }
    }
}

/// Sampling state for one recording.
#[derive(Debug)]
pub struct RecordingAnalysis {
    range: DynamicRange,
    buffer: IntensityBuffer,
    last_bin_at: Instant,
    snapshot: Vec<u8>,
}

impl RecordingAnalysis {
    pub fn new(now: Instant) -> Self {
        Self {
            range: DynamicRange::default(),
            buffer: IntensityBuffer::new(LIVE_BINS),
            last_bin_at: now,
            snapshot: vec![128; ANALYSER_SIZE],
        }
    }

    pub fn next_bin_at(&self) -> Instant {
        self.last_bin_at + BIN_WIDTH
    }

    pub fn range(&self) -> DynamicRange {
        self.range
    }

    pub fn bins(&self) -> &[f32] {
        self.buffer.bins()
    }

    /// Samples once if a bin boundary passed, repeating the value for any
    /// bins that were skipped. `read` fills the analyser snapshot.
    pub fn tick<R: FnOnce(&mut [u8])>(&mut self, now: Instant, read: R) -> LiveIntensity {
        if now >= self.next_bin_at() {
            read(&mut self.snapshot);
            let s = sample(&self.snapshot, self.range.max_distance());
            self.range = self.range.update(&s);
            while now >= self.next_bin_at() {
                self.buffer.push(s.value);
                self.last_bin_at += BIN_WIDTH;
            }
        }
        let since = now.saturating_duration_since(self.last_bin_at);
        LiveIntensity {
            bins: self.buffer.bins().to_vec(),
            offset: since.as_secs_f32() / BIN_WIDTH.as_secs_f32(),
        }
    }
}

/// RMS envelopes of `pcm` at each of `ENVELOPE_BINS` resolutions, each
/// normalized to its loudest bin and floored at `INTENSITY_FLOOR`.
pub fn envelopes(pcm: &[f32]) -> Vec<Vec<f32>> {
    ENVELOPE_BINS.iter().map(|&n| envelope(pcm, n)).collect()
}

fn envelope(pcm: &[f32], num_bins: usize) -> Vec<f32> {
    let len = pcm.len();
    let bin_size = (len + (num_bins - len % num_bins)) / num_bins;
    let mut bins: Vec<f32> = (0..num_bins)
        .map(|bin| {
            let start = (bin * bin_size).min(len);
            let end = (start + bin_size).min(len);
            if end <= start {
                return 0.0;
            }
            let sum: f32 = pcm[start..end].iter().map(|s| s * s).sum();
            (sum / (end - start) as f32).sqrt()
        })
        .collect();
    let highest = bins.iter().copied().fold(1e-6_f32, f32::max);
    for b in bins.iter_mut() {
        *b = (*b / highest).max(INTENSITY_FLOOR);
    }
    bins
}

/// Floors server provided bins the same way.
pub fn floor_intensity(tvi: &mut [Vec<f32>]) {
    for v in tvi.iter_mut().flat_map(|a| a.iter_mut()) {
        if *v < INTENSITY_FLOOR {
            *v = INTENSITY_FLOOR;
        }
    }
}

/// Recording length from the recorder's start and stop event timestamps.
pub fn duration_seconds(started_at_ms: f64, stopped_at_ms: f64) -> f64 {
    (stopped_at_ms - started_at_ms) / 1000.0
}
