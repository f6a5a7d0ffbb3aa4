//! Hardware seams for voice notes. The machine owns a `CaptureSession` only
//! while recording and closes it exactly once; `close` takes the box so a
//! second call cannot compile.

use async_trait::async_trait;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("recording is not supported on this device")]
    Unsupported,
    #[error("no input device: {0}")]
    NoDevice(String),
    #[error("failed to set up recorder: {0}")]
    Setup(String),
}

/// Recorder lifecycle events. Timestamps are milliseconds on the session's
/// own monotonic clock, so only differences are meaningful.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    Started { at_ms: f64 },
    Stopped { at_ms: f64 },
    Error(String),
}

/// The recorded clip as the recorder encoded it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recording {
    pub data: Vec<u8>,
    pub mime: String,
}

#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Acquires the input device and prepares a recorder plus a suspended
    /// analyser on it. Nothing is captured until `start`.
    async fn open(&self) -> Result<Box<dyn CaptureSession>, CaptureError>;
}

#[async_trait]
pub trait CaptureSession: Send {
    /// Resumes the analyser and starts the recorder. `Started` follows on the
    /// event stream.
    fn start(&mut self) -> Result<(), String>;

    /// Asks the recorder to stop; `Stopped` follows. Harmless when already
    /// stopped or never started.
    fn stop(&mut self);

    /// Next recorder event. Cancel safe.
    async fn next_event(&mut self) -> Option<CaptureEvent>;

    /// Fills `buf` with the latest time-domain bytes (silence is 128).
    fn read_time_domain(&mut self, buf: &mut [u8]);

    /// Everything recorded so far.
    fn take_recording(&mut self) -> Recording;

    /// Releases the device, the analyser and the recorder.
    fn close(self: Box<Self>);
}

/// Decoding and probing of the locally written clip.
#[async_trait]
pub trait LocalPlayback: Send + Sync {
    /// Mono PCM samples in -1..1.
    async fn decode_pcm(&self, path: &Path) -> Result<Vec<f32>, String>;

    /// Resolves once the file can be played, with its duration when the
    /// container reports a finite one.
    async fn probe(&self, path: &Path) -> Result<Option<f64>, String>;
}

/// Plays back WAV clips, which is what the bundled recorder produces.
#[derive(Debug, Default, Clone, Copy)]
pub struct WavPlayback;

fn read_wav(path: &Path) -> Result<(hound::WavSpec, Vec<f32>), String> {
    let mut reader = hound::WavReader::open(path).map_err(|e| format!("Failed to open clip: {}", e))?;
    let spec = reader.spec();
    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| format!("Failed to decode clip: {}", e))?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(|e| format!("Failed to decode clip: {}", e))?
        }
    };
    let channels = usize::from(spec.channels.max(1));
    let mono = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };
    Ok((spec, mono))
}

#[async_trait]
impl LocalPlayback for WavPlayback {
    async fn decode_pcm(&self, path: &Path) -> Result<Vec<f32>, String> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || read_wav(&path).map(|(_, pcm)| pcm))
            .await
            .map_err(|e| format!("Failed to decode clip: {}", e))?
    }

    async fn probe(&self, path: &Path) -> Result<Option<f64>, String> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let reader = hound::WavReader::open(&path).map_err(|e| format!("Failed to open clip: {}", e))?;
            let spec = reader.spec();
            if spec.sample_rate == 0 {
                return Ok(None);
            }
            Ok(Some(f64::from(reader.duration()) / f64::from(spec.sample_rate)))
        })
        .await
        .map_err(|e| format!("Failed to probe clip: {}", e))?
    }
}

/// Encodes mono 16-bit PCM as a WAV file in memory.
pub fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>, String> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| format!("Failed to start clip: {}", e))?;
        for s in samples {
            writer
                .write_sample(*s)
                .map_err(|e| format!("Failed to write clip: {}", e))?;
        }
        writer
            .finalize()
            .map_err(|e| format!("Failed to finish clip: {}", e))?;
    }
    Ok(cursor.into_inner())
}
