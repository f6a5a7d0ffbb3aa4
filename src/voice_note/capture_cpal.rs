//! Microphone capture through cpal. The stream lives on its own thread since
//! cpal streams cannot move between threads on every platform; the session
//! talks to it with commands and hears back through recorder events.

use super::analysis::ANALYSER_SIZE;
use super::platform::{encode_wav, CaptureBackend, CaptureError, CaptureEvent, CaptureSession, Recording};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

const TARGET_SAMPLE_RATE: u32 = 16000;

/// Records from the named input device, or the default one.
#[derive(Debug, Clone, Default)]
pub struct CpalCapture {
    pub device_name: Option<String>,
}

impl CpalCapture {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

enum Command {
    Start,
    Stop,
    Close,
}

/// State shared between the cpal callback and the session.
struct Shared {
    recording: AtomicBool,
    samples: Mutex<Vec<i16>>,
    analyser: Mutex<VecDeque<u8>>,
}

fn try_config(device: &cpal::Device, rate: u32) -> Option<StreamConfig> {
    let supported: Vec<_> = device.supported_input_configs().ok()?.collect();
    let fits = |r: &cpal::SupportedStreamConfigRange| r.min_sample_rate().0 <= rate && r.max_sample_rate().0 >= rate;
    // Mono first; anything else is downmixed.
    let range = supported
        .iter()
        .find(|r| r.channels() == 1 && fits(r))
        .or_else(|| supported.iter().find(|r| fits(r)))?;
    Some(StreamConfig {
        channels: range.channels(),
        sample_rate: SampleRate(rate),
        buffer_size: cpal::BufferSize::Default,
    })
}

fn select_device(name: Option<&str>) -> Result<cpal::Device, CaptureError> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .input_devices()
            .map_err(|e| CaptureError::NoDevice(format!("Failed to list devices: {}", e)))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| CaptureError::NoDevice(format!("Device '{}' not found", name))),
        None => host
            .default_input_device()
            .ok_or_else(|| CaptureError::NoDevice("No default input device".into())),
    }
}

fn build_stream(
    device: &cpal::Device,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<CaptureEvent>,
) -> Result<(cpal::Stream, u32), CaptureError> {
    let config = match try_config(device, TARGET_SAMPLE_RATE).or_else(|| try_config(device, 48000)) {
        Some(config) => config,
        None => {
            let default = device
                .default_input_config()
                .map_err(|e| CaptureError::Setup(format!("No input config: {}", e)))?;
            StreamConfig {
                channels: default.channels(),
                sample_rate: default.sample_rate(),
                buffer_size: cpal::BufferSize::Default,
            }
        }
    };
    let rate = config.sample_rate.0;
    let channels = usize::from(config.channels.max(1));
    log::info!("[voice-note] capture config: {}Hz, {}ch", rate, channels);

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mono: Vec<f32> = if channels > 1 {
                    data.chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                        .collect()
                } else {
                    data.to_vec()
                };
                if let Ok(mut analyser) = shared.analyser.lock() {
                    for s in &mono[mono.len().saturating_sub(ANALYSER_SIZE)..] {
                        if analyser.len() == ANALYSER_SIZE {
                            analyser.pop_front();
                        }
                        analyser.push_back((s.clamp(-1.0, 1.0) * 127.0 + 128.0) as u8);
                    }
                }
                if shared.recording.load(Ordering::SeqCst) {
                    if let Ok(mut samples) = shared.samples.lock() {
                        samples.extend(mono.iter().map(|s| (s.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16));
                    }
                }
            },
            move |err| {
                log::warn!("[voice-note] capture stream error: {}", err);
                let _ = events.send(CaptureEvent::Error(err.to_string()));
            },
            None,
        )
        .map_err(|e| CaptureError::Setup(format!("Failed to build stream: {}", e)))?;
    // Opened suspended; nothing is captured until started.
    stream
        .pause()
        .map_err(|e| CaptureError::Setup(format!("Failed to pause stream: {}", e)))?;
    Ok((stream, rate))
}

fn run_stream(
    device_name: Option<String>,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<CaptureEvent>,
    commands: std::sync::mpsc::Receiver<Command>,
    ready: oneshot::Sender<Result<u32, CaptureError>>,
) {
    let built = select_device(device_name.as_deref()).and_then(|device| {
        log::info!(
            "[voice-note] using device: {}",
            device.name().unwrap_or_else(|_| "unknown".into())
        );
        build_stream(&device, shared.clone(), events.clone())
    });
    let (stream, rate) = match built {
        Ok(built) => built,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if ready.send(Ok(rate)).is_err() {
        return;
    }

    let epoch = Instant::now();
    let now_ms = || epoch.elapsed().as_secs_f64() * 1000.0;
    while let Ok(command) = commands.recv() {
        match command {
            Command::Start => match stream.play() {
                Ok(()) => {
                    shared.recording.store(true, Ordering::SeqCst);
                    let _ = events.send(CaptureEvent::Started { at_ms: now_ms() });
                }
                Err(e) => {
                    let _ = events.send(CaptureEvent::Error(format!("Failed to start stream: {}", e)));
                }
            },
            Command::Stop => {
                if shared.recording.swap(false, Ordering::SeqCst) {
                    if let Err(e) = stream.pause() {
                        log::warn!("[voice-note] failed to pause stream: {}", e);
                    }
                }
                let _ = events.send(CaptureEvent::Stopped { at_ms: now_ms() });
            }
            Command::Close => break,
        }
    }
    drop(stream);
    log::debug!("[voice-note] capture stream closed");
}

#[async_trait]
impl CaptureBackend for CpalCapture {
    async fn open(&self) -> Result<Box<dyn CaptureSession>, CaptureError> {
        let shared = Arc::new(Shared {
            recording: AtomicBool::new(false),
            samples: Mutex::new(Vec::new()),
            analyser: Mutex::new(VecDeque::with_capacity(ANALYSER_SIZE)),
        });
        let (events_tx, events) = mpsc::unbounded_channel();
        let (commands, commands_rx) = std::sync::mpsc::channel();
        let (ready_tx, ready) = oneshot::channel();
        let device_name = self.device_name.clone();
        let thread_shared = shared.clone();
        std::thread::Builder::new()
            .name("voice-note-capture".into())
            .spawn(move || run_stream(device_name, thread_shared, events_tx, commands_rx, ready_tx))
            .map_err(|e| CaptureError::Setup(format!("Failed to spawn capture thread: {}", e)))?;

        let sample_rate = ready
            .await
            .map_err(|_| CaptureError::Setup("capture thread exited".into()))??;
        Ok(Box::new(CpalSession {
            shared,
            events,
            commands,
            sample_rate,
        }))
    }
}

struct CpalSession {
    shared: Arc<Shared>,
    events: mpsc::UnboundedReceiver<CaptureEvent>,
    commands: std::sync::mpsc::Sender<Command>,
    sample_rate: u32,
}

#[async_trait]
impl CaptureSession for CpalSession {
    fn start(&mut self) -> Result<(), String> {
        self.commands
            .send(Command::Start)
            .map_err(|_| "capture thread exited".to_string())
    }

    fn stop(&mut self) {
        let _ = self.commands.send(Command::Stop);
    }

    async fn next_event(&mut self) -> Option<CaptureEvent> {
        self.events.recv().await
    }

    fn read_time_domain(&mut self, buf: &mut [u8]) {
        buf.fill(128);
        if let Ok(analyser) = self.shared.analyser.lock() {
            let skip = buf.len().saturating_sub(analyser.len());
            for (slot, b) in buf.iter_mut().skip(skip).zip(analyser.iter()) {
                *slot = *b;
            }
        }
    }

    fn take_recording(&mut self) -> Recording {
        let samples = match self.shared.samples.lock() {
            Ok(mut samples) => std::mem::take(&mut *samples),
            Err(_) => Vec::new(),
        };
        let data = match encode_wav(&samples, self.sample_rate) {
            Ok(data) => data,
            Err(e) => {
                log::warn!("[voice-note] {}", e);
                Vec::new()
            }
        };
        Recording {
            data,
            mime: "audio/wav".to_string(),
        }
    }

    fn close(self: Box<Self>) {
        let _ = self.commands.send(Command::Close);
    }
}
