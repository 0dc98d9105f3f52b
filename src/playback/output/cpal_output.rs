use crate::playback::format::AudioFormat;
use crate::playback::output::{
    CompletionNotifier, OutputDevice, OutputStream, StreamHooks, OUTPUT_QUEUE_CAPACITY,
};
use crate::playback::tap::TapWriter;
use crate::{MurmurError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, Stream, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// System audio output through cpal
pub struct CpalOutputDevice {
    /// Preferred device name; the host default when unset or not found
    device_name: Option<String>,
}

impl CpalOutputDevice {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }

    fn find_device(&self) -> Result<cpal::Device> {
        let host = cpal::default_host();

        if let Some(wanted) = &self.device_name {
            let devices = host.output_devices().map_err(|e| {
                MurmurError::AudioDeviceError(format!("Failed to list output devices: {}", e))
            })?;
            for device in devices {
                if device.name().map(|n| &n == wanted).unwrap_or(false) {
                    return Ok(device);
                }
            }
            info!("Output device '{}' not found, using default", wanted);
        }

        host.default_output_device()
            .ok_or_else(|| MurmurError::AudioDeviceError("No output device available".into()))
    }
}

impl OutputDevice for CpalOutputDevice {
    fn open(&mut self, format: AudioFormat, hooks: StreamHooks) -> Result<Box<dyn OutputStream>> {
        let device = self.find_device()?;
        info!(
            "Using output device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        let config = StreamConfig {
            channels: format.channels,
            sample_rate: SampleRate(format.sample_rate),
            buffer_size: BufferSize::Default,
        };

        let (tx, rx) = bounded(OUTPUT_QUEUE_CAPACITY);
        let paused = Arc::new(AtomicBool::new(false));
        let mut render = RenderState {
            rx,
            current: None,
            cursor: 0,
            unsent: None,
            completions: hooks.completions,
            tap: hooks.tap,
            paused: Arc::clone(&paused),
        };

        let err_fn = |err| {
            error!("Audio output stream error: {}", err);
        };

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| render.fill(data),
                err_fn,
                None,
            )
            .map_err(|e| {
                MurmurError::AudioDeviceError(format!("Failed to build output stream: {}", e))
            })?;

        stream.play().map_err(|e| {
            MurmurError::AudioDeviceError(format!("Failed to start output stream: {}", e))
        })?;

        Ok(Box::new(CpalStream { stream, tx, paused }))
    }
}

/// State owned by the realtime callback
struct RenderState {
    rx: Receiver<Vec<f32>>,
    current: Option<Vec<f32>>,
    cursor: usize,
    /// A finished buffer the engine inbox had no room for yet
    unsent: Option<Vec<f32>>,
    completions: CompletionNotifier,
    tap: TapWriter,
    paused: Arc<AtomicBool>,
}

impl RenderState {
    /// Realtime callback body: no allocation, no blocking, no frees
    fn fill(&mut self, data: &mut [f32]) {
        if let Some(done) = self.unsent.take() {
            if let Err(back) = self.completions.buffer_done(done) {
                self.unsent = Some(back);
            }
        }

        if self.paused.load(Ordering::Relaxed) {
            data.fill(0.0);
            return;
        }

        let mut written = 0;
        while written < data.len() {
            if self.current.is_none() {
                // Hold the next buffer until the last completion is delivered
                if self.unsent.is_some() {
                    break;
                }
                match self.rx.try_recv() {
                    Ok(buffer) => {
                        self.current = Some(buffer);
                        self.cursor = 0;
                    }
                    Err(_) => break,
                }
            }

            let Some(buffer) = self.current.as_ref() else {
                break;
            };
            let n = (buffer.len() - self.cursor).min(data.len() - written);
            data[written..written + n].copy_from_slice(&buffer[self.cursor..self.cursor + n]);
            written += n;
            self.cursor += n;

            if self.cursor >= buffer.len() {
                if let Some(finished) = self.current.take() {
                    if let Err(back) = self.completions.buffer_done(finished) {
                        self.unsent = Some(back);
                    }
                }
            }
        }

        data[written..].fill(0.0);
        self.tap.write(&data[..written]);
    }
}

struct CpalStream {
    stream: Stream,
    tx: Sender<Vec<f32>>,
    paused: Arc<AtomicBool>,
}

impl OutputStream for CpalStream {
    fn schedule(&mut self, samples: Vec<f32>) -> Result<()> {
        self.tx.try_send(samples).map_err(|e| match e {
            TrySendError::Full(_) => MurmurError::AudioProcessingError("Output queue full".into()),
            TrySendError::Disconnected(_) => {
                MurmurError::AudioDeviceError("Output stream closed".into())
            }
        })
    }

    fn pause(&mut self) -> Result<()> {
        self.paused.store(true, Ordering::Relaxed);
        self.stream
            .pause()
            .map_err(|e| MurmurError::AudioDeviceError(format!("Failed to pause stream: {}", e)))
    }

    fn resume(&mut self) -> Result<()> {
        self.paused.store(false, Ordering::Relaxed);
        self.stream
            .play()
            .map_err(|e| MurmurError::AudioDeviceError(format!("Failed to resume stream: {}", e)))
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        let _ = self.stream.pause();
        info!("Detached audio output");
    }
}
