//! Headless output path
//!
//! Renders into nothing, either as fast as possible, paced like real
//! hardware, or only when a test says so through [`VirtualOutputControl`].

use crate::playback::format::AudioFormat;
use crate::playback::output::{OutputDevice, OutputStream, StreamHooks, OUTPUT_QUEUE_CAPACITY};
use crate::{MurmurError, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

const RENDER_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pacing {
    /// Complete buffers as soon as they are rendered
    #[default]
    Immediate,
    /// Complete each buffer after its playback duration
    Realtime,
    /// Complete buffers only through [`VirtualOutputControl`]
    Manual,
}

struct ManualStream {
    generation: u64,
    hooks: StreamHooks,
    pending: VecDeque<Vec<f32>>,
}

#[derive(Default)]
struct ControlState {
    generation: u64,
    streams_opened: usize,
    attached: usize,
    scheduled: usize,
    paused: bool,
    fail_next_open: bool,
    manual: Option<ManualStream>,
}

/// Observes and drives a [`VirtualOutputDevice`]
#[derive(Clone, Default)]
pub struct VirtualOutputControl {
    state: Arc<Mutex<ControlState>>,
}

impl VirtualOutputControl {
    /// Finish the oldest pending buffer of a manual stream
    pub fn complete_next(&self) -> bool {
        let mut state = self.state.lock();
        let Some(stream) = state.manual.as_mut() else {
            return false;
        };
        let Some(samples) = stream.pending.pop_front() else {
            return false;
        };

        stream.hooks.tap.write(&samples);
        if stream.hooks.completions.buffer_done(samples).is_err() {
            warn!("Engine inbox full, dropping completion");
        }
        true
    }

    /// Finish every pending buffer, returning how many completed
    pub fn complete_all(&self) -> usize {
        let mut completed = 0;
        while self.complete_next() {
            completed += 1;
        }
        completed
    }

    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .manual
            .as_ref()
            .map(|m| m.pending.len())
            .unwrap_or(0)
    }

    pub fn streams_opened(&self) -> usize {
        self.state.lock().streams_opened
    }

    /// Whether an output path is currently attached
    pub fn is_attached(&self) -> bool {
        self.state.lock().attached > 0
    }

    pub fn buffers_scheduled(&self) -> usize {
        self.state.lock().scheduled
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Make the next `open` fail, simulating a broken output path
    pub fn fail_next_open(&self) {
        self.state.lock().fail_next_open = true;
    }
}

pub struct VirtualOutputDevice {
    pacing: Pacing,
    control: VirtualOutputControl,
}

impl VirtualOutputDevice {
    pub fn new(pacing: Pacing) -> Self {
        Self {
            pacing,
            control: VirtualOutputControl::default(),
        }
    }

    pub fn control(&self) -> VirtualOutputControl {
        self.control.clone()
    }
}

impl OutputDevice for VirtualOutputDevice {
    fn open(&mut self, format: AudioFormat, hooks: StreamHooks) -> Result<Box<dyn OutputStream>> {
        let mut state = self.control.state.lock();
        if state.fail_next_open {
            state.fail_next_open = false;
            return Err(MurmurError::AudioDeviceError(
                "Virtual output refused to open".into(),
            ));
        }

        state.generation += 1;
        state.streams_opened += 1;
        state.attached += 1;
        state.paused = false;
        let generation = state.generation;
        debug!("Virtual output attached at {} ({:?})", format, self.pacing);

        let path = match self.pacing {
            Pacing::Manual => {
                state.manual = Some(ManualStream {
                    generation,
                    hooks,
                    pending: VecDeque::new(),
                });
                RenderPath::Manual
            }
            Pacing::Immediate | Pacing::Realtime => {
                let (tx, rx) = bounded(OUTPUT_QUEUE_CAPACITY);
                let paused = Arc::new(AtomicBool::new(false));
                let detached = Arc::new(AtomicBool::new(false));
                let realtime = self.pacing == Pacing::Realtime;
                let worker_paused = Arc::clone(&paused);
                let worker_detached = Arc::clone(&detached);

                thread::Builder::new()
                    .name("murmur-virtual-output".into())
                    .spawn(move || {
                        render_loop(rx, hooks, format, realtime, worker_paused, worker_detached)
                    })
                    .map_err(|e| {
                        MurmurError::AudioDeviceError(format!("Failed to spawn renderer: {}", e))
                    })?;

                RenderPath::Rendered {
                    tx,
                    paused,
                    detached,
                }
            }
        };

        Ok(Box::new(VirtualStream {
            control: self.control.clone(),
            generation,
            path,
        }))
    }
}

enum RenderPath {
    Manual,
    Rendered {
        tx: Sender<Vec<f32>>,
        paused: Arc<AtomicBool>,
        detached: Arc<AtomicBool>,
    },
}

struct VirtualStream {
    control: VirtualOutputControl,
    generation: u64,
    path: RenderPath,
}

impl VirtualStream {
    fn set_paused(&mut self, value: bool) {
        self.control.state.lock().paused = value;
        if let RenderPath::Rendered { paused, .. } = &self.path {
            paused.store(value, Ordering::SeqCst);
        }
    }
}

impl OutputStream for VirtualStream {
    fn schedule(&mut self, samples: Vec<f32>) -> Result<()> {
        let mut state = self.control.state.lock();
        state.scheduled += 1;
        match &self.path {
            RenderPath::Manual => {
                match state.manual.as_mut() {
                    Some(stream) if stream.generation == self.generation => {
                        stream.pending.push_back(samples);
                        Ok(())
                    }
                    _ => Err(MurmurError::AudioDeviceError("Output path detached".into())),
                }
            }
            RenderPath::Rendered { tx, .. } => tx.try_send(samples).map_err(|e| match e {
                TrySendError::Full(_) => {
                    MurmurError::AudioProcessingError("Output queue full".into())
                }
                TrySendError::Disconnected(_) => {
                    MurmurError::ChannelError("Renderer stopped".into())
                }
            }),
        }
    }

    fn pause(&mut self) -> Result<()> {
        self.set_paused(true);
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.set_paused(false);
        Ok(())
    }
}

impl Drop for VirtualStream {
    fn drop(&mut self) {
        let mut state = self.control.state.lock();
        state.attached = state.attached.saturating_sub(1);
        state.paused = false;
        if state
            .manual
            .as_ref()
            .map(|m| m.generation == self.generation)
            .unwrap_or(false)
        {
            state.manual = None;
        }
        if let RenderPath::Rendered { detached, .. } = &self.path {
            detached.store(true, Ordering::SeqCst);
        }
    }
}

fn render_loop(
    rx: Receiver<Vec<f32>>,
    hooks: StreamHooks,
    format: AudioFormat,
    realtime: bool,
    paused: Arc<AtomicBool>,
    detached: Arc<AtomicBool>,
) {
    let StreamHooks {
        completions,
        mut tap,
    } = hooks;
    let channels = format.channels.max(1) as usize;

    while let Ok(samples) = rx.recv() {
        let mut remaining = if realtime {
            format.frames_to_duration((samples.len() / channels) as u64)
        } else {
            Duration::ZERO
        };

        // Play out the buffer, holding still while paused
        loop {
            if detached.load(Ordering::SeqCst) {
                return;
            }
            if paused.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
                continue;
            }
            if remaining.is_zero() {
                break;
            }
            let slice = remaining.min(RENDER_SLICE);
            thread::sleep(slice);
            remaining -= slice;
        }

        tap.write(&samples);

        let mut finished = samples;
        while let Err(back) = completions.buffer_done(finished) {
            if detached.load(Ordering::SeqCst) {
                return;
            }
            finished = back;
            thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::engine::EngineMessage;
    use crate::playback::output::CompletionNotifier;
    use crate::playback::tap::Tap;
    use std::sync::atomic::AtomicU64;
    use std::time::Instant;

    fn hooks(inbox: crossbeam_channel::Sender<EngineMessage>) -> (StreamHooks, Tap) {
        let (tap, writer) = Tap::install(
            AudioFormat::f32(1000, 1),
            10,
            None,
            Arc::new(AtomicU64::new(0)),
        );
        let hooks = StreamHooks {
            completions: CompletionNotifier::new(7, inbox),
            tap: writer,
        };
        (hooks, tap)
    }

    fn completed_session(msg: EngineMessage) -> Option<u64> {
        match msg {
            EngineMessage::BufferDone { session, .. } => Some(session),
            _ => None,
        }
    }

    #[test]
    fn test_manual_completes_on_demand() {
        let (inbox_tx, inbox_rx) = bounded(8);
        let (hooks, tap) = hooks(inbox_tx);
        let mut device = VirtualOutputDevice::new(Pacing::Manual);
        let control = device.control();

        let mut stream = device.open(AudioFormat::f32(1000, 1), hooks).unwrap();
        stream.schedule(vec![0.0; 10]).unwrap();
        stream.schedule(vec![0.0; 10]).unwrap();
        assert_eq!(control.pending(), 2);
        assert!(inbox_rx.try_recv().is_err());

        assert_eq!(control.complete_all(), 2);
        assert_eq!(completed_session(inbox_rx.try_recv().unwrap()), Some(7));
        assert_eq!(completed_session(inbox_rx.try_recv().unwrap()), Some(7));

        drop(stream);
        assert!(!control.is_attached());
        assert!(!control.complete_next());
        tap.remove();
    }

    #[test]
    fn test_realtime_takes_buffer_duration() {
        let (inbox_tx, inbox_rx) = bounded(8);
        let (hooks, tap) = hooks(inbox_tx);
        let mut device = VirtualOutputDevice::new(Pacing::Realtime);

        let started = Instant::now();
        let mut stream = device.open(AudioFormat::f32(1000, 1), hooks).unwrap();
        // 50 ms at 1 kHz
        stream.schedule(vec![0.0; 50]).unwrap();

        let done = inbox_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(completed_session(done), Some(7));
        assert!(started.elapsed() >= Duration::from_millis(50));
        drop(stream);
        tap.remove();
    }

    #[test]
    fn test_fail_next_open() {
        let (inbox_tx, _inbox_rx) = bounded(8);
        let (hooks, tap) = hooks(inbox_tx);
        let mut device = VirtualOutputDevice::new(Pacing::Immediate);
        let control = device.control();

        control.fail_next_open();
        assert!(device.open(AudioFormat::f32(1000, 1), hooks).is_err());
        assert_eq!(control.streams_opened(), 0);
        tap.remove();
    }
}
