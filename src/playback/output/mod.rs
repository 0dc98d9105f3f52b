//! Realtime output paths
//!
//! An [`OutputDevice`] opens one [`OutputStream`] per playback session at the
//! engine's native format. The stream renders scheduled buffers from its own
//! realtime context and hands each finished buffer back through the
//! [`CompletionNotifier`]; dropping the stream detaches it.

#[cfg(feature = "audio-io")]
pub mod cpal_output;
pub mod virtual_output;

#[cfg(feature = "audio-io")]
pub use cpal_output::CpalOutputDevice;
pub use virtual_output::{Pacing, VirtualOutputControl, VirtualOutputDevice};

use crate::config::OutputKind;
use crate::playback::engine::EngineMessage;
use crate::playback::format::AudioFormat;
use crate::playback::tap::TapWriter;
use crate::Result;
use crossbeam_channel::{Sender, TrySendError};

/// Buffers a stream can hold before `schedule` refuses more. The engine
/// never hands over more than its stream window.
pub const OUTPUT_QUEUE_CAPACITY: usize = 256;

pub trait OutputDevice: Send {
    /// Attach a realtime output path rendering `format`
    fn open(&mut self, format: AudioFormat, hooks: StreamHooks) -> Result<Box<dyn OutputStream>>;
}

/// One attached output path. Not required to be `Send`: streams are created
/// and dropped on the engine thread.
pub trait OutputStream {
    /// Queue interleaved native samples behind what is already scheduled
    fn schedule(&mut self, samples: Vec<f32>) -> Result<()>;

    fn pause(&mut self) -> Result<()>;

    fn resume(&mut self) -> Result<()>;
}

/// Everything a stream hands back to the engine
pub struct StreamHooks {
    pub completions: CompletionNotifier,
    pub tap: TapWriter,
}

/// Marshals buffer completions from the realtime context onto the engine
/// inbox
#[derive(Clone)]
pub struct CompletionNotifier {
    session: u64,
    inbox: Sender<EngineMessage>,
}

impl CompletionNotifier {
    pub(crate) fn new(session: u64, inbox: Sender<EngineMessage>) -> Self {
        Self { session, inbox }
    }

    /// Report a finished buffer without blocking.
    ///
    /// The buffer travels back so it is freed on the engine thread. If the
    /// inbox is full the buffer is returned and the caller retries later.
    pub fn buffer_done(&self, samples: Vec<f32>) -> std::result::Result<(), Vec<f32>> {
        let message = EngineMessage::BufferDone {
            session: self.session,
            samples,
        };
        match self.inbox.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(EngineMessage::BufferDone { samples, .. })) => Err(samples),
            // Engine is gone or the message was not ours; nothing to report to
            Err(_) => Ok(()),
        }
    }
}

/// Build the output device selected in the configuration
pub fn open_output_device(kind: &OutputKind) -> Result<Box<dyn OutputDevice>> {
    match kind {
        OutputKind::Virtual { pacing } => Ok(Box::new(VirtualOutputDevice::new(*pacing))),
        #[cfg(feature = "audio-io")]
        OutputKind::Device { name } => Ok(Box::new(CpalOutputDevice::new(name.clone()))),
        #[cfg(not(feature = "audio-io"))]
        OutputKind::Device { .. } => Err(crate::MurmurError::ConfigError(
            "Hardware output requires the audio-io feature".into(),
        )),
    }
}
