//! Utterance queueing and streaming speech playback.
//!
//! The [`orchestrator`] serializes speech requests across interchangeable
//! [`backend`]s under a single-active-utterance invariant, and the
//! [`playback`] engine streams the audio those backends produce to the output
//! device while reporting session status back up the chain.

pub mod backend;
pub mod config;
pub mod events;
pub mod orchestrator;
pub mod playback;
pub mod utterance;

use thiserror::Error;

pub use backend::{
    BackendEvent, BackendEventSink, BackendNotice, ScriptedBackend, SynthesisBackend, ToneBackend,
};
pub use config::SpeechConfig;
pub use events::{EventBus, Subscription};
pub use orchestrator::{Orchestrator, OrchestratorHandle, OrchestratorService, SpeechEvent};
pub use playback::{EngineHandle, PlaybackBuffer, PlaybackEngine, SessionStatus};
pub use utterance::{
    Gender, SpeechError, Utterance, UtteranceEvent, UtteranceId, UtteranceStatus, VoiceDescriptor,
    WordBoundary,
};

#[derive(Error, Debug, Clone)]
pub enum MurmurError {
    #[error("Audio device error: {0}")]
    AudioDeviceError(String),

    #[error("Audio processing error: {0}")]
    AudioProcessingError(String),

    #[error("Backend error: {0}")]
    BackendError(String),

    #[error("IO error: {0}")]
    IOError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),
}

impl From<std::io::Error> for MurmurError {
    fn from(e: std::io::Error) -> Self {
        MurmurError::IOError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MurmurError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_conversion() {
        let err: MurmurError = std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert!(matches!(err, MurmurError::IOError(_)));
        assert!(err.to_string().contains("missing"));
    }
}
