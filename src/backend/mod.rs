//! Synthesis backends
//!
//! A backend turns an utterance into audio and reports its lifecycle through
//! a [`BackendEventSink`]. Backends run at most one synthesis at a time; a
//! second `start` cancels the first.

pub mod scripted;
pub mod tone;

pub use scripted::{BackendCall, ScriptedBackend, ScriptedReaction};
pub use tone::ToneBackend;

use crate::utterance::{SpeechError, Utterance, UtteranceId, WordBoundary};
use crossbeam_channel::Sender;
use std::sync::Arc;
use tracing::trace;

pub trait SynthesisBackend: Send + Sync {
    /// Stable identifier, unique among registered backends
    fn id(&self) -> &str;

    /// May change at any time
    fn is_available(&self) -> bool;

    /// Route lifecycle events to `sink`, replacing any earlier sink
    fn attach(&self, sink: BackendEventSink);

    fn detach(&self);

    /// Begin speaking `utterance`, cancelling whatever is in flight
    fn start(&self, utterance: Arc<Utterance>);

    fn pause(&self);

    fn resume(&self);

    /// Stop the in-flight utterance. Always followed by a cancelled or
    /// finished event for it.
    fn stop(&self);
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    Started,
    Finished,
    Cancelled,
    WordBoundary(WordBoundary),
    Failed(SpeechError),
}

/// A [`BackendEvent`] tagged with where it came from
#[derive(Debug, Clone, PartialEq)]
pub struct BackendNotice {
    pub backend: String,
    pub utterance: UtteranceId,
    pub event: BackendEvent,
}

/// Where a backend reports lifecycle events
#[derive(Clone)]
pub struct BackendEventSink {
    backend: String,
    tx: Sender<BackendNotice>,
}

impl BackendEventSink {
    pub fn new(backend: impl Into<String>, tx: Sender<BackendNotice>) -> Self {
        Self {
            backend: backend.into(),
            tx,
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn emit(&self, utterance: UtteranceId, event: BackendEvent) {
        trace!("{} -> {:?} for {}", self.backend, event, utterance);
        // The orchestrator may already be gone
        let _ = self.tx.send(BackendNotice {
            backend: self.backend.clone(),
            utterance,
            event,
        });
    }

    pub fn started(&self, utterance: UtteranceId) {
        self.emit(utterance, BackendEvent::Started);
    }

    pub fn finished(&self, utterance: UtteranceId) {
        self.emit(utterance, BackendEvent::Finished);
    }

    pub fn cancelled(&self, utterance: UtteranceId) {
        self.emit(utterance, BackendEvent::Cancelled);
    }

    pub fn word_boundary(&self, utterance: UtteranceId, boundary: WordBoundary) {
        self.emit(utterance, BackendEvent::WordBoundary(boundary));
    }

    pub fn failed(&self, utterance: UtteranceId, error: SpeechError) {
        self.emit(utterance, BackendEvent::Failed(error));
    }
}
