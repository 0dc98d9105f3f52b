//! Deterministic backend whose behaviour is scripted up front

use crate::backend::{BackendEventSink, SynthesisBackend};
use crate::utterance::{word_boundaries, SpeechError, Utterance, UtteranceId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// What a [`ScriptedBackend`] does when asked to start
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ScriptedReaction {
    /// Start, report every word, finish
    #[default]
    Finish,
    /// Fail straight away
    Fail(SpeechError),
    /// Start and wait to be driven through the `drive_*` methods
    Hold,
    /// Take the utterance without reporting a start; see
    /// [`ScriptedBackend::drive_start`]
    Defer,
}

/// A call the backend received
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Start(UtteranceId),
    Pause,
    Resume,
    Stop,
}

#[derive(Default)]
struct ScriptedState {
    reaction: ScriptedReaction,
    sink: Option<BackendEventSink>,
    current: Option<Arc<Utterance>>,
    calls: Vec<BackendCall>,
}

pub struct ScriptedBackend {
    id: String,
    available: AtomicBool,
    state: Mutex<ScriptedState>,
}

impl ScriptedBackend {
    pub fn new(id: impl Into<String>, reaction: ScriptedReaction) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            available: AtomicBool::new(true),
            state: Mutex::new(ScriptedState {
                reaction,
                ..Default::default()
            }),
        })
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_reaction(&self, reaction: ScriptedReaction) {
        self.state.lock().reaction = reaction;
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.lock().calls.clone()
    }

    /// Ids passed to `start`, in order
    pub fn started_ids(&self) -> Vec<UtteranceId> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                BackendCall::Start(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn current(&self) -> Option<UtteranceId> {
        self.state.lock().current.as_ref().map(|u| u.id())
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().sink.is_some()
    }

    /// Report the start of the held utterance
    pub fn drive_start(&self) -> bool {
        let Some((sink, utterance)) = self.held() else {
            return false;
        };
        sink.started(utterance.id());
        true
    }

    /// Report every word of the held utterance
    pub fn drive_words(&self) -> bool {
        let Some((sink, utterance)) = self.held() else {
            return false;
        };
        for boundary in word_boundaries(utterance.text()) {
            sink.word_boundary(utterance.id(), boundary);
        }
        true
    }

    /// Finish the held utterance
    pub fn drive_finish(&self) -> bool {
        self.end_held(|sink, id| sink.finished(id))
    }

    /// Fail the held utterance
    pub fn drive_fail(&self, error: SpeechError) -> bool {
        self.end_held(move |sink, id| sink.failed(id, error))
    }

    fn held(&self) -> Option<(BackendEventSink, Arc<Utterance>)> {
        let state = self.state.lock();
        Some((state.sink.clone()?, state.current.clone()?))
    }

    fn end_held(&self, report: impl FnOnce(&BackendEventSink, UtteranceId)) -> bool {
        let (sink, current) = {
            let mut state = self.state.lock();
            (state.sink.clone(), state.current.take())
        };
        match (sink, current) {
            (Some(sink), Some(utterance)) => {
                report(&sink, utterance.id());
                true
            }
            _ => false,
        }
    }
}

impl SynthesisBackend for ScriptedBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn attach(&self, sink: BackendEventSink) {
        self.state.lock().sink = Some(sink);
    }

    fn detach(&self) {
        self.state.lock().sink = None;
    }

    fn start(&self, utterance: Arc<Utterance>) {
        let id = utterance.id();
        let (sink, reaction, previous) = {
            let mut state = self.state.lock();
            state.calls.push(BackendCall::Start(id));
            let previous = state.current.take();
            if matches!(state.reaction, ScriptedReaction::Hold | ScriptedReaction::Defer) {
                state.current = Some(Arc::clone(&utterance));
            }
            (state.sink.clone(), state.reaction.clone(), previous)
        };
        debug!("{} starting {} ({:?})", self.id, id, reaction);

        let Some(sink) = sink else {
            return;
        };
        if let Some(previous) = previous {
            sink.cancelled(previous.id());
        }

        match reaction {
            ScriptedReaction::Finish => {
                sink.started(id);
                for boundary in word_boundaries(utterance.text()) {
                    sink.word_boundary(id, boundary);
                }
                sink.finished(id);
            }
            ScriptedReaction::Fail(error) => sink.failed(id, error),
            ScriptedReaction::Hold => sink.started(id),
            ScriptedReaction::Defer => {}
        }
    }

    fn pause(&self) {
        self.state.lock().calls.push(BackendCall::Pause);
    }

    fn resume(&self) {
        self.state.lock().calls.push(BackendCall::Resume);
    }

    fn stop(&self) {
        let (sink, current) = {
            let mut state = self.state.lock();
            state.calls.push(BackendCall::Stop);
            (state.sink.clone(), state.current.take())
        };
        if let (Some(sink), Some(utterance)) = (sink, current) {
            sink.cancelled(utterance.id());
        }
    }
}
