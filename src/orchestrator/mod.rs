//! Utterance orchestration
//!
//! [`Orchestrator`] owns the utterance queue and drives every utterance
//! through its lifecycle, one at a time, across the registered backends.
//! It is a plain single-threaded state machine: backend events queue up on an
//! internal channel and are applied by [`Orchestrator::drain_backend_events`]
//! or by the worker in [`service`].

pub mod service;

pub use service::{OrchestratorCommand, OrchestratorHandle, OrchestratorService, OrchestratorSnapshot};

use crate::backend::{BackendEvent, BackendEventSink, BackendNotice, SynthesisBackend};
use crate::events::{EventBus, Subscription};
use crate::utterance::{SpeechError, Utterance, UtteranceId, UtteranceStatus, WordBoundary};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Events emitted by the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum SpeechEvent {
    /// An utterance moved to a new status
    Status {
        utterance: UtteranceId,
        status: UtteranceStatus,
    },

    /// An utterance reached a word
    WordBoundary {
        utterance: UtteranceId,
        boundary: WordBoundary,
    },

    /// An utterance failed and was removed from the queue
    Failed {
        utterance: UtteranceId,
        error: SpeechError,
    },

    /// The queue ran empty
    QueueDrained,
}

struct Active {
    utterance: Arc<Utterance>,
    backend: Arc<dyn SynthesisBackend>,
}

pub struct Orchestrator {
    backends: Vec<Arc<dyn SynthesisBackend>>,
    selected: Option<String>,
    /// Pending utterances; the active one stays at the head until it ends
    queue: VecDeque<Arc<Utterance>>,
    active: Option<Active>,
    disabled: bool,
    events: EventBus<SpeechEvent>,
    notice_tx: Sender<BackendNotice>,
    notice_rx: Receiver<BackendNotice>,
}

impl Orchestrator {
    pub fn new() -> Self {
        let (notice_tx, notice_rx) = unbounded();
        Self {
            backends: Vec::new(),
            selected: None,
            queue: VecDeque::new(),
            active: None,
            disabled: false,
            events: EventBus::new(),
            notice_tx,
            notice_rx,
        }
    }

    pub fn subscribe(&self) -> Subscription<SpeechEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_bus(&self) -> EventBus<SpeechEvent> {
        self.events.clone()
    }

    /// Receiver of raw backend events, for callers running their own loop
    pub fn backend_events(&self) -> Receiver<BackendNotice> {
        self.notice_rx.clone()
    }

    /// Add a backend. It becomes the selection if `preferred` and available.
    ///
    /// A backend with the same id replaces the earlier registration.
    pub fn register_backend(&mut self, backend: Arc<dyn SynthesisBackend>, preferred: bool) {
        let id = backend.id().to_string();
        if self.backends.iter().any(|b| b.id() == id) {
            info!("Replacing backend '{}'", id);
            self.unregister_backend(&id);
        }

        backend.attach(BackendEventSink::new(id.clone(), self.notice_tx.clone()));
        let available = backend.is_available();
        self.backends.push(backend);
        info!("Registered backend '{}' (available: {})", id, available);

        if preferred && available {
            self.selected = Some(id);
        }
    }

    /// Remove a backend. Returns false if it was not registered.
    pub fn unregister_backend(&mut self, id: &str) -> bool {
        let Some(pos) = self.backends.iter().position(|b| b.id() == id) else {
            return false;
        };
        let backend = self.backends.remove(pos);
        backend.detach();
        info!("Unregistered backend '{}'", id);

        if self.selected.as_deref() == Some(id) {
            self.selected = self
                .backends
                .iter()
                .find(|b| b.is_available())
                .map(|b| b.id().to_string());
            debug!("Selection fell back to {:?}", self.selected);
        }

        let drove_active = self
            .active
            .as_ref()
            .map(|a| a.backend.id() == id)
            .unwrap_or(false);
        if drove_active {
            backend.stop();
            if let Some(active) = self.active.take() {
                self.fail(&active.utterance, SpeechError::BackendUnavailable(id.to_string()));
                self.remove_from_queue(active.utterance.id());
            }
            self.advance();
        }
        true
    }

    /// Select a registered, available backend. Returns whether the selection
    /// changed.
    pub fn select_backend(&mut self, id: &str) -> bool {
        match self.find_backend(id) {
            Some(backend) if backend.is_available() => {
                let changed = self.selected.as_deref() != Some(id);
                self.selected = Some(id.to_string());
                changed
            }
            Some(_) => {
                warn!("Cannot select backend '{}': unavailable", id);
                false
            }
            None => {
                warn!("Cannot select backend '{}': not registered", id);
                false
            }
        }
    }

    pub fn enqueue(&mut self, utterance: Arc<Utterance>) {
        self.enqueue_all([utterance]);
    }

    pub fn enqueue_all(&mut self, utterances: impl IntoIterator<Item = Arc<Utterance>>) {
        if self.disabled {
            debug!("Ignoring enqueue while disabled");
            return;
        }

        for utterance in utterances {
            if utterance.status() != UtteranceStatus::None {
                warn!(
                    "Refusing to enqueue {} with status {}",
                    utterance.id(),
                    utterance.status()
                );
                continue;
            }
            self.queue.push_back(Arc::clone(&utterance));
            self.transition(&utterance, UtteranceStatus::Queued);
        }

        self.advance();
    }

    /// Replace everything queued with `utterance`
    pub fn play(&mut self, utterance: Arc<Utterance>) {
        self.play_all([utterance]);
    }

    pub fn play_all(&mut self, utterances: impl IntoIterator<Item = Arc<Utterance>>) {
        self.cancel_all();
        self.enqueue_all(utterances);
    }

    /// Cancel every queued utterance, including the active one
    pub fn cancel_all(&mut self) {
        let queued: Vec<_> = self.queue.drain(..).collect();
        for utterance in &queued {
            self.transition(utterance, UtteranceStatus::Cancelled);
        }

        if let Some(active) = self.active.take() {
            debug!("Stopping active utterance {}", active.utterance.id());
            active.backend.stop();
        }

        if !queued.is_empty() {
            info!("Cancelled {} utterance(s)", queued.len());
        }
    }

    /// Cancel one utterance. The active one is stopped through its backend
    /// and reported when the backend confirms; a queued one is removed now.
    pub fn cancel(&mut self, id: UtteranceId) -> bool {
        if let Some(active) = &self.active {
            if active.utterance.id() == id {
                active.backend.stop();
                return true;
            }
        }

        match self.remove_from_queue(id) {
            Some(utterance) => {
                self.transition(&utterance, UtteranceStatus::Cancelled);
                true
            }
            None => false,
        }
    }

    pub fn pause(&mut self) {
        let Some(active) = &self.active else {
            return;
        };
        active.backend.pause();
        let utterance = Arc::clone(&active.utterance);
        if utterance.status() == UtteranceStatus::Speaking {
            self.transition(&utterance, UtteranceStatus::Paused);
        }
    }

    pub fn resume(&mut self) {
        let Some(active) = &self.active else {
            return;
        };
        active.backend.resume();
        let utterance = Arc::clone(&active.utterance);
        if utterance.status() == UtteranceStatus::Paused {
            self.transition(&utterance, UtteranceStatus::Speaking);
        }
    }

    /// Disabling cancels everything and ignores later enqueues
    pub fn set_disabled(&mut self, disabled: bool) {
        self.disabled = disabled;
        if disabled {
            info!("Speech disabled");
            self.cancel_all();
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Queued utterances, the active one included
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queued_ids(&self) -> Vec<UtteranceId> {
        self.queue.iter().map(|u| u.id()).collect()
    }

    pub fn active(&self) -> Option<Arc<Utterance>> {
        self.active.as_ref().map(|a| Arc::clone(&a.utterance))
    }

    pub fn selected_backend(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn backend_ids(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.id().to_string()).collect()
    }

    /// Apply every backend event received so far. Returns how many were
    /// handled.
    pub fn drain_backend_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(notice) = self.notice_rx.try_recv() {
            self.handle_backend_event(notice);
            handled += 1;
        }
        handled
    }

    /// Apply one backend event. Events for anything but the active utterance
    /// on its own backend are ignored.
    pub fn handle_backend_event(&mut self, notice: BackendNotice) {
        let Some(active) = &self.active else {
            debug!("Ignoring {:?} from '{}': nothing active", notice.event, notice.backend);
            return;
        };
        if active.utterance.id() != notice.utterance || active.backend.id() != notice.backend {
            debug!(
                "Ignoring {:?} for {} from '{}'",
                notice.event, notice.utterance, notice.backend
            );
            return;
        }
        let utterance = Arc::clone(&active.utterance);

        match notice.event {
            BackendEvent::Started => {
                self.transition(&utterance, UtteranceStatus::Speaking);
            }
            BackendEvent::WordBoundary(boundary) => {
                utterance.publish_word(boundary.clone());
                self.events.publish(SpeechEvent::WordBoundary {
                    utterance: utterance.id(),
                    boundary,
                });
            }
            BackendEvent::Finished => {
                if utterance.status() == UtteranceStatus::Preparing {
                    debug!("{} finished without a start", utterance.id());
                    self.transition(&utterance, UtteranceStatus::Speaking);
                }
                self.transition(&utterance, UtteranceStatus::Finished);
                self.finish_active();
            }
            BackendEvent::Cancelled => {
                self.transition(&utterance, UtteranceStatus::Cancelled);
                self.finish_active();
            }
            BackendEvent::Failed(error) => {
                self.fail(&utterance, error);
                self.finish_active();
            }
        }
    }

    fn finish_active(&mut self) {
        if let Some(active) = self.active.take() {
            self.remove_from_queue(active.utterance.id());
        }
        self.advance();
    }

    /// Start the queue head if nothing is active
    fn advance(&mut self) {
        loop {
            if self.active.is_some() {
                return;
            }

            let Some(head) = self.queue.front().cloned() else {
                debug!("Queue drained");
                self.events.publish(SpeechEvent::QueueDrained);
                return;
            };

            let Some(backend) = self.pick_backend() else {
                warn!("No backend available for {}", head.id());
                self.queue.pop_front();
                self.fail(&head, SpeechError::NoBackendAvailable);
                continue;
            };

            info!("Speaking {} with '{}'", head.id(), backend.id());
            self.active = Some(Active {
                utterance: Arc::clone(&head),
                backend: Arc::clone(&backend),
            });
            self.transition(&head, UtteranceStatus::Preparing);
            backend.start(head);
            return;
        }
    }

    /// The selected backend if available, else the first available one
    fn pick_backend(&self) -> Option<Arc<dyn SynthesisBackend>> {
        self.selected
            .as_deref()
            .and_then(|id| self.find_backend(id))
            .filter(|b| b.is_available())
            .or_else(|| self.backends.iter().find(|b| b.is_available()))
            .cloned()
    }

    fn find_backend(&self, id: &str) -> Option<&Arc<dyn SynthesisBackend>> {
        self.backends.iter().find(|b| b.id() == id)
    }

    fn remove_from_queue(&mut self, id: UtteranceId) -> Option<Arc<Utterance>> {
        let pos = self.queue.iter().position(|u| u.id() == id)?;
        self.queue.remove(pos)
    }

    fn transition(&self, utterance: &Utterance, status: UtteranceStatus) {
        if utterance.set_status(status) {
            self.events.publish(SpeechEvent::Status {
                utterance: utterance.id(),
                status,
            });
        }
    }

    /// Settle `utterance` in failed and report `error` on the failure
    /// channels
    fn fail(&self, utterance: &Utterance, error: SpeechError) {
        if !utterance.record_failure(error.clone()) {
            debug!("Ignoring failure of ended utterance {}: {}", utterance.id(), error);
            return;
        }
        warn!("Utterance {} failed: {}", utterance.id(), error);
        self.events.publish(SpeechEvent::Failed {
            utterance: utterance.id(),
            error,
        });
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}
