use crate::events::{EventBus, Subscription};
use crate::playback::PipelineFailure;
use crate::utterance::words::WordBoundary;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Identity of one utterance. Also serves as the playback session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UtteranceId(Uuid);

impl UtteranceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UtteranceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UtteranceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Female,
    Male,
    Other,
}

/// Voice parameters requested for an utterance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceDescriptor {
    /// BCP-47 style locale, e.g. `en-US`
    pub locale: String,
    pub gender: Gender,
    /// Speaking rate multiplier (1.0 = normal)
    pub rate: Option<f32>,
    /// Pitch multiplier (1.0 = normal)
    pub pitch: Option<f32>,
}

impl VoiceDescriptor {
    pub fn new(locale: impl Into<String>, gender: Gender) -> Self {
        Self {
            locale: locale.into(),
            gender,
            rate: None,
            pitch: None,
        }
    }

    pub fn with_rate(mut self, rate: f32) -> Self {
        self.rate = Some(rate);
        self
    }

    pub fn with_pitch(mut self, pitch: f32) -> Self {
        self.pitch = Some(pitch);
        self
    }
}

impl Default for VoiceDescriptor {
    fn default() -> Self {
        Self::new("en-US", Gender::Female)
    }
}

/// Lifecycle status of an utterance.
///
/// `Failed` is never published as a status change. A failure is reported
/// on the failure channel, and the utterance settles in `Failed` so it
/// leaves the active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UtteranceStatus {
    #[default]
    None,
    Queued,
    Preparing,
    Speaking,
    Paused,
    Finished,
    Cancelled,
    Failed,
}

impl UtteranceStatus {
    /// Preparing, speaking or paused. At most one utterance may be active.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            UtteranceStatus::Preparing | UtteranceStatus::Speaking | UtteranceStatus::Paused
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UtteranceStatus::Finished | UtteranceStatus::Cancelled | UtteranceStatus::Failed
        )
    }

    /// Whether the lifecycle graph allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: UtteranceStatus) -> bool {
        use UtteranceStatus::*;
        matches!(
            (self, next),
            (None, Queued)
                | (Queued, Preparing)
                | (Queued, Cancelled)
                | (Queued, Failed)
                | (Preparing, Speaking)
                | (Preparing, Cancelled)
                | (Preparing, Failed)
                | (Speaking, Paused)
                | (Speaking, Finished)
                | (Speaking, Cancelled)
                | (Speaking, Failed)
                | (Paused, Speaking)
                | (Paused, Finished)
                | (Paused, Cancelled)
                | (Paused, Failed)
        )
    }
}

impl fmt::Display for UtteranceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UtteranceStatus::None => "none",
            UtteranceStatus::Queued => "queued",
            UtteranceStatus::Preparing => "preparing",
            UtteranceStatus::Speaking => "speaking",
            UtteranceStatus::Paused => "paused",
            UtteranceStatus::Finished => "finished",
            UtteranceStatus::Cancelled => "cancelled",
            UtteranceStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why an utterance failed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpeechError {
    #[error("no synthesis backend is available")]
    NoBackendAvailable,

    #[error("backend '{0}' became unavailable")]
    BackendUnavailable(String),

    #[error("voice could not be resolved: {0}")]
    VoiceResolution(String),

    #[error("audio pipeline failure: {0}")]
    AudioPipeline(PipelineFailure),
}

/// Events published on an utterance's own bus
#[derive(Debug, Clone, PartialEq)]
pub enum UtteranceEvent {
    Status(UtteranceStatus),
    WordBoundary(WordBoundary),
    Failed(SpeechError),
}

#[derive(Debug, Default)]
struct UtteranceState {
    status: UtteranceStatus,
    failure: Option<SpeechError>,
}

/// One text-to-speech request
pub struct Utterance {
    id: UtteranceId,
    text: String,
    voice: VoiceDescriptor,
    tag: Option<String>,
    state: Mutex<UtteranceState>,
    events: EventBus<UtteranceEvent>,
}

impl Utterance {
    pub fn new(text: impl Into<String>, voice: VoiceDescriptor) -> Arc<Self> {
        Arc::new(Self::build(text.into(), voice, None))
    }

    pub fn tagged(
        text: impl Into<String>,
        voice: VoiceDescriptor,
        tag: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self::build(text.into(), voice, Some(tag.into())))
    }

    fn build(text: String, voice: VoiceDescriptor, tag: Option<String>) -> Self {
        Self {
            id: UtteranceId::new(),
            text,
            voice,
            tag,
            state: Mutex::new(UtteranceState::default()),
            events: EventBus::new(),
        }
    }

    /// A fresh utterance with the same text, voice and tag, for re-enqueueing
    /// after a failure
    pub fn retry(&self) -> Arc<Self> {
        Arc::new(Self::build(
            self.text.clone(),
            self.voice.clone(),
            self.tag.clone(),
        ))
    }

    pub fn id(&self) -> UtteranceId {
        self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn voice(&self) -> &VoiceDescriptor {
        &self.voice
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn status(&self) -> UtteranceStatus {
        self.state.lock().status
    }

    pub fn failure(&self) -> Option<SpeechError> {
        self.state.lock().failure.clone()
    }

    /// Finished, cancelled or failed
    pub fn is_terminal(&self) -> bool {
        self.state.lock().status.is_terminal()
    }

    pub fn subscribe(&self) -> Subscription<UtteranceEvent> {
        self.events.subscribe()
    }

    /// Move to `status` and notify observers.
    ///
    /// Returns false without publishing when the status is unchanged or the
    /// lifecycle graph forbids the move.
    pub(crate) fn set_status(&self, status: UtteranceStatus) -> bool {
        {
            let mut state = self.state.lock();
            if state.status == status || !state.status.can_transition_to(status) {
                return false;
            }
            state.status = status;
        }
        self.events.publish(UtteranceEvent::Status(status));
        true
    }

    /// Record `error` and settle in `Failed`. Only the failure event is
    /// published. Returns false if the utterance had already ended.
    pub(crate) fn record_failure(&self, error: SpeechError) -> bool {
        {
            let mut state = self.state.lock();
            if !state.status.can_transition_to(UtteranceStatus::Failed) {
                return false;
            }
            state.status = UtteranceStatus::Failed;
            state.failure = Some(error.clone());
        }
        self.events.publish(UtteranceEvent::Failed(error));
        true
    }

    pub(crate) fn publish_word(&self, boundary: WordBoundary) {
        self.events.publish(UtteranceEvent::WordBoundary(boundary));
    }
}

impl fmt::Debug for Utterance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Utterance")
            .field("id", &self.id)
            .field("text", &self.text)
            .field("tag", &self.tag)
            .field("status", &self.status())
            .finish()
    }
}
