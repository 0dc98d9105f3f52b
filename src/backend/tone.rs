//! Tone synthesis through the playback engine
//!
//! Renders one sine burst per word in its own source format and streams the
//! bursts to the [`EngineHandle`] under the utterance id. Engine session
//! status is relayed back as lifecycle events by a relay thread, and a word
//! is reported when the engine starts playing its burst.

use crate::backend::{BackendEventSink, SynthesisBackend};
use crate::config::ToneConfig;
use crate::playback::{EngineHandle, PipelineFailure, PlaybackBuffer, SessionStatus};
use crate::utterance::{
    word_boundaries, SpeechError, Utterance, UtteranceId, VoiceDescriptor, WordBoundary,
};
use crate::{MurmurError, Result};
use crossbeam_channel::{bounded, select, Receiver};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

const AMPLITUDE: f32 = 0.3;
const FADE_MS: u32 = 5;
const RATE_RANGE: std::ops::RangeInclusive<f32> = 0.25..=4.0;
const PITCH_RANGE: std::ops::RangeInclusive<f32> = 0.25..=4.0;

#[derive(Default)]
struct ToneState {
    sink: Option<BackendEventSink>,
    current: Option<UtteranceId>,
    /// Ids with buffers handed to the engine and no terminal status relayed
    /// yet, with the word each buffer carries
    pushed: HashMap<UtteranceId, Vec<WordBoundary>>,
}

pub struct ToneBackend {
    id: String,
    config: ToneConfig,
    engine: EngineHandle,
    available: AtomicBool,
    state: Arc<Mutex<ToneState>>,
    // Dropping this ends the relay thread
    _relay_stop: crossbeam_channel::Sender<()>,
}

impl ToneBackend {
    pub fn new(id: impl Into<String>, config: ToneConfig, engine: EngineHandle) -> Result<Arc<Self>> {
        let id = id.into();
        let state = Arc::new(Mutex::new(ToneState::default()));
        let (relay_stop, stop_rx) = bounded::<()>(1);

        let statuses = engine.subscribe();
        let relay_state = Arc::clone(&state);
        thread::Builder::new()
            .name(format!("murmur-{}-relay", id))
            .spawn(move || relay(statuses.receiver().clone(), stop_rx, relay_state))
            .map_err(|e| MurmurError::BackendError(format!("Failed to spawn relay: {}", e)))?;

        info!("Tone backend '{}' ready", id);
        Ok(Arc::new(Self {
            id,
            config,
            engine,
            available: AtomicBool::new(true),
            state,
            _relay_stop: relay_stop,
        }))
    }

    /// Flip availability. Going unavailable fails the utterance in flight.
    pub fn set_available(&self, available: bool) {
        let was = self.available.swap(available, Ordering::SeqCst);
        if available || !was {
            return;
        }

        let (sink, current) = {
            let mut state = self.state.lock();
            let current = state.current.take();
            if let Some(id) = current {
                // The engine's cancellation is not ours to report
                state.pushed.remove(&id);
            }
            (state.sink.clone(), current)
        };

        if let Some(id) = current {
            warn!("Backend '{}' became unavailable while speaking {}", self.id, id);
            if let Err(e) = self.engine.stop() {
                warn!("Failed to stop playback: {}", e);
            }
            if let Some(sink) = sink {
                sink.failed(id, SpeechError::BackendUnavailable(self.id.clone()));
            }
        }
    }

    fn resolve_voice(&self, voice: &VoiceDescriptor) -> std::result::Result<(f32, f32), SpeechError> {
        if !is_locale(&voice.locale) {
            return Err(SpeechError::VoiceResolution(format!(
                "unknown locale '{}'",
                voice.locale
            )));
        }

        let rate = voice.rate.unwrap_or(1.0);
        if !RATE_RANGE.contains(&rate) {
            return Err(SpeechError::VoiceResolution(format!(
                "rate {} out of range",
                rate
            )));
        }

        let pitch = voice.pitch.unwrap_or(1.0);
        if !PITCH_RANGE.contains(&pitch) {
            return Err(SpeechError::VoiceResolution(format!(
                "pitch {} out of range",
                pitch
            )));
        }

        Ok((rate, pitch))
    }

    /// One burst of tone followed by silence, as i16 mono
    fn render_word(&self, index: usize, rate: f32, pitch: f32) -> PlaybackBuffer {
        let sample_rate = self.config.source_sample_rate;
        let per_ms = sample_rate as f32 / 1000.0;
        let tone_len = (self.config.word_ms as f32 * per_ms / rate) as usize;
        let gap_len = (self.config.gap_ms as f32 * per_ms / rate) as usize;
        let fade_len = ((FADE_MS as f32 * per_ms) as usize).min(tone_len / 2).max(1);

        // Small per-word step so consecutive words are distinguishable
        let step = 1.0 + 0.06 * (index % 4) as f32;
        let frequency = self.config.base_frequency * pitch * step;

        let mut samples = Vec::with_capacity(tone_len + gap_len);
        for n in 0..tone_len {
            let envelope = (n.min(tone_len - 1 - n) as f32 / fade_len as f32).min(1.0);
            let phase = 2.0 * PI * frequency * n as f32 / sample_rate as f32;
            samples.push((phase.sin() * AMPLITUDE * envelope * i16::MAX as f32) as i16);
        }
        samples.resize(tone_len + gap_len, 0);

        PlaybackBuffer::from_i16(sample_rate, 1, samples)
    }
}

fn is_locale(locale: &str) -> bool {
    let mut parts = locale.split(['-', '_']);
    let language_ok = parts
        .next()
        .map(|l| (2..=3).contains(&l.len()) && l.chars().all(|c| c.is_ascii_alphabetic()))
        .unwrap_or(false);
    language_ok && parts.all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_alphanumeric()))
}

impl SynthesisBackend for ToneBackend {
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
        let Some(sink) = self.state.lock().sink.clone() else {
            warn!("Backend '{}' started without a sink", self.id);
            return;
        };

        if !self.is_available() {
            sink.failed(id, SpeechError::BackendUnavailable(self.id.clone()));
            return;
        }

        let (rate, pitch) = match self.resolve_voice(utterance.voice()) {
            Ok(params) => params,
            Err(e) => {
                debug!("Voice for {} rejected: {}", id, e);
                sink.failed(id, e);
                return;
            }
        };

        let words = word_boundaries(utterance.text());
        if words.is_empty() {
            sink.started(id);
            sink.finished(id);
            return;
        }

        // Render everything up front so the engine never runs dry between
        // words and ends the session early
        let buffers: Vec<_> = (0..words.len())
            .map(|index| self.render_word(index, rate, pitch))
            .collect();

        debug!("Synthesized {} words for {}", words.len(), id);
        {
            let mut state = self.state.lock();
            state.current = Some(id);
            state.pushed.insert(id, words);
        }

        for buffer in buffers {
            if let Err(e) = self.engine.play(id, buffer) {
                warn!("Playback engine rejected {}: {}", id, e);
                {
                    let mut state = self.state.lock();
                    state.pushed.remove(&id);
                    if state.current == Some(id) {
                        state.current = None;
                    }
                }
                sink.failed(
                    id,
                    SpeechError::AudioPipeline(PipelineFailure::Schedule(e.to_string())),
                );
                return;
            }
        }
    }

    fn pause(&self) {
        if let Err(e) = self.engine.pause() {
            warn!("Failed to pause playback: {}", e);
        }
    }

    fn resume(&self) {
        if let Err(e) = self.engine.resume() {
            warn!("Failed to resume playback: {}", e);
        }
    }

    fn stop(&self) {
        let (sink, current, pushed) = {
            let mut state = self.state.lock();
            let current = state.current.take();
            let pushed = current
                .map(|id| state.pushed.contains_key(&id))
                .unwrap_or(false);
            (state.sink.clone(), current, pushed)
        };
        let Some(id) = current else {
            return;
        };

        if pushed {
            // The relay reports the engine's cancelled (or finished)
            if let Err(e) = self.engine.stop() {
                warn!("Failed to stop playback: {}", e);
            }
        } else if let Some(sink) = sink {
            sink.cancelled(id);
        }
    }
}

fn relay(
    statuses: Receiver<SessionStatus>,
    stop: Receiver<()>,
    state: Arc<Mutex<ToneState>>,
) {
    loop {
        select! {
            recv(statuses) -> status => match status {
                Ok(status) => relay_status(status, &state),
                Err(_) => break,
            },
            recv(stop) -> _ => break,
        }
    }
    debug!("Tone relay stopped");
}

fn relay_status(status: SessionStatus, state: &Mutex<ToneState>) {
    let mut state = state.lock();
    let id = status.id();
    let Some(words) = state.pushed.get(&id) else {
        return;
    };
    let word = match &status {
        SessionStatus::BufferStarted { index, .. } => words.get(*index).cloned(),
        _ => None,
    };

    if status.is_terminal() {
        state.pushed.remove(&id);
        if state.current == Some(id) {
            state.current = None;
        }
    }

    let Some(sink) = state.sink.clone() else {
        return;
    };
    drop(state);

    match status {
        SessionStatus::Started(id) => sink.started(id),
        SessionStatus::BufferStarted { id, index } => match word {
            Some(boundary) => sink.word_boundary(id, boundary),
            None => debug!("No word for buffer {} of {}", index, id),
        },
        SessionStatus::Stopped(id) => sink.finished(id),
        SessionStatus::Cancelled(id) => sink.cancelled(id),
        SessionStatus::Failed { id, failure } => {
            sink.failed(id, SpeechError::AudioPipeline(failure))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendEvent, BackendNotice};
    use crate::config::EngineConfig;
    use crate::playback::output::{Pacing, VirtualOutputControl, VirtualOutputDevice};
    use crate::playback::{EngineParts, PlaybackEngine};
    use crate::utterance::Gender;
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn setup(pacing: Pacing) -> (Arc<ToneBackend>, Receiver<BackendNotice>, VirtualOutputControl) {
        let device = VirtualOutputDevice::new(pacing);
        let control = device.control();
        let (engine, _join) =
            PlaybackEngine::spawn(EngineConfig::default(), EngineParts::new(Box::new(device)))
                .unwrap();
        let backend = ToneBackend::new("tone", ToneConfig::default(), engine).unwrap();
        let (tx, rx) = unbounded();
        backend.attach(BackendEventSink::new("tone", tx));
        (backend, rx, control)
    }

    /// Collect events until one satisfies `last`
    fn collect_until(
        rx: &Receiver<BackendNotice>,
        last: impl Fn(&BackendEvent) -> bool,
    ) -> Vec<BackendEvent> {
        let mut events = Vec::new();
        while let Ok(notice) = rx.recv_timeout(TIMEOUT) {
            let done = last(&notice.event);
            events.push(notice.event);
            if done {
                break;
            }
        }
        events
    }

    #[test]
    fn test_speaks_to_completion() {
        let (backend, rx, control) = setup(Pacing::Immediate);
        let utterance = Utterance::new("Hello world", VoiceDescriptor::default());
        backend.start(Arc::clone(&utterance));

        let events = collect_until(&rx, |e| *e == BackendEvent::Finished);
        let words: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                BackendEvent::WordBoundary(b) => b.slice(utterance.text()),
                _ => None,
            })
            .collect();

        assert_eq!(words, vec!["Hello", "world"]);
        assert!(events.contains(&BackendEvent::Started));
        assert_eq!(events.last(), Some(&BackendEvent::Finished));
        // One burst per word plus the resampler tail
        assert_eq!(control.buffers_scheduled(), 3);
    }

    #[test]
    fn test_words_follow_playback() {
        let (backend, rx, control) = setup(Pacing::Manual);
        let utterance = Utterance::new("one two three four", VoiceDescriptor::default());
        let word = |event: &BackendEvent| match event {
            BackendEvent::WordBoundary(b) => Some(b.word.clone()),
            _ => None,
        };
        backend.start(Arc::clone(&utterance));

        // The first word is reported once its burst starts, after the start
        let events = collect_until(&rx, |e| matches!(e, BackendEvent::WordBoundary(_)));
        assert_eq!(events.first(), Some(&BackendEvent::Started));
        assert_eq!(events.iter().filter_map(word).collect::<Vec<_>>(), vec!["one"]);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        for expected in ["two", "three", "four"] {
            assert!(control.complete_next());
            let notice = rx.recv_timeout(TIMEOUT).unwrap();
            assert_eq!(word(&notice.event).as_deref(), Some(expected));
        }

        // Last burst, then the tail
        let deadline = std::time::Instant::now() + TIMEOUT;
        let mut finished = false;
        while !finished && std::time::Instant::now() < deadline {
            control.complete_next();
            if let Ok(notice) = rx.recv_timeout(Duration::from_millis(20)) {
                assert_eq!(word(&notice.event), None);
                finished = notice.event == BackendEvent::Finished;
            }
        }
        assert!(finished);
    }

    #[test]
    fn test_stop_yields_cancelled() {
        let (backend, rx, _control) = setup(Pacing::Manual);
        backend.start(Utterance::new("one two three", VoiceDescriptor::default()));
        collect_until(&rx, |e| *e == BackendEvent::Started);

        backend.stop();
        let events = collect_until(&rx, |e| *e == BackendEvent::Cancelled);
        assert_eq!(events.last(), Some(&BackendEvent::Cancelled));
    }

    #[test]
    fn test_stop_when_idle_is_silent() {
        let (backend, rx, _control) = setup(Pacing::Manual);
        // Nothing in flight
        backend.stop();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_rejects_unknown_voice() {
        let (backend, rx, control) = setup(Pacing::Immediate);
        let voice = VoiceDescriptor::new("not a locale", Gender::Male);
        backend.start(Utterance::new("hi", voice));

        let notice = rx.recv_timeout(TIMEOUT).unwrap();
        assert!(matches!(
            notice.event,
            BackendEvent::Failed(SpeechError::VoiceResolution(_))
        ));
        assert_eq!(control.streams_opened(), 0);
    }

    #[test]
    fn test_rejects_out_of_range_rate() {
        let (backend, rx, _control) = setup(Pacing::Immediate);
        let voice = VoiceDescriptor::default().with_rate(10.0);
        backend.start(Utterance::new("hi", voice));
        assert!(matches!(
            rx.recv_timeout(TIMEOUT).unwrap().event,
            BackendEvent::Failed(SpeechError::VoiceResolution(_))
        ));
    }

    #[test]
    fn test_empty_text_finishes() {
        let (backend, rx, _control) = setup(Pacing::Immediate);
        backend.start(Utterance::new("...", VoiceDescriptor::default()));
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().event, BackendEvent::Started);
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().event, BackendEvent::Finished);
    }

    #[test]
    fn test_unavailable_mid_session_fails() {
        let (backend, rx, _control) = setup(Pacing::Manual);
        backend.start(Utterance::new("keep talking", VoiceDescriptor::default()));
        collect_until(&rx, |e| *e == BackendEvent::Started);

        backend.set_available(false);
        let events = collect_until(&rx, |e| matches!(e, BackendEvent::Failed(_)));
        assert_eq!(
            events.last(),
            Some(&BackendEvent::Failed(SpeechError::BackendUnavailable(
                "tone".into()
            )))
        );
        // The engine's cancellation is swallowed
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(!backend.is_available());
    }

    #[test]
    fn test_render_word_shape() {
        let (backend, _rx, _control) = setup(Pacing::Manual);
        let buffer = backend.render_word(0, 1.0, 1.0);
        let config = ToneConfig::default();
        let expected = (config.word_ms + config.gap_ms) as usize * 22050 / 1000;

        assert_eq!(buffer.format(), crate::playback::AudioFormat::i16(22050, 1));
        assert!((buffer.frames() as i64 - expected as i64).abs() <= 2);
        // Faster speech is shorter
        assert!(backend.render_word(0, 2.0, 1.0).frames() < buffer.frames());
    }

    #[test]
    fn test_locale_shapes() {
        assert!(is_locale("en-US"));
        assert!(is_locale("de"));
        assert!(is_locale("zh_Hant_TW"));
        assert!(!is_locale(""));
        assert!(!is_locale("english"));
        assert!(!is_locale("en-"));
    }
}
