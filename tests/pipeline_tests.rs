//! End-to-end tests: orchestrator worker, tone backend and playback engine
//! wired together over a headless output.

use crossbeam_channel::unbounded;
use murmur::backend::ScriptedReaction;
use murmur::config::{EngineConfig, ServiceConfig, ToneConfig};
use murmur::playback::device::{ClaimMode, DeviceArbitrator, OwnerId};
use murmur::playback::output::VirtualOutputControl;
use murmur::playback::{
    EngineParts, Pacing, PlaybackEngine, SpectrumAnalyzer, SpectrumEvent, VirtualOutputDevice,
};
use murmur::{
    OrchestratorHandle, OrchestratorService, ScriptedBackend, SpeechError, SpeechEvent,
    Subscription, ToneBackend, Utterance, UtteranceId, UtteranceStatus, VoiceDescriptor,
};
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

struct Rig {
    orchestrator: OrchestratorHandle,
    events: Subscription<SpeechEvent>,
    output: VirtualOutputControl,
    arbitrator: DeviceArbitrator,
    tone: Arc<ToneBackend>,
}

fn rig(pacing: Pacing, spectrum: Option<Arc<SpectrumAnalyzer>>) -> Rig {
    let device = VirtualOutputDevice::new(pacing);
    let output = device.control();
    let arbitrator = DeviceArbitrator::new();
    let mut parts = EngineParts::new(Box::new(device)).with_arbitrator(arbitrator.clone());
    if let Some(analyzer) = spectrum {
        parts = parts.with_spectrum(analyzer);
    }
    let (engine, _) = PlaybackEngine::spawn(EngineConfig::default(), parts).unwrap();
    let tone = ToneBackend::new("tone", ToneConfig::default(), engine).unwrap();

    let service = OrchestratorService::new(&ServiceConfig::default());
    let orchestrator = service.handle();
    let events = orchestrator.subscribe();
    service.start_worker().unwrap();
    orchestrator.register_backend(tone.clone(), true).unwrap();

    Rig {
        orchestrator,
        events,
        output,
        arbitrator,
        tone,
    }
}

/// Collect events up to and including the first one matching `stop`
fn wait_for(
    events: &Subscription<SpeechEvent>,
    stop: impl Fn(&SpeechEvent) -> bool,
) -> Vec<SpeechEvent> {
    let mut seen = Vec::new();
    while let Some(event) = events.recv_timeout(TIMEOUT) {
        let done = stop(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
    panic!("timed out; saw {:?}", seen);
}

/// Poll `condition` until it holds or the timeout passes
fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + TIMEOUT;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

/// Complete buffers as they arrive until the queue drains
fn play_out(rig: &Rig) -> Vec<SpeechEvent> {
    let deadline = std::time::Instant::now() + TIMEOUT;
    let mut seen = Vec::new();
    while std::time::Instant::now() < deadline {
        rig.output.complete_all();
        if let Some(event) = rig.events.recv_timeout(Duration::from_millis(20)) {
            let done = event == SpeechEvent::QueueDrained;
            seen.push(event);
            if done {
                return seen;
            }
        }
    }
    panic!("queue never drained; saw {:?}", seen);
}

fn status_is(id: UtteranceId, wanted: UtteranceStatus) -> impl Fn(&SpeechEvent) -> bool {
    move |event| {
        matches!(event, SpeechEvent::Status { utterance, status }
            if *utterance == id && *status == wanted)
    }
}

fn statuses_of(events: &[SpeechEvent], id: UtteranceId) -> Vec<UtteranceStatus> {
    events
        .iter()
        .filter_map(|event| match event {
            SpeechEvent::Status { utterance, status } if *utterance == id => Some(*status),
            _ => None,
        })
        .collect()
}

#[test]
fn test_queue_plays_in_order() {
    let rig = rig(Pacing::Immediate, None);
    let batch: Vec<_> = ["first one", "second", "third and last"]
        .iter()
        .map(|text| Utterance::new(*text, VoiceDescriptor::default()))
        .collect();

    rig.orchestrator.enqueue_all(batch.clone()).unwrap();
    let events = wait_for(&rig.events, |e| *e == SpeechEvent::QueueDrained);

    let finished: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            SpeechEvent::Status {
                utterance,
                status: UtteranceStatus::Finished,
            } => Some(*utterance),
            _ => None,
        })
        .collect();
    assert_eq!(finished, batch.iter().map(|u| u.id()).collect::<Vec<_>>());

    for utterance in &batch {
        assert_eq!(
            statuses_of(&events, utterance.id()),
            vec![
                UtteranceStatus::Queued,
                UtteranceStatus::Preparing,
                UtteranceStatus::Speaking,
                UtteranceStatus::Finished
            ]
        );
    }
    // Six words, one buffer each, plus a resampler tail per utterance
    assert_eq!(rig.output.buffers_scheduled(), 9);
    assert_eq!(rig.output.streams_opened(), 3);
    assert!(!rig.arbitrator.is_running());
}

#[test]
fn test_word_boundaries_slice_text() {
    let rig = rig(Pacing::Immediate, None);
    let utterance = Utterance::new("Hello world", VoiceDescriptor::default());
    let own = utterance.subscribe();

    rig.orchestrator.enqueue(utterance.clone()).unwrap();
    let events = wait_for(&rig.events, |e| *e == SpeechEvent::QueueDrained);

    let words: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            SpeechEvent::WordBoundary { boundary, .. } => boundary.slice(utterance.text()),
            _ => None,
        })
        .collect();
    assert_eq!(words, vec!["Hello", "world"]);
    assert_eq!(own.drain().len(), 6);
}

#[test]
fn test_cancel_active_then_next_plays() {
    let rig = rig(Pacing::Manual, None);
    let first = Utterance::new("never finishes", VoiceDescriptor::default());
    let second = Utterance::new("next", VoiceDescriptor::default());

    rig.orchestrator
        .enqueue_all(vec![first.clone(), second.clone()])
        .unwrap();
    wait_for(&rig.events, status_is(first.id(), UtteranceStatus::Speaking));

    rig.orchestrator.cancel(first.id()).unwrap();
    wait_for(&rig.events, status_is(second.id(), UtteranceStatus::Speaking));
    assert_eq!(first.status(), UtteranceStatus::Cancelled);

    // Let the second utterance play out
    assert!(eventually(|| rig.output.pending() == 1));
    play_out(&rig);
    assert_eq!(second.status(), UtteranceStatus::Finished);
}

#[test]
fn test_pause_and_resume_reach_output() {
    let rig = rig(Pacing::Manual, None);
    let utterance = Utterance::new("hold this", VoiceDescriptor::default());

    rig.orchestrator.enqueue(utterance.clone()).unwrap();
    wait_for(&rig.events, status_is(utterance.id(), UtteranceStatus::Speaking));

    rig.orchestrator.pause().unwrap();
    wait_for(&rig.events, status_is(utterance.id(), UtteranceStatus::Paused));
    // The engine applies the pause on its own thread
    assert!(eventually(|| rig.output.is_paused()));

    rig.orchestrator.resume().unwrap();
    wait_for(&rig.events, status_is(utterance.id(), UtteranceStatus::Speaking));
    assert!(eventually(|| !rig.output.is_paused()));
    rig.orchestrator.cancel_all().unwrap();
}

#[test]
fn test_device_preemption_cancels_utterance() {
    let rig = rig(Pacing::Manual, None);
    let utterance = Utterance::new("interrupted", VoiceDescriptor::default());

    rig.orchestrator.enqueue(utterance.clone()).unwrap();
    wait_for(&rig.events, status_is(utterance.id(), UtteranceStatus::Speaking));

    let (tx, _rx) = unbounded();
    rig.arbitrator
        .claim(OwnerId::new(), ClaimMode::Exclusive, tx)
        .unwrap();

    wait_for(&rig.events, |e| *e == SpeechEvent::QueueDrained);
    assert_eq!(utterance.status(), UtteranceStatus::Cancelled);
    assert_eq!(rig.arbitrator.holder_count(), 1);
}

#[test]
fn test_backend_loss_fails_and_falls_back() {
    let rig = rig(Pacing::Manual, None);
    let fallback = ScriptedBackend::new("fallback", ScriptedReaction::Finish);
    rig.orchestrator.register_backend(fallback.clone(), false).unwrap();

    let first = Utterance::new("cut short", VoiceDescriptor::default());
    let second = Utterance::new("carried on", VoiceDescriptor::default());
    rig.orchestrator
        .enqueue_all(vec![first.clone(), second.clone()])
        .unwrap();
    wait_for(&rig.events, status_is(first.id(), UtteranceStatus::Speaking));

    rig.tone.set_available(false);
    let events = wait_for(&rig.events, |e| *e == SpeechEvent::QueueDrained);

    assert!(events.contains(&SpeechEvent::Failed {
        utterance: first.id(),
        error: SpeechError::BackendUnavailable("tone".into()),
    }));
    assert_eq!(second.status(), UtteranceStatus::Finished);
    assert_eq!(fallback.started_ids(), vec![second.id()]);
}

#[test]
fn test_bad_voice_fails_without_audio() {
    let rig = rig(Pacing::Immediate, None);
    let voice = VoiceDescriptor::default().with_pitch(0.0);
    let utterance = Utterance::new("unheard", voice);

    rig.orchestrator.enqueue(utterance.clone()).unwrap();
    let events = wait_for(&rig.events, |e| *e == SpeechEvent::QueueDrained);

    assert!(events
        .iter()
        .any(|e| matches!(e, SpeechEvent::Failed { error: SpeechError::VoiceResolution(_), .. })));
    assert_eq!(utterance.status(), UtteranceStatus::Failed);
    assert_eq!(rig.output.streams_opened(), 0);
}

#[test]
fn test_no_backend_empties_queue() {
    let service = OrchestratorService::new(&ServiceConfig::default());
    let orchestrator = service.handle();
    let events = orchestrator.subscribe();
    service.start_worker().unwrap();

    let utterance = Utterance::new("nobody home", VoiceDescriptor::default());
    orchestrator.enqueue(utterance.clone()).unwrap();
    let seen = wait_for(&events, |e| *e == SpeechEvent::QueueDrained);

    assert!(seen.contains(&SpeechEvent::Failed {
        utterance: utterance.id(),
        error: SpeechError::NoBackendAvailable,
    }));
    assert!(orchestrator.snapshot().unwrap().queued.is_empty());

    // A failed utterance can be retried as a fresh one
    let retry = utterance.retry();
    assert_ne!(retry.id(), utterance.id());
    assert_eq!(retry.status(), UtteranceStatus::None);
}

#[test]
fn test_spectrum_follows_playback() {
    let analyzer = SpectrumAnalyzer::new(1024);
    let frames = analyzer.subscribe();
    let rig = rig(Pacing::Immediate, Some(analyzer));

    rig.orchestrator
        .enqueue(Utterance::new("tone", VoiceDescriptor::default()))
        .unwrap();
    wait_for(&rig.events, |e| *e == SpeechEvent::QueueDrained);

    let mut peaks = Vec::new();
    loop {
        match frames.recv_timeout(TIMEOUT) {
            Some(SpectrumEvent::Frame(frame)) => peaks.extend(frame.peak_frequency()),
            Some(SpectrumEvent::End) => break,
            None => panic!("no end of spectrum"),
        }
    }

    let base = ToneConfig::default().base_frequency;
    let bin = 48000.0 / 1024.0;
    assert!(peaks.iter().any(|peak| (peak - base).abs() <= 2.0 * bin));
}

#[test]
fn test_words_reported_as_they_play() {
    let rig = rig(Pacing::Manual, None);
    let utterance = Utterance::new("alpha beta gamma", VoiceDescriptor::default());

    rig.orchestrator.enqueue(utterance.clone()).unwrap();
    let events = wait_for(&rig.events, |e| matches!(e, SpeechEvent::WordBoundary { .. }));
    assert_eq!(
        statuses_of(&events, utterance.id()).last(),
        Some(&UtteranceStatus::Speaking)
    );

    // One word per finished burst
    for expected in ["beta", "gamma"] {
        assert!(rig.output.complete_next());
        let events = wait_for(&rig.events, |e| matches!(e, SpeechEvent::WordBoundary { .. }));
        assert!(matches!(events.last(),
            Some(SpeechEvent::WordBoundary { boundary, .. }) if boundary.word == expected));
    }

    let rest = play_out(&rig);
    assert!(!rest
        .iter()
        .any(|e| matches!(e, SpeechEvent::WordBoundary { .. })));
    assert_eq!(utterance.status(), UtteranceStatus::Finished);
}

#[test]
fn test_failed_utterance_leaves_active_set() {
    let rig = rig(Pacing::Manual, None);
    let first = Utterance::new("cut short", VoiceDescriptor::default());
    let second = Utterance::new("carried on", VoiceDescriptor::default());
    rig.orchestrator
        .enqueue_all(vec![first.clone(), second.clone()])
        .unwrap();
    wait_for(&rig.events, status_is(first.id(), UtteranceStatus::Speaking));

    rig.tone.set_available(false);
    wait_for(&rig.events, |e| matches!(e, SpeechEvent::Failed { .. }));
    wait_for(&rig.events, |e| *e == SpeechEvent::QueueDrained);

    assert_eq!(first.status(), UtteranceStatus::Failed);
    assert!([&first, &second].iter().all(|u| !u.status().is_active()));
}
