//! Streaming playback engine
//!
//! Owns at most one playback session, keyed by the utterance id that
//! produced its audio. All session state lives on the engine thread; callers
//! talk to it through an [`EngineHandle`], and the realtime output path
//! reports finished buffers through the same inbox so completions are
//! ordered after every `play` that was already queued.
//!
//! There is no end-of-stream marker: a session ends when its in-flight
//! buffer count drops back to zero. At most `stream_window` buffers sit in
//! the output at once; the rest wait in the session backlog and move over
//! as completions arrive.

use crate::config::EngineConfig;
use crate::events::{EventBus, Subscription};
use crate::playback::converter::{ConverterFactory, FormatConverter, RubatoConverterFactory};
use crate::playback::device::{ClaimToken, DeviceArbitrator, OwnerId, Revocation};
use crate::playback::format::{AudioFormat, PlaybackBuffer};
use crate::playback::output::{CompletionNotifier, OutputDevice, OutputStream, StreamHooks};
use crate::playback::spectrum::SpectrumPublisher;
use crate::playback::tap::Tap;
use crate::utterance::UtteranceId;
use crate::{MurmurError, Result};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender, TryRecvError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Ids of recently ended sessions, used to drop late buffers
const RETIRED_IDS: usize = 64;

/// Why a session failed. Always scoped to one session id.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineFailure {
    #[error("output initialization failed: {0}")]
    OutputInit(String),

    #[error("device claim refused: {0}")]
    DeviceClaim(String),

    #[error("converter initialization failed: {0}")]
    ConverterInit(String),

    #[error("unsupported buffer format {0}")]
    UnsupportedFormat(AudioFormat),

    #[error("conversion failed: {0}")]
    Conversion(String),

    #[error("scheduling failed: {0}")]
    Schedule(String),
}

/// Session status published by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    Started(UtteranceId),
    /// The `index`th buffer passed to `play` for this session began playing
    BufferStarted { id: UtteranceId, index: usize },
    /// Every scheduled buffer played out
    Stopped(UtteranceId),
    /// Torn down by `stop`, an id switch or device preemption
    Cancelled(UtteranceId),
    Failed {
        id: UtteranceId,
        failure: PipelineFailure,
    },
}

impl SessionStatus {
    pub fn id(&self) -> UtteranceId {
        match self {
            SessionStatus::Started(id)
            | SessionStatus::BufferStarted { id, .. }
            | SessionStatus::Stopped(id)
            | SessionStatus::Cancelled(id)
            | SessionStatus::Failed { id, .. } => *id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            SessionStatus::Started(_) | SessionStatus::BufferStarted { .. }
        )
    }
}

pub(crate) enum EngineMessage {
    Play {
        id: UtteranceId,
        buffer: PlaybackBuffer,
    },
    Pause,
    Resume,
    Stop,
    BufferDone {
        session: u64,
        samples: Vec<f32>,
    },
    Shutdown,
}

/// Collaborators the engine is built from
pub struct EngineParts {
    pub device: Box<dyn OutputDevice>,
    pub arbitrator: DeviceArbitrator,
    pub converters: Box<dyn ConverterFactory>,
    pub spectrum: Option<Arc<dyn SpectrumPublisher>>,
}

impl EngineParts {
    pub fn new(device: Box<dyn OutputDevice>) -> Self {
        Self {
            device,
            arbitrator: DeviceArbitrator::new(),
            converters: Box::new(RubatoConverterFactory),
            spectrum: None,
        }
    }

    pub fn with_arbitrator(mut self, arbitrator: DeviceArbitrator) -> Self {
        self.arbitrator = arbitrator;
        self
    }

    pub fn with_converters(mut self, converters: Box<dyn ConverterFactory>) -> Self {
        self.converters = converters;
        self
    }

    pub fn with_spectrum(mut self, spectrum: Arc<dyn SpectrumPublisher>) -> Self {
        self.spectrum = Some(spectrum);
        self
    }
}

struct Session {
    id: UtteranceId,
    seq: u64,
    claim: ClaimToken,
    stream: Box<dyn OutputStream>,
    tap: Tap,
    converter: Option<Box<dyn FormatConverter>>,
    /// Converted buffers not yet handed to the output, tagged with the index
    /// of the `play` they came from. The converter tail has no index.
    backlog: VecDeque<(Option<usize>, Vec<f32>)>,
    /// Indices of the buffers handed to the output, oldest first
    streaming: VecDeque<Option<usize>>,
    /// Buffers accepted through `play`
    accepted: usize,
    flushed: bool,
}

impl Session {
    fn in_flight(&self) -> usize {
        self.backlog.len() + self.streaming.len()
    }

    /// Move backlog buffers into the output while the window has room
    fn feed(
        &mut self,
        window: usize,
        status: &EventBus<SessionStatus>,
    ) -> std::result::Result<(), PipelineFailure> {
        while self.streaming.len() < window {
            let Some((index, samples)) = self.backlog.pop_front() else {
                break;
            };
            self.stream
                .schedule(samples)
                .map_err(|e| PipelineFailure::Schedule(e.to_string()))?;
            self.streaming.push_back(index);
            if self.streaming.len() == 1 {
                self.announce(index, status);
            }
        }
        Ok(())
    }

    fn announce(&self, index: Option<usize>, status: &EventBus<SessionStatus>) {
        if let Some(index) = index {
            status.publish(SessionStatus::BufferStarted { id: self.id, index });
        }
    }
}

/// Channels and shared state visible from both sides of the engine
struct Shared {
    inbox_tx: Sender<EngineMessage>,
    inbox_rx: Receiver<EngineMessage>,
    status: EventBus<SessionStatus>,
    clock: Arc<AtomicU64>,
}

impl Shared {
    fn new(capacity: usize) -> Self {
        let (inbox_tx, inbox_rx) = bounded(capacity.max(1));
        Self {
            inbox_tx,
            inbox_rx,
            status: EventBus::new(),
            clock: Arc::new(AtomicU64::new(0)),
        }
    }

    fn handle(&self, native: AudioFormat) -> EngineHandle {
        EngineHandle {
            inbox: self.inbox_tx.clone(),
            status: self.status.clone(),
            clock: Arc::clone(&self.clock),
            native,
        }
    }
}

/// Engine state. Lives on one thread; see [`PlaybackEngine::spawn`].
pub struct PlaybackEngine {
    config: EngineConfig,
    native: AudioFormat,
    owner: OwnerId,
    parts: EngineParts,
    shared: Shared,
    revocation_tx: Sender<Revocation>,
    revocation_rx: Receiver<Revocation>,
    session: Option<Session>,
    next_session: u64,
    retired: VecDeque<UtteranceId>,
}

impl PlaybackEngine {
    /// Build an engine driven by the calling thread.
    ///
    /// Messages sent through [`PlaybackEngine::handle`] queue up until
    /// [`PlaybackEngine::process_pending`] runs.
    pub fn new(config: EngineConfig, parts: EngineParts) -> Self {
        let shared = Shared::new(config.inbox_capacity);
        Self::with_shared(config, parts, shared)
    }

    fn with_shared(config: EngineConfig, parts: EngineParts, shared: Shared) -> Self {
        let (revocation_tx, revocation_rx) = unbounded();
        Self {
            native: config.native_format(),
            config,
            owner: OwnerId::new(),
            parts,
            shared,
            revocation_tx,
            revocation_rx,
            session: None,
            next_session: 1,
            retired: VecDeque::with_capacity(RETIRED_IDS),
        }
    }

    /// Run an engine on its own thread
    pub fn spawn(config: EngineConfig, parts: EngineParts) -> Result<(EngineHandle, JoinHandle<()>)> {
        let shared = Shared::new(config.inbox_capacity);
        let handle = shared.handle(config.native_format());

        // Output streams are not Send, so the engine is built on its thread
        let join = thread::Builder::new()
            .name("murmur-playback".into())
            .spawn(move || {
                info!("Playback engine starting");
                PlaybackEngine::with_shared(config, parts, shared).run();
                info!("Playback engine stopped");
            })
            .map_err(|e| MurmurError::ChannelError(format!("Failed to spawn engine: {}", e)))?;

        Ok((handle, join))
    }

    pub fn handle(&self) -> EngineHandle {
        self.shared.handle(self.native)
    }

    pub fn native_format(&self) -> AudioFormat {
        self.native
    }

    pub fn subscribe(&self) -> Subscription<SessionStatus> {
        self.shared.status.subscribe()
    }

    pub fn active_session(&self) -> Option<UtteranceId> {
        self.session.as_ref().map(|s| s.id)
    }

    /// Buffers of the live session not yet played, backlog included
    pub fn in_flight(&self) -> usize {
        self.session.as_ref().map(|s| s.in_flight()).unwrap_or(0)
    }

    /// Device claim held by the live session
    pub fn claim(&self) -> Option<ClaimToken> {
        self.session.as_ref().map(|s| s.claim)
    }

    fn run(mut self) {
        let inbox = self.shared.inbox_rx.clone();
        let revocations = self.revocation_rx.clone();

        loop {
            select! {
                recv(inbox) -> msg => match msg {
                    Ok(msg) => {
                        if !self.handle_message(msg) {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                recv(revocations) -> revocation => {
                    if let Ok(revocation) = revocation {
                        self.handle_revocation(revocation);
                    }
                }
            }
        }

        self.stop();
    }

    /// Handle everything queued so far without blocking.
    ///
    /// Returns false once a shutdown was processed.
    pub fn process_pending(&mut self) -> bool {
        while let Ok(revocation) = self.revocation_rx.try_recv() {
            self.handle_revocation(revocation);
        }

        loop {
            match self.shared.inbox_rx.try_recv() {
                Ok(msg) => {
                    if !self.handle_message(msg) {
                        self.stop();
                        return false;
                    }
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn handle_message(&mut self, msg: EngineMessage) -> bool {
        match msg {
            EngineMessage::Play { id, buffer } => self.play(id, buffer),
            EngineMessage::Pause => self.pause(),
            EngineMessage::Resume => self.resume(),
            EngineMessage::Stop => self.stop(),
            EngineMessage::BufferDone { session, samples } => {
                drop(samples);
                self.buffer_done(session);
            }
            EngineMessage::Shutdown => return false,
        }
        true
    }

    /// Schedule `buffer` for `id`, starting a new session if `id` is not the
    /// live one
    pub fn play(&mut self, id: UtteranceId, buffer: PlaybackBuffer) {
        if self.session.as_ref().map(|s| s.id) != Some(id) {
            if self.retired.contains(&id) {
                debug!("Dropping late buffer for finished session {}", id);
                return;
            }

            self.stop();
            if let Err(failure) = self.open_session(id) {
                warn!("Session {} failed to start: {}", id, failure);
                self.retire(id);
                self.shared.status.publish(SessionStatus::Failed { id, failure });
                return;
            }
            self.shared.status.publish(SessionStatus::Started(id));
        }

        if let Err(failure) = self.schedule(buffer) {
            warn!("Session {} failed: {}", id, failure);
            self.teardown();
            self.shared.status.publish(SessionStatus::Failed { id, failure });
        }
    }

    fn open_session(&mut self, id: UtteranceId) -> std::result::Result<(), PipelineFailure> {
        let seq = self.next_session;
        self.next_session += 1;

        let claim = self
            .parts
            .arbitrator
            .claim(self.owner, self.config.claim_mode, self.revocation_tx.clone())
            .map_err(|e| PipelineFailure::DeviceClaim(e.to_string()))?;

        let (tap, writer) = Tap::install(
            self.native,
            self.config.tap_block_frames,
            self.parts.spectrum.clone(),
            Arc::clone(&self.shared.clock),
        );
        let hooks = StreamHooks {
            completions: CompletionNotifier::new(seq, self.shared.inbox_tx.clone()),
            tap: writer,
        };

        let stream = match self.parts.device.open(self.native, hooks) {
            Ok(stream) => stream,
            Err(e) => {
                self.parts.arbitrator.release(claim);
                tap.remove();
                return Err(PipelineFailure::OutputInit(e.to_string()));
            }
        };

        self.parts.arbitrator.start(claim);
        info!("Playback session {} started", id);

        self.session = Some(Session {
            id,
            seq,
            claim,
            stream,
            tap,
            converter: None,
            backlog: VecDeque::new(),
            streaming: VecDeque::new(),
            accepted: 0,
            flushed: false,
        });
        Ok(())
    }

    fn schedule(&mut self, buffer: PlaybackBuffer) -> std::result::Result<(), PipelineFailure> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        let format = buffer.format();
        let samples = if format == self.native {
            buffer.into_f32()
        } else {
            let converter = match session.converter.take() {
                Some(converter) => converter,
                None => {
                    debug!("Session {} converting from {}", session.id, format);
                    self.parts
                        .converters
                        .create(format, self.native)
                        .map_err(|e| PipelineFailure::ConverterInit(e.to_string()))?
                }
            };
            let converter = session.converter.insert(converter);

            if converter.source() != format {
                return Err(PipelineFailure::UnsupportedFormat(format));
            }

            converter
                .convert(&buffer)
                .map_err(|e| PipelineFailure::Conversion(e.to_string()))?
        };

        session.backlog.push_back((Some(session.accepted), samples));
        session.accepted += 1;
        session.flushed = false;
        session.feed(self.config.stream_window, &self.shared.status)
    }

    fn buffer_done(&mut self, seq: u64) {
        let window = self.config.stream_window;
        let status = &self.shared.status;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.seq != seq {
            debug!("Ignoring completion from ended session {}", seq);
            return;
        }

        session.streaming.pop_front();
        if let Some(next) = session.streaming.front() {
            session.announce(*next, status);
        }
        let mut result = session.feed(window, status);

        // Drained: let the converter release what it still holds, once
        if result.is_ok() && session.in_flight() == 0 && !session.flushed {
            session.flushed = true;
            if let Some(converter) = session.converter.as_mut() {
                match converter.flush() {
                    Ok(tail) if !tail.is_empty() => {
                        session.backlog.push_back((None, tail));
                        result = session.feed(window, status);
                    }
                    Ok(_) => {}
                    Err(e) => result = Err(PipelineFailure::Conversion(e.to_string())),
                }
            }
        }

        let id = session.id;
        let drained = session.in_flight() == 0;
        match result {
            Err(failure) => {
                warn!("Session {} failed: {}", id, failure);
                self.teardown();
                self.shared.status.publish(SessionStatus::Failed { id, failure });
            }
            Ok(()) if drained => {
                if self.teardown().is_some() {
                    info!("Playback session {} finished", id);
                    self.shared.status.publish(SessionStatus::Stopped(id));
                }
            }
            Ok(()) => {}
        }
    }

    pub fn pause(&mut self) {
        if let Some(session) = self.session.as_mut() {
            if let Err(e) = session.stream.pause() {
                error!("Failed to pause session {}: {}", session.id, e);
            }
        }
    }

    pub fn resume(&mut self) {
        if let Some(session) = self.session.as_mut() {
            if let Err(e) = session.stream.resume() {
                error!("Failed to resume session {}: {}", session.id, e);
            }
        }
    }

    /// Cancel the live session, if any
    pub fn stop(&mut self) {
        if let Some(id) = self.teardown() {
            info!("Playback session {} cancelled", id);
            self.shared.status.publish(SessionStatus::Cancelled(id));
        }
    }

    fn handle_revocation(&mut self, revocation: Revocation) {
        match self.session.as_ref().map(|s| (s.id, s.claim)) {
            Some((id, claim)) if claim == revocation.token => {
                info!("Device claim revoked, stopping session {}", id);
                self.stop();
            }
            _ => debug!("Ignoring stale revocation {:?}", revocation.token),
        }
    }

    /// Release the claim, detach output and tap. Publishes nothing.
    fn teardown(&mut self) -> Option<UtteranceId> {
        let session = self.session.take()?;
        let Session {
            id,
            claim,
            stream,
            tap,
            ..
        } = session;

        self.parts.arbitrator.stop(claim);
        self.parts.arbitrator.release(claim);
        drop(stream);
        tap.remove();
        self.retire(id);
        Some(id)
    }

    fn retire(&mut self, id: UtteranceId) {
        if self.retired.len() == RETIRED_IDS {
            self.retired.pop_front();
        }
        self.retired.push_back(id);
    }
}

/// Cloneable front end of a running engine
#[derive(Clone)]
pub struct EngineHandle {
    inbox: Sender<EngineMessage>,
    status: EventBus<SessionStatus>,
    clock: Arc<AtomicU64>,
    native: AudioFormat,
}

impl EngineHandle {
    fn send(&self, msg: EngineMessage) -> Result<()> {
        self.inbox
            .send(msg)
            .map_err(|_| MurmurError::ChannelError("Playback engine stopped".into()))
    }

    pub fn play(&self, id: UtteranceId, buffer: PlaybackBuffer) -> Result<()> {
        self.send(EngineMessage::Play { id, buffer })
    }

    pub fn pause(&self) -> Result<()> {
        self.send(EngineMessage::Pause)
    }

    pub fn resume(&self) -> Result<()> {
        self.send(EngineMessage::Resume)
    }

    pub fn stop(&self) -> Result<()> {
        self.send(EngineMessage::Stop)
    }

    /// Stop the live session and end the engine thread
    pub fn shutdown(&self) -> Result<()> {
        self.send(EngineMessage::Shutdown)
    }

    pub fn subscribe(&self) -> Subscription<SessionStatus> {
        self.status.subscribe()
    }

    /// Audio played so far in the live (or last) session
    pub fn elapsed(&self) -> Duration {
        self.native
            .frames_to_duration(self.clock.load(Ordering::SeqCst))
    }

    pub fn native_format(&self) -> AudioFormat {
        self.native
    }
}
