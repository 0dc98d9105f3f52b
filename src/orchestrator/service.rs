//! Threaded front end for the orchestrator
//!
//! The worker thread owns the [`Orchestrator`] and applies caller commands
//! and backend events in arrival order.

use crate::backend::SynthesisBackend;
use crate::config::ServiceConfig;
use crate::events::{EventBus, Subscription};
use crate::orchestrator::{Orchestrator, SpeechEvent};
use crate::utterance::{Utterance, UtteranceId};
use crate::{MurmurError, Result};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// Commands that can be sent to the orchestrator worker
pub enum OrchestratorCommand {
    RegisterBackend {
        backend: Arc<dyn SynthesisBackend>,
        preferred: bool,
    },

    UnregisterBackend(String),

    SelectBackend(String),

    /// Append to the queue
    Enqueue(Vec<Arc<Utterance>>),

    /// Cancel everything, then enqueue
    Play(Vec<Arc<Utterance>>),

    CancelAll,

    Cancel(UtteranceId),

    Pause,

    Resume,

    SetDisabled(bool),

    /// Reply with the current state
    Snapshot(Sender<OrchestratorSnapshot>),

    /// Cancel everything and stop the worker
    Shutdown,
}

/// Point-in-time view of the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSnapshot {
    pub queued: Vec<UtteranceId>,
    pub active: Option<UtteranceId>,
    pub selected_backend: Option<String>,
    pub backends: Vec<String>,
    pub disabled: bool,
}

impl OrchestratorSnapshot {
    fn of(orchestrator: &Orchestrator) -> Self {
        Self {
            queued: orchestrator.queued_ids(),
            active: orchestrator.active().map(|u| u.id()),
            selected_backend: orchestrator.selected_backend().map(str::to_string),
            backends: orchestrator.backend_ids(),
            disabled: orchestrator.is_disabled(),
        }
    }
}

/// Orchestrator plus the channels that feed its worker
pub struct OrchestratorService {
    orchestrator: Orchestrator,
    command_tx: Sender<OrchestratorCommand>,
    command_rx: Receiver<OrchestratorCommand>,
}

impl OrchestratorService {
    pub fn new(config: &ServiceConfig) -> Self {
        let (command_tx, command_rx) = bounded(config.command_capacity.max(1));
        Self {
            orchestrator: Orchestrator::new(),
            command_tx,
            command_rx,
        }
    }

    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            command_tx: self.command_tx.clone(),
            events: self.orchestrator.event_bus(),
        }
    }

    /// Start the worker thread
    pub fn start_worker(self) -> Result<JoinHandle<()>> {
        let Self {
            mut orchestrator,
            command_rx,
            ..
        } = self;

        thread::Builder::new()
            .name("murmur-orchestrator".into())
            .spawn(move || {
                info!("Orchestrator worker starting");
                let notices = orchestrator.backend_events();

                loop {
                    select! {
                        recv(command_rx) -> command => match command {
                            Ok(OrchestratorCommand::Shutdown) => {
                                info!("Orchestrator worker shutting down");
                                orchestrator.cancel_all();
                                break;
                            }
                            Ok(command) => apply(&mut orchestrator, command),
                            Err(e) => {
                                error!("Command channel error: {}", e);
                                orchestrator.cancel_all();
                                break;
                            }
                        },
                        recv(notices) -> notice => {
                            if let Ok(notice) = notice {
                                orchestrator.handle_backend_event(notice);
                            }
                        }
                    }
                }

                info!("Orchestrator worker stopped");
            })
            .map_err(|e| MurmurError::ChannelError(format!("Failed to spawn orchestrator: {}", e)))
    }
}

fn apply(orchestrator: &mut Orchestrator, command: OrchestratorCommand) {
    match command {
        OrchestratorCommand::RegisterBackend { backend, preferred } => {
            orchestrator.register_backend(backend, preferred)
        }
        OrchestratorCommand::UnregisterBackend(id) => {
            orchestrator.unregister_backend(&id);
        }
        OrchestratorCommand::SelectBackend(id) => {
            orchestrator.select_backend(&id);
        }
        OrchestratorCommand::Enqueue(utterances) => orchestrator.enqueue_all(utterances),
        OrchestratorCommand::Play(utterances) => orchestrator.play_all(utterances),
        OrchestratorCommand::CancelAll => orchestrator.cancel_all(),
        OrchestratorCommand::Cancel(id) => {
            if !orchestrator.cancel(id) {
                debug!("Nothing to cancel for {}", id);
            }
        }
        OrchestratorCommand::Pause => orchestrator.pause(),
        OrchestratorCommand::Resume => orchestrator.resume(),
        OrchestratorCommand::SetDisabled(disabled) => orchestrator.set_disabled(disabled),
        OrchestratorCommand::Snapshot(reply) => {
            let _ = reply.send(OrchestratorSnapshot::of(orchestrator));
        }
        OrchestratorCommand::Shutdown => {}
    }
}

/// Cloneable handle for talking to the orchestrator worker
#[derive(Clone)]
pub struct OrchestratorHandle {
    command_tx: Sender<OrchestratorCommand>,
    events: EventBus<SpeechEvent>,
}

impl OrchestratorHandle {
    fn send(&self, command: OrchestratorCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| MurmurError::ChannelError("Orchestrator stopped".into()))
    }

    pub fn subscribe(&self) -> Subscription<SpeechEvent> {
        self.events.subscribe()
    }

    pub fn register_backend(&self, backend: Arc<dyn SynthesisBackend>, preferred: bool) -> Result<()> {
        self.send(OrchestratorCommand::RegisterBackend { backend, preferred })
    }

    pub fn unregister_backend(&self, id: impl Into<String>) -> Result<()> {
        self.send(OrchestratorCommand::UnregisterBackend(id.into()))
    }

    pub fn select_backend(&self, id: impl Into<String>) -> Result<()> {
        self.send(OrchestratorCommand::SelectBackend(id.into()))
    }

    pub fn enqueue(&self, utterance: Arc<Utterance>) -> Result<()> {
        self.send(OrchestratorCommand::Enqueue(vec![utterance]))
    }

    pub fn enqueue_all(&self, utterances: Vec<Arc<Utterance>>) -> Result<()> {
        self.send(OrchestratorCommand::Enqueue(utterances))
    }

    pub fn play(&self, utterance: Arc<Utterance>) -> Result<()> {
        self.send(OrchestratorCommand::Play(vec![utterance]))
    }

    pub fn play_all(&self, utterances: Vec<Arc<Utterance>>) -> Result<()> {
        self.send(OrchestratorCommand::Play(utterances))
    }

    pub fn cancel_all(&self) -> Result<()> {
        self.send(OrchestratorCommand::CancelAll)
    }

    pub fn cancel(&self, id: UtteranceId) -> Result<()> {
        self.send(OrchestratorCommand::Cancel(id))
    }

    pub fn pause(&self) -> Result<()> {
        self.send(OrchestratorCommand::Pause)
    }

    pub fn resume(&self) -> Result<()> {
        self.send(OrchestratorCommand::Resume)
    }

    pub fn set_disabled(&self, disabled: bool) -> Result<()> {
        self.send(OrchestratorCommand::SetDisabled(disabled))
    }

    /// Ask the worker for its state; waits for the reply
    pub fn snapshot(&self) -> Result<OrchestratorSnapshot> {
        let (tx, rx) = bounded(1);
        self.send(OrchestratorCommand::Snapshot(tx))?;
        rx.recv()
            .map_err(|_| MurmurError::ChannelError("Orchestrator stopped".into()))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(OrchestratorCommand::Shutdown)
    }
}
