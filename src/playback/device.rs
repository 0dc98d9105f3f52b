//! Arbitration of the physical output device between producers
//!
//! Producers claim the device before opening an output path and receive
//! [`Revocation`]s on their own channel when another claim preempts them.
//! Revocations are asynchronous: a holder must compare the revoked token
//! against the one it currently holds and ignore stale ones.

use crate::{MurmurError, Result};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identity of a producer competing for the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(Uuid);

impl OwnerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for one granted claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClaimToken(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimMode {
    /// Preempts every other holder
    #[default]
    Exclusive,
    /// Coexists with other shared holders, preempts exclusive ones
    Shared,
}

/// Notification that a claim was taken away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Revocation {
    pub token: ClaimToken,
    pub owner: OwnerId,
}

struct Holder {
    token: ClaimToken,
    owner: OwnerId,
    mode: ClaimMode,
    running: bool,
    revocations: Sender<Revocation>,
}

struct ArbiterState {
    holders: Vec<Holder>,
    next_token: u64,
    available: bool,
}

/// Shared arbiter; clones refer to the same device
#[derive(Clone)]
pub struct DeviceArbitrator {
    state: Arc<Mutex<ArbiterState>>,
}

impl DeviceArbitrator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ArbiterState {
                holders: Vec::new(),
                next_token: 1,
                available: true,
            })),
        }
    }

    /// Claim the device for `owner`.
    ///
    /// Holders preempted by this claim are notified after the state lock is
    /// released. A previous claim by the same owner is replaced silently.
    pub fn claim(
        &self,
        owner: OwnerId,
        mode: ClaimMode,
        revocations: Sender<Revocation>,
    ) -> Result<ClaimToken> {
        let (token, preempted) = {
            let mut state = self.state.lock();
            if !state.available {
                return Err(MurmurError::AudioDeviceError(
                    "Output device unavailable".into(),
                ));
            }

            let token = ClaimToken(state.next_token);
            state.next_token += 1;

            let mut preempted = Vec::new();
            let mut kept = Vec::with_capacity(state.holders.len());
            for holder in state.holders.drain(..) {
                if holder.owner == owner {
                    continue;
                }
                let conflicts = mode == ClaimMode::Exclusive || holder.mode == ClaimMode::Exclusive;
                if conflicts {
                    preempted.push(holder);
                } else {
                    kept.push(holder);
                }
            }
            kept.push(Holder {
                token,
                owner,
                mode,
                running: false,
                revocations,
            });
            state.holders = kept;

            (token, preempted)
        };

        debug!("Device claimed ({:?}) with token {:?}", mode, token);
        notify(preempted);
        Ok(token)
    }

    /// Give a claim back. Returns false if it was already gone.
    pub fn release(&self, token: ClaimToken) -> bool {
        let mut state = self.state.lock();
        let before = state.holders.len();
        state.holders.retain(|h| h.token != token);
        before != state.holders.len()
    }

    /// Mark the holder as actively rendering
    pub fn start(&self, token: ClaimToken) -> bool {
        self.set_running(token, true)
    }

    pub fn stop(&self, token: ClaimToken) -> bool {
        self.set_running(token, false)
    }

    fn set_running(&self, token: ClaimToken, running: bool) -> bool {
        let mut state = self.state.lock();
        match state.holders.iter_mut().find(|h| h.token == token) {
            Some(holder) => {
                holder.running = running;
                true
            }
            None => false,
        }
    }

    /// Whether any holder is rendering
    pub fn is_running(&self) -> bool {
        self.state.lock().holders.iter().any(|h| h.running)
    }

    pub fn is_held(&self, token: ClaimToken) -> bool {
        self.state.lock().holders.iter().any(|h| h.token == token)
    }

    pub fn holder_count(&self) -> usize {
        self.state.lock().holders.len()
    }

    /// Revoke every claim, e.g. when the system takes the device away
    pub fn revoke_all(&self) {
        let revoked: Vec<Holder> = self.state.lock().holders.drain(..).collect();
        if !revoked.is_empty() {
            info!("Revoking {} device claim(s)", revoked.len());
        }
        notify(revoked);
    }

    /// Mark the device as plugged in or out. Unplugging revokes every claim.
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
        if !available {
            warn!("Output device became unavailable");
            self.revoke_all();
        }
    }

    pub fn is_available(&self) -> bool {
        self.state.lock().available
    }
}

impl Default for DeviceArbitrator {
    fn default() -> Self {
        Self::new()
    }
}

fn notify(holders: Vec<Holder>) {
    for holder in holders {
        // The holder may already be gone
        let _ = holder.revocations.send(Revocation {
            token: holder.token,
            owner: holder.owner,
        });
    }
}
