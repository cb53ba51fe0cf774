//! Per-task start lock shared by every engine (tab) on one device.
//!
//! The first engine to start a task becomes its leader and creates the remote
//! session. Engines that arrive while the claim is held wait for the leader's
//! outcome and follow the session it opened instead of creating their own.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::sync::watch;

use crate::models::ActiveSession;

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimState {
    /// The leader's create is in flight.
    Pending,
    Open(ActiveSession),
    /// The leader gave up or closed its session.
    Released,
}

#[derive(Clone, Default)]
pub struct StartLockRegistry {
    claims: Arc<Mutex<HashMap<String, Arc<watch::Sender<ClaimState>>>>>,
}

pub enum StartClaim {
    Leader(StartLease),
    Follower(watch::Receiver<ClaimState>),
}

impl StartLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<watch::Sender<ClaimState>>>> {
        self.claims
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lead the start of `task_id`, or follow whoever already does. A second
    /// start from the same engine follows too, which absorbs double clicks.
    pub fn acquire(&self, task_id: &str) -> StartClaim {
        let mut claims = self.lock();
        if let Some(claim) = claims.get(task_id) {
            if *claim.borrow() != ClaimState::Released {
                return StartClaim::Follower(claim.subscribe());
            }
        }

        let (tx, _) = watch::channel(ClaimState::Pending);
        let state = Arc::new(tx);
        claims.insert(task_id.to_string(), state.clone());

        StartClaim::Leader(StartLease {
            registry: self.clone(),
            task_id: task_id.to_string(),
            state,
        })
    }

    pub fn is_claimed(&self, task_id: &str) -> bool {
        self.lock().contains_key(task_id)
    }

    fn release(&self, task_id: &str, state: &Arc<watch::Sender<ClaimState>>) {
        let mut claims = self.lock();
        let ours = claims
            .get(task_id)
            .map_or(false, |claim| Arc::ptr_eq(claim, state));
        if ours {
            claims.remove(task_id);
        }
    }
}

/// Held by the leader for as long as its session is open. Dropping it
/// releases the claim and wakes any waiting followers.
pub struct StartLease {
    registry: StartLockRegistry,
    task_id: String,
    state: Arc<watch::Sender<ClaimState>>,
}

impl StartLease {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn open(&self, session: ActiveSession) {
        self.state.send_replace(ClaimState::Open(session));
    }
}

impl Drop for StartLease {
    fn drop(&mut self) {
        self.state.send_replace(ClaimState::Released);
        self.registry.release(&self.task_id, &self.state);
    }
}
