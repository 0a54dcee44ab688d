//! Client-side call state machine.
//!
//! One [`CallStateManager`] is the single source of truth for the local
//! projection of a call attempt. Transitions are partial updates merged
//! after validation; leaving a phase runs any cleanup handlers registered
//! for it, and `reset` is the universal give-up-and-start-clean escape
//! hatch.

use super::error::CallError;
use super::media::{LocalMedia, QualitySample, RemoteMedia};
use crate::types::call::{CallId, CallKind, CallPhase};
use crate::types::user::UserId;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const MAX_MEDIA_RETRIES: u32 = 3;

/// Local view of the call in progress.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub phase: CallPhase,
    pub call_id: Option<CallId>,
    pub kind: Option<CallKind>,
    pub peer: Option<UserId>,
    pub peer_name: Option<String>,
    pub room_name: Option<String>,
    pub token: Option<String>,
    pub local_media: Option<LocalMedia>,
    pub remote_media: Option<RemoteMedia>,
    pub quality: Option<QualitySample>,
    pub entered_at: Instant,
}

impl Default for CallSession {
    fn default() -> Self {
        Self {
            phase: CallPhase::Idle,
            call_id: None,
            kind: None,
            peer: None,
            peer_name: None,
            room_name: None,
            token: None,
            local_media: None,
            remote_media: None,
            quality: None,
            entered_at: Instant::now(),
        }
    }
}

impl CallSession {
    pub fn is_in_call(&self) -> bool {
        self.phase.is_in_call()
    }
}

/// Partial update applied by [`CallStateManager::transition`].
#[derive(Default, Clone)]
pub struct CallUpdate {
    pub phase: Option<CallPhase>,
    pub call_id: Option<CallId>,
    pub kind: Option<CallKind>,
    pub peer: Option<UserId>,
    pub peer_name: Option<String>,
    pub room_name: Option<String>,
    pub token: Option<String>,
    pub local_media: Option<LocalMedia>,
    pub remote_media: Option<RemoteMedia>,
    pub quality: Option<QualitySample>,
}

impl CallUpdate {
    pub fn to_phase(phase: CallPhase) -> Self {
        Self {
            phase: Some(phase),
            ..Default::default()
        }
    }

    pub fn call_id(mut self, id: CallId) -> Self {
        self.call_id = Some(id);
        self
    }

    pub fn kind(mut self, kind: CallKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn peer(mut self, peer: UserId) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn peer_name(mut self, name: impl Into<String>) -> Self {
        self.peer_name = Some(name.into());
        self
    }

    pub fn room_name(mut self, room: impl Into<String>) -> Self {
        self.room_name = Some(room.into());
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn local_media(mut self, media: LocalMedia) -> Self {
        self.local_media = Some(media);
        self
    }

    pub fn remote_media(mut self, media: RemoteMedia) -> Self {
        self.remote_media = Some(media);
        self
    }

    pub fn quality(mut self, sample: QualitySample) -> Self {
        self.quality = Some(sample);
        self
    }
}

/// Asynchronous side effect run when the state leaves a given phase.
/// Receives a snapshot of the session as it was before the exit.
pub type CleanupHandler = Arc<dyn Fn(CallSession) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct CallStateManager {
    state: Mutex<CallSession>,
    cleanup: StdMutex<HashMap<CallPhase, Vec<CleanupHandler>>>,
    media_retries: AtomicU32,
    stuck_after: Duration,
}

impl CallStateManager {
    pub fn new(stuck_after: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CallSession::default()),
            cleanup: StdMutex::new(HashMap::new()),
            media_retries: AtomicU32::new(0),
            stuck_after,
        })
    }

    pub async fn snapshot(&self) -> CallSession {
        self.state.lock().await.clone()
    }

    pub async fn phase(&self) -> CallPhase {
        self.state.lock().await.phase
    }

    /// Registers a cleanup handler to run whenever the state leaves
    /// `phase`.
    pub fn on_exit(&self, phase: CallPhase, handler: CleanupHandler) {
        self.cleanup
            .lock()
            .expect("cleanup registry poisoned")
            .entry(phase)
            .or_default()
            .push(handler);
    }

    fn handlers_for(&self, phase: CallPhase) -> Vec<CleanupHandler> {
        self.cleanup
            .lock()
            .expect("cleanup registry poisoned")
            .get(&phase)
            .cloned()
            .unwrap_or_default()
    }

    fn edge_allowed(from: CallPhase, to: CallPhase) -> bool {
        use CallPhase::*;
        match (from, to) {
            (a, b) if a == b => true,
            (Idle, Incoming) | (Idle, Outgoing) => true,
            (Outgoing, Connecting) | (Incoming, Connecting) => true,
            (Connecting, Connected) => true,
            (from, Ended) => from.is_in_call(),
            (Ended, Idle) => true,
            _ => false,
        }
    }

    /// Merges `update` into the current state after validating the
    /// invariants. Hard violations fail; a missing local media handle
    /// while targeting `Connected` is retryable up to a bounded count.
    pub async fn transition(&self, update: CallUpdate) -> Result<CallSession, CallError> {
        let mut exited: Option<(CallPhase, CallSession)> = None;
        let snapshot = {
            let mut state = self.state.lock().await;
            let from = state.phase;
            let to = update.phase.unwrap_or(from);

            if !Self::edge_allowed(from, to) {
                return Err(CallError::InvalidTransition { from, to });
            }

            if matches!(to, CallPhase::Connecting | CallPhase::Connected)
                && state.room_name.is_none()
                && update.room_name.is_none()
            {
                return Err(CallError::MissingRoom { target: to });
            }

            if to == CallPhase::Connected
                && state.local_media.is_none()
                && update.local_media.is_none()
            {
                let tries = self.media_retries.fetch_add(1, Ordering::SeqCst) + 1;
                if tries > MAX_MEDIA_RETRIES {
                    self.media_retries.store(0, Ordering::SeqCst);
                    return Err(CallError::MediaRetriesExhausted { attempts: tries });
                }
                return Err(CallError::MediaNotReady { target: to });
            }

            if to != from {
                exited = Some((from, state.clone()));
            }

            if to == CallPhase::Idle {
                // Idle holds no call data; the invariant `in call ⇔ not
                // idle` falls out of construction.
                *state = CallSession::default();
            } else {
                state.phase = to;
                if let Some(v) = update.call_id {
                    state.call_id = Some(v);
                }
                if let Some(v) = update.kind {
                    state.kind = Some(v);
                }
                if let Some(v) = update.peer {
                    state.peer = Some(v);
                }
                if let Some(v) = update.peer_name {
                    state.peer_name = Some(v);
                }
                if let Some(v) = update.room_name {
                    state.room_name = Some(v);
                }
                if let Some(v) = update.token {
                    state.token = Some(v);
                }
                if let Some(v) = update.local_media {
                    state.local_media = Some(v);
                }
                if let Some(v) = update.remote_media {
                    state.remote_media = Some(v);
                }
                if let Some(v) = update.quality {
                    state.quality = Some(v);
                }
                if to != from {
                    state.entered_at = Instant::now();
                }
            }

            if to == CallPhase::Connected {
                self.media_retries.store(0, Ordering::SeqCst);
            }
            state.clone()
        };

        if let Some((from, old)) = exited {
            self.run_cleanup(from, old).await;
        }
        Ok(snapshot)
    }

    async fn run_cleanup(&self, phase: CallPhase, old: CallSession) {
        for handler in self.handlers_for(phase) {
            handler(old.clone()).await;
        }
    }

    /// Forces the state back to idle, running the exiting phase's cleanup
    /// handlers first. Safe to call at any time; a second call in a row
    /// is a no-op.
    pub async fn reset(&self) {
        let exited = {
            let mut state = self.state.lock().await;
            if state.phase == CallPhase::Idle {
                return;
            }
            let old = state.clone();
            *state = CallSession::default();
            old
        };
        self.media_retries.store(0, Ordering::SeqCst);
        self.run_cleanup(exited.phase, exited).await;
    }

    /// Reports a call sitting in a pending phase past the ceiling.
    pub async fn check_stuck(&self) -> Result<(), CallError> {
        let state = self.state.lock().await;
        if state.phase.is_pending() && state.entered_at.elapsed() > self.stuck_after {
            return Err(CallError::StuckTransition {
                phase: state.phase,
                secs: state.entered_at.elapsed().as_secs(),
            });
        }
        Ok(())
    }
}
