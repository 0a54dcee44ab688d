//! Shared fakes for the unit and integration suites. No mock
//! frameworks; these are small scriptable implementations of the crate's
//! trait seams.

use crate::calls::media::{
    LocalMedia, MediaEngine, MediaError, MediaSession, QualitySample, RemoteMedia,
};
use crate::directory::Directory;
use crate::pending::{AckOutcome, PendingAcks};
use crate::protocol::SignalingEvent;
use crate::socket::{Result as SocketResult, SocketError, Transport};
use crate::types::call::CallKind;
use crate::types::user::UserId;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// In-memory transport that records every sent event and can feed acks
/// (or rejections) straight back into a pending table.
pub struct FakeTransport {
    connected_tx: watch::Sender<bool>,
    sent: Mutex<Vec<SignalingEvent>>,
    auto_ack: Mutex<Option<Arc<PendingAcks>>>,
    auto_reject: Mutex<Option<(Arc<PendingAcks>, String)>>,
}

impl FakeTransport {
    pub fn new(connected: bool) -> Arc<Self> {
        let (connected_tx, _) = watch::channel(connected);
        Arc::new(Self {
            connected_tx,
            sent: Mutex::new(Vec::new()),
            auto_ack: Mutex::new(None),
            auto_reject: Mutex::new(None),
        })
    }

    pub fn set_connected(&self, up: bool) {
        self.connected_tx.send_replace(up);
    }

    /// Every ack-requiring send resolves immediately as acked.
    pub fn auto_ack_into(&self, pending: Arc<PendingAcks>) {
        *self.auto_ack.lock().unwrap() = Some(pending);
    }

    /// Every ack-requiring send resolves as rejected with `message`.
    pub fn auto_reject_into(&self, pending: Arc<PendingAcks>, message: &str) {
        *self.auto_reject.lock().unwrap() = Some((pending, message.to_string()));
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn sent_kinds(&self) -> Vec<&'static str> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.body.kind())
            .collect()
    }

    pub fn sent_events(&self) -> Vec<SignalingEvent> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, event: &SignalingEvent) -> SocketResult<()> {
        if !self.is_connected() {
            return Err(SocketError::Closed);
        }
        self.sent.lock().unwrap().push(event.clone());

        if event.require_ack {
            if let Some(id) = &event.id {
                let reject = self.auto_reject.lock().unwrap().clone();
                if let Some((pending, message)) = reject {
                    pending.resolve(id, AckOutcome::Rejected(message));
                    return Ok(());
                }
                let ack = self.auto_ack.lock().unwrap().clone();
                if let Some(pending) = ack {
                    pending.resolve(id, AckOutcome::Acked);
                }
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.connected_tx.borrow()
    }

    fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }

    async fn close(&self) {
        self.connected_tx.send_replace(false);
    }
}

/// Media engine with scriptable failures and acquire/release counters.
#[derive(Default)]
pub struct FakeMediaEngine {
    fail_acquire: AtomicBool,
    fail_connect: AtomicBool,
    acquired: AtomicUsize,
    released: AtomicUsize,
    sessions_connected: AtomicUsize,
    sessions_disconnected: Arc<AtomicUsize>,
}

impl FakeMediaEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_acquire(&self, fail: bool) {
        self.fail_acquire.store(fail, Ordering::SeqCst);
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn sessions_connected(&self) -> usize {
        self.sessions_connected.load(Ordering::SeqCst)
    }

    pub fn sessions_disconnected(&self) -> usize {
        self.sessions_disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaEngine for FakeMediaEngine {
    async fn acquire_local(&self, kind: CallKind) -> Result<LocalMedia, MediaError> {
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(MediaError::DeviceUnavailable("device busy".into()));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let mut track_ids = vec!["local-audio-0".to_string()];
        if kind == CallKind::Video {
            track_ids.push("local-video-0".to_string());
        }
        Ok(LocalMedia { kind, track_ids })
    }

    async fn release_local(&self, _media: &LocalMedia) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    async fn connect(
        &self,
        room_name: &str,
        _token: &str,
        _kind: CallKind,
    ) -> Result<Box<dyn MediaSession>, MediaError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(MediaError::ConnectFailed("relay unreachable".into()));
        }
        self.sessions_connected.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            room_name: room_name.to_string(),
            disconnects: self.sessions_disconnected.clone(),
        }))
    }
}

pub struct FakeSession {
    pub room_name: String,
    disconnects: Arc<AtomicUsize>,
}

#[async_trait]
impl MediaSession for FakeSession {
    async fn remote_media(&self) -> Option<RemoteMedia> {
        Some(RemoteMedia {
            user: UserId::from("remote"),
            track_ids: vec!["remote-audio-0".to_string()],
        })
    }

    async fn quality(&self) -> Result<QualitySample, MediaError> {
        Ok(QualitySample {
            rtt_ms: 42,
            packet_loss_pct: 0.1,
        })
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// Fixed user graph for admission and lookup tests.
#[derive(Default)]
pub struct StaticDirectory {
    names: HashMap<UserId, String>,
    friends: HashSet<(UserId, UserId)>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, id: &str, name: &str) -> Self {
        self.names.insert(UserId::from(id), name.to_string());
        self
    }

    pub fn with_friends(mut self, a: &str, b: &str) -> Self {
        self.friends.insert((UserId::from(a), UserId::from(b)));
        self.friends.insert((UserId::from(b), UserId::from(a)));
        self
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn user_exists(&self, user: &UserId) -> bool {
        self.names.contains_key(user)
    }

    async fn display_name(&self, user: &UserId) -> Option<String> {
        self.names.get(user).cloned()
    }

    async fn are_friends(&self, a: &UserId, b: &UserId) -> bool {
        self.friends.contains(&(a.clone(), b.clone()))
    }
}
