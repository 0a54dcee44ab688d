//! Client facade: one [`SignalingClient`] per logged-in user, wiring the
//! transport connection, outbound queue, pending-ack table and call
//! handler behind a typed event bus.

use crate::calls::{CallError, CallEventHandler, MediaEngine, OutgoingCall};
use crate::config::SignalingConfig;
use crate::directory::Directory;
use crate::pending::{AckOutcome, PendingAcks};
use crate::protocol::{self, EventBody, SignalingEvent};
use crate::queue::{
    DeliveryOutcome, OutboundQueue, PRIORITY_CHAT, PRIORITY_REGISTER, PRIORITY_STATUS,
};
use crate::socket::{Connection, SocketError, Transport, TransportEvent};
use crate::types::call::EndReason;
use crate::types::events::{
    CallEnded, ChatMessage, Connected, Disconnected, EventBus, ReadReceipt, SignalError,
    TypingUpdate,
};
use crate::types::user::{Presence, PresenceUpdate, UserId};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc, oneshot};
use tokio::time::sleep;

pub struct SignalingClient {
    config: SignalingConfig,
    our_id: UserId,
    connection: Arc<Connection>,
    queue: Arc<OutboundQueue>,
    pending: Arc<PendingAcks>,
    calls: Arc<CallEventHandler>,
    bus: Arc<EventBus>,
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    enable_auto_reconnect: AtomicBool,
    started: AtomicBool,
    shutdown: Notify,
}

impl SignalingClient {
    pub fn new(
        config: SignalingConfig,
        our_id: UserId,
        url: impl Into<String>,
        engine: Arc<dyn MediaEngine>,
        directory: Arc<dyn Directory>,
    ) -> Arc<Self> {
        let (connection, events_rx) = Connection::new(url);
        let pending = Arc::new(PendingAcks::new());
        let transport: Arc<dyn Transport> = connection.clone();
        let queue = OutboundQueue::new(config.clone(), transport, pending.clone());
        let bus = Arc::new(EventBus::new());
        let calls = CallEventHandler::new(
            config.clone(),
            our_id.clone(),
            engine,
            queue.clone(),
            directory,
            bus.clone(),
        );

        Arc::new(Self {
            config,
            our_id,
            connection,
            queue,
            pending,
            calls,
            bus,
            events_rx: Mutex::new(Some(events_rx)),
            enable_auto_reconnect: AtomicBool::new(true),
            started: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn calls(&self) -> &Arc<CallEventHandler> {
        &self.calls
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Connects and spawns the background loops. Identity registration
    /// happens automatically on every (re)connect.
    pub async fn start(self: &Arc<Self>) -> Result<(), SocketError> {
        if !self.started.swap(true, Ordering::SeqCst) {
            tokio::spawn(self.queue.clone().run());
            tokio::spawn(self.clone().run());
            tokio::spawn(self.clone().stuck_watchdog());
            tokio::spawn(self.clone().keepalive_loop());
        }
        self.connection.connect().await
    }

    /// Stops reconnecting, fails outstanding waits and closes the
    /// socket.
    pub async fn disconnect(&self) {
        self.enable_auto_reconnect.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        self.queue.shutdown();
        self.connection.close().await;
        self.pending.fail_all();
    }

    pub async fn set_status(&self, status: Presence) {
        let _ = self
            .queue
            .enqueue(
                EventBody::Status {
                    sender_id: self.our_id.clone(),
                    status,
                    last_seen: None,
                },
                PRIORITY_STATUS,
            )
            .await;
    }

    pub async fn send_typing(&self, to: UserId, is_typing: bool) {
        let _ = self
            .queue
            .enqueue(
                EventBody::Typing {
                    sender_id: self.our_id.clone(),
                    receiver_id: to,
                    is_typing,
                },
                PRIORITY_CHAT,
            )
            .await;
    }

    pub async fn send_message(
        &self,
        to: UserId,
        content: impl Into<String>,
    ) -> oneshot::Receiver<DeliveryOutcome> {
        self.queue
            .enqueue(
                EventBody::Message {
                    sender_id: self.our_id.clone(),
                    receiver_id: to,
                    content: content.into(),
                },
                PRIORITY_CHAT,
            )
            .await
    }

    pub async fn send_read_status(&self, to: UserId) {
        let _ = self
            .queue
            .enqueue(
                EventBody::ReadStatus {
                    sender_id: self.our_id.clone(),
                    receiver_id: to,
                },
                PRIORITY_CHAT,
            )
            .await;
    }

    pub async fn place_call(self: &Arc<Self>, call: OutgoingCall) -> Result<(), CallError> {
        self.calls.place_call(call).await
    }

    pub async fn accept_call(self: &Arc<Self>) -> Result<(), CallError> {
        self.calls.accept_call().await
    }

    pub async fn reject_call(self: &Arc<Self>) -> Result<(), CallError> {
        self.calls.reject_call().await
    }

    pub async fn end_call(self: &Arc<Self>) -> Result<(), CallError> {
        self.calls.end_call().await
    }

    /// Main loop: consumes transport events, reconnects on loss and
    /// dispatches inbound signaling.
    async fn run(self: Arc<Self>) {
        let mut events_rx = match self.events_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };
        loop {
            tokio::select! {
                maybe = events_rx.recv() => {
                    match maybe {
                        Some(TransportEvent::Connected) => {
                            debug!(target: "Client", "Connected, registering as {}", self.our_id);
                            let _ = self.bus.connected.send(Arc::new(Connected));
                            let _ = self
                                .queue
                                .enqueue(
                                    EventBody::Register {
                                        sender_id: self.our_id.clone(),
                                    },
                                    PRIORITY_REGISTER,
                                )
                                .await;
                        }
                        Some(TransportEvent::Disconnected) => {
                            let _ = self.bus.disconnected.send(Arc::new(Disconnected));
                            self.pending.fail_all();
                            if !self.reconnect().await {
                                return;
                            }
                        }
                        Some(TransportEvent::EventReceived(event)) => {
                            self.dispatch(event).await;
                        }
                        None => return,
                    }
                }
                _ = self.shutdown.notified() => return,
            }
        }
    }

    /// Fixed-backoff reconnect loop. Returns false when shut down.
    async fn reconnect(&self) -> bool {
        while self.enable_auto_reconnect.load(Ordering::SeqCst) {
            tokio::select! {
                _ = sleep(self.config.reconnect_delay) => {}
                _ = self.shutdown.notified() => return false,
            }
            match self.connection.connect().await {
                Ok(()) => return true,
                Err(e) => {
                    warn!(target: "Client", "Reconnect failed: {e}");
                }
            }
        }
        false
    }

    async fn dispatch(self: &Arc<Self>, event: SignalingEvent) {
        if let Err(e) = protocol::validate(&event) {
            warn!(target: "Client", "Dropping invalid inbound event: {e}");
            return;
        }

        // Delivery acknowledgment, sent straight to the socket so it can
        // never queue behind retries.
        if event.require_ack
            && !matches!(event.body, EventBody::Ack | EventBody::Error { .. })
        {
            if let Some(id) = &event.id {
                if let Err(e) = self.connection.send(&SignalingEvent::ack(id.clone())).await {
                    debug!(target: "Client", "Failed to ack {id}: {e}");
                }
            }
        }

        let envelope_ts = event.timestamp;
        match event.body {
            EventBody::Ack => {
                if let Some(id) = &event.id {
                    if !self.pending.resolve(id, AckOutcome::Acked) {
                        debug!(target: "Client", "Ack for unknown id {id}");
                    }
                }
            }
            EventBody::Error { message } => {
                if let Some(id) = &event.id {
                    self.pending
                        .resolve(id, AckOutcome::Rejected(message.clone()));
                }
                let _ = self.bus.error.send(Arc::new(SignalError {
                    related_id: event.id,
                    message,
                }));
            }
            EventBody::CallInitiate {
                call_id,
                caller_id,
                call_type,
                room_name,
                token,
                ..
            } => {
                let _ = self
                    .calls
                    .handle_incoming_call(call_id, caller_id, call_type, room_name, token)
                    .await;
            }
            EventBody::CallAccept { call_id, .. } => {
                let _ = self.calls.handle_call_accepted(&call_id).await;
            }
            EventBody::CallReject { .. } => {
                self.calls.handle_call_rejected().await;
            }
            EventBody::CallEnd { call_id, user_id } => {
                // Our own echo from the server is indistinguishable from a
                // remote end and equally idempotent.
                let remote_originated = user_id != self.our_id;
                self.calls
                    .handle_call_ended(&call_id, remote_originated)
                    .await;
            }
            EventBody::Status {
                sender_id,
                status,
                last_seen,
            } => {
                let _ = self.bus.presence.send(Arc::new(PresenceUpdate {
                    user: sender_id,
                    presence: status,
                    last_seen: last_seen.and_then(DateTime::<Utc>::from_timestamp_millis),
                }));
            }
            EventBody::Typing {
                sender_id,
                is_typing,
                ..
            } => {
                let _ = self.bus.typing.send(Arc::new(TypingUpdate {
                    from: sender_id,
                    is_typing,
                }));
            }
            EventBody::Message {
                sender_id,
                receiver_id,
                content,
            } => {
                let _ = self.bus.message.send(Arc::new(ChatMessage {
                    from: sender_id,
                    to: receiver_id,
                    content,
                    timestamp: DateTime::<Utc>::from_timestamp_millis(envelope_ts)
                        .unwrap_or_else(Utc::now),
                }));
            }
            EventBody::ReadStatus { sender_id, .. } => {
                let _ = self.bus.read_receipt.send(Arc::new(ReadReceipt {
                    from: sender_id,
                    timestamp: DateTime::<Utc>::from_timestamp_millis(envelope_ts)
                        .unwrap_or_else(Utc::now),
                }));
            }
            EventBody::Register { .. } => {
                debug!(target: "Client", "Ignoring server-bound register event");
            }
            EventBody::Ping => {
                debug!(target: "Client", "Keepalive");
            }
        }
    }

    /// Periodic keepalive ping, the one event that never asks for an
    /// acknowledgment.
    async fn keepalive_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = sleep(self.config.keepalive_interval) => {
                    if self.is_connected() {
                        let _ = self.queue.enqueue(EventBody::Ping, PRIORITY_CHAT).await;
                    }
                }
                _ = self.shutdown.notified() => return,
            }
        }
    }

    /// Detects calls wedged in a pending phase past the ceiling and
    /// reports them as timeouts instead of hanging forever.
    async fn stuck_watchdog(self: Arc<Self>) {
        let period = (self.config.stuck_timeout / 4).max(Duration::from_millis(100));
        loop {
            tokio::select! {
                _ = sleep(period) => {
                    if let Err(e) = self.calls.state().check_stuck().await {
                        warn!(target: "Client", "{e}; forcing cleanup");
                        let snap = self.calls.state().snapshot().await;
                        self.calls.cleanup().await;
                        let _ = self.bus.call_ended.send(Arc::new(CallEnded {
                            call_id: snap.call_id,
                            reason: EndReason::Timeout,
                        }));
                    }
                }
                _ = self.shutdown.notified() => return,
            }
        }
    }
}
