//! Server-side call coordinator: validates, persists and relays
//! signaling between live connections.
//!
//! Each socket gets a read task and a write task joined by an mpsc
//! channel; handlers never touch the sink directly. Validation is the
//! pure step in `protocol::validate`; everything in here is the
//! effectful relay step.

use super::registry::PresenceRegistry;
use super::service::CallService;
use crate::config::SignalingConfig;
use crate::pending::{AckOutcome, PendingAcks};
use crate::protocol::{self, EventBody, SignalingEvent};
use crate::types::call::{CallId, CallKind};
use crate::types::user::{Presence, UserId};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use rand::RngCore;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

/// Per-socket context threaded through event processing.
struct ConnContext {
    outbound: mpsc::Sender<SignalingEvent>,
    identity: Option<(UserId, u64)>,
}

impl ConnContext {
    fn new(outbound: mpsc::Sender<SignalingEvent>) -> Self {
        Self {
            outbound,
            identity: None,
        }
    }

    async fn push(&self, event: SignalingEvent) {
        if self.outbound.send(event).await.is_err() {
            debug!(target: "Server/Coordinator", "Outbound channel closed");
        }
    }

    async fn push_error(&self, related_id: Option<String>, message: impl Into<String>) {
        self.push(SignalingEvent::error(related_id, message)).await;
    }
}

pub struct Coordinator {
    config: SignalingConfig,
    registry: Arc<PresenceRegistry>,
    service: Arc<CallService>,
    pending: Arc<PendingAcks>,
    relay_prefix: String,
    relay_counter: AtomicU64,
}

impl Coordinator {
    pub fn new(
        config: SignalingConfig,
        registry: Arc<PresenceRegistry>,
        service: Arc<CallService>,
    ) -> Arc<Self> {
        let mut random_bytes = [0u8; 4];
        rand::rng().fill_bytes(&mut random_bytes);
        Arc::new(Self {
            config,
            registry,
            service,
            pending: Arc::new(PendingAcks::new()),
            relay_prefix: hex::encode(random_bytes),
            relay_counter: AtomicU64::new(1),
        })
    }

    pub fn registry(&self) -> &Arc<PresenceRegistry> {
        &self.registry
    }

    fn next_relay_id(&self) -> String {
        let count = self.relay_counter.fetch_add(1, Ordering::Relaxed);
        format!("relay-{}-{}", self.relay_prefix, count)
    }

    /// Accept loop; runs until the listener errors or the task is
    /// dropped.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        info!(
            target: "Server/Coordinator",
            "Listening on {}",
            listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "<unknown>".into())
        );
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(target: "Server/Coordinator", "Accepted connection from {peer}");
                    let coordinator = self.clone();
                    tokio::spawn(async move {
                        coordinator.handle_socket(stream).await;
                    });
                }
                Err(e) => {
                    error!(target: "Server/Coordinator", "Accept failed: {e}");
                    return;
                }
            }
        }
    }

    async fn handle_socket(self: Arc<Self>, stream: TcpStream) {
        let ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(target: "Server/Coordinator", "Handshake failed: {e}");
                return;
            }
        };
        let (mut sink, mut stream) = ws.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<SignalingEvent>(100);
        let write_task = tokio::spawn(async move {
            while let Some(event) = outbound_rx.recv().await {
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        error!(target: "Server/Coordinator", "Serialize failed: {e}");
                        continue;
                    }
                };
                if sink.send(Message::text(json)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let mut conn = ConnContext::new(outbound_tx);
        while let Some(msg) = stream.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(target: "Server/Coordinator", "Read error: {e}");
                    break;
                }
            };
            if msg.is_close() {
                break;
            }
            if !msg.is_text() {
                continue;
            }
            let Ok(text) = msg.into_text() else { continue };
            let event = match serde_json::from_str::<SignalingEvent>(&text) {
                Ok(event) => event,
                Err(e) => {
                    debug!(target: "Server/Coordinator", "Malformed frame: {e}");
                    conn.push_error(None, format!("malformed event: {e}")).await;
                    continue;
                }
            };
            self.process_event(&mut conn, event).await;
        }

        self.connection_closed(&conn).await;
        write_task.abort();
    }

    /// Marks the user offline, fails relays awaiting this connection's
    /// acks and broadcasts the presence change.
    async fn connection_closed(&self, conn: &ConnContext) {
        let Some((user, conn_id)) = &conn.identity else {
            return;
        };
        self.pending.fail_tagged(*conn_id);
        if self.registry.remove(user, *conn_id) {
            info!(target: "Server/Coordinator", "{user} disconnected");
            let mut offline = SignalingEvent::new(EventBody::Status {
                sender_id: user.clone(),
                status: Presence::Offline,
                last_seen: Some(Utc::now().timestamp_millis()),
            });
            offline.require_ack = false;
            self.registry.broadcast(&offline, Some(user));
        }
    }

    /// Validation (pure) followed by exhaustive dispatch (effectful).
    async fn process_event(self: &Arc<Self>, conn: &mut ConnContext, event: SignalingEvent) {
        if let Err(e) = protocol::validate(&event) {
            debug!(target: "Server/Coordinator", "Invalid event: {e}");
            conn.push_error(event.id.clone(), e.to_string()).await;
            return;
        }
        if let Some((user, _)) = &conn.identity {
            if let Err(e) = protocol::validate_sender(&event, user) {
                warn!(target: "Server/Coordinator", "{e}");
                conn.push_error(event.id.clone(), e.to_string()).await;
                return;
            }
        } else if !matches!(
            event.body,
            EventBody::Register { .. } | EventBody::Ping | EventBody::Ack
        ) {
            conn.push_error(event.id.clone(), "connection is not registered")
                .await;
            return;
        }

        match event.body.clone() {
            EventBody::Register { sender_id } => {
                let conn_id = self
                    .registry
                    .register(sender_id.clone(), conn.outbound.clone());
                conn.identity = Some((sender_id.clone(), conn_id));
                info!(target: "Server/Coordinator", "{sender_id} registered");
                self.ack_if_requested(conn, &event).await;

                let mut online = SignalingEvent::new(EventBody::Status {
                    sender_id: sender_id.clone(),
                    status: Presence::Online,
                    last_seen: None,
                });
                online.require_ack = false;
                self.registry.broadcast(&online, Some(&sender_id));
            }

            EventBody::Status { sender_id, .. } => {
                self.ack_if_requested(conn, &event).await;
                let mut relay = event.clone();
                relay.require_ack = false;
                self.registry.broadcast(&relay, Some(&sender_id));
            }

            EventBody::Typing { receiver_id, .. }
            | EventBody::Message { receiver_id, .. }
            | EventBody::ReadStatus { receiver_id, .. } => {
                self.ack_if_requested(conn, &event).await;
                self.relay_to(&receiver_id, event).await;
            }

            EventBody::CallInitiate {
                call_id,
                caller_id,
                recipient_id,
                call_type,
                room_name,
                token: _,
            } => {
                self.handle_call_initiation(
                    conn,
                    &event,
                    call_id,
                    caller_id,
                    recipient_id,
                    call_type,
                    room_name,
                )
                .await;
            }

            EventBody::CallAccept {
                call_id,
                acceptor_id,
            } => {
                match self.service.accept_call(&call_id, &acceptor_id).await {
                    Ok(record) => {
                        self.ack_if_requested(conn, &event).await;
                        self.relay_to(&record.caller, event).await;
                    }
                    Err(e) => {
                        warn!(target: "Server/Coordinator", "Accept of {call_id} failed: {e}");
                        conn.push_error(event.id.clone(), e.to_string()).await;
                    }
                }
            }

            EventBody::CallReject {
                call_id,
                rejector_id,
            } => {
                match self.service.reject_call(&call_id, &rejector_id).await {
                    Ok(record) => {
                        self.ack_if_requested(conn, &event).await;
                        self.relay_to(&record.caller, event).await;
                    }
                    Err(e) => {
                        warn!(target: "Server/Coordinator", "Reject of {call_id} failed: {e}");
                        conn.push_error(event.id.clone(), e.to_string()).await;
                    }
                }
            }

            EventBody::CallEnd { call_id, user_id } => {
                match self.service.end_call(&call_id, &user_id).await {
                    Ok(record) => {
                        self.ack_if_requested(conn, &event).await;
                        // Both participants learn about the end; the
                        // originator's copy is an idempotent echo.
                        self.relay_to(&record.caller, event.clone()).await;
                        self.relay_to(&record.recipient, event).await;
                    }
                    Err(e) => {
                        warn!(target: "Server/Coordinator", "End of {call_id} failed: {e}");
                        conn.push_error(event.id.clone(), e.to_string()).await;
                    }
                }
            }

            EventBody::Ack => {
                if let Some(id) = &event.id {
                    if !self.pending.resolve(id, AckOutcome::Acked) {
                        debug!(target: "Server/Coordinator", "Ack for unknown id {id}");
                    }
                }
            }

            EventBody::Error { message } => {
                if let Some(id) = &event.id {
                    self.pending.resolve(id, AckOutcome::Rejected(message.clone()));
                }
                debug!(target: "Server/Coordinator", "Client error event: {message}");
            }

            EventBody::Ping => {
                debug!(target: "Server/Coordinator", "Keepalive");
            }
        }
    }

    /// Relay of a validated `call_initiate`: the record must exist and
    /// the recipient must be connected; otherwise the attempt is missed
    /// and the caller told why. On success the relayed invite carries a
    /// freshly issued credential for the recipient and is tracked for an
    /// acknowledgment with the long relay deadline.
    #[allow(clippy::too_many_arguments)]
    async fn handle_call_initiation(
        self: &Arc<Self>,
        conn: &ConnContext,
        event: &SignalingEvent,
        call_id: CallId,
        caller_id: UserId,
        recipient_id: UserId,
        call_type: CallKind,
        room_name: String,
    ) {
        if let Err(e) = self.service.store().get(&call_id).await {
            warn!(target: "Server/Coordinator", "Initiate for unknown call {call_id}");
            conn.push_error(event.id.clone(), e.to_string()).await;
            return;
        }

        let Some(recipient) = self.registry.get(&recipient_id) else {
            info!(
                target: "Server/Coordinator",
                "Recipient {recipient_id} not connected, marking call {call_id} missed"
            );
            if let Err(e) = self.service.mark_missed(&call_id).await {
                error!(target: "Server/Coordinator", "Failed to mark {call_id} missed: {e}");
            }
            conn.push_error(event.id.clone(), "recipient not connected")
                .await;
            return;
        };

        let recipient_token = self.service.issue_token(&room_name, &recipient_id);
        let relay_id = self.next_relay_id();
        let relay = SignalingEvent::new(EventBody::CallInitiate {
            call_id: call_id.clone(),
            caller_id,
            recipient_id,
            call_type,
            room_name,
            token: recipient_token,
        })
        .with_id(relay_id.clone());

        let rx = self
            .pending
            .register_tagged(&relay_id, Some(recipient.conn_id));
        if !recipient.push(relay) {
            self.pending.cancel(&relay_id);
            if let Err(e) = self.service.mark_missed(&call_id).await {
                error!(target: "Server/Coordinator", "Failed to mark {call_id} missed: {e}");
            }
            conn.push_error(event.id.clone(), "recipient not connected")
                .await;
            return;
        }

        // The caller's egress ack: the invite is on its way.
        self.ack_if_requested(conn, event).await;

        // Await the recipient's ack off the read loop. Ack failure does
        // not roll the record back; the expiry sweep bounds how long it
        // can linger in `initiated`.
        let coordinator = self.clone();
        tokio::spawn(async move {
            let outcome = coordinator
                .pending
                .wait(&relay_id, rx, coordinator.config.relay_ack_timeout)
                .await;
            match outcome {
                AckOutcome::Acked => {
                    if let Err(e) = coordinator.service.mark_ringing(&call_id).await {
                        error!(
                            target: "Server/Coordinator",
                            "Failed to mark {call_id} ringing: {e}"
                        );
                    }
                }
                other => {
                    warn!(
                        target: "Server/Coordinator",
                        "Invite relay for {call_id} unacknowledged: {other:?}"
                    );
                }
            }
        });
    }

    async fn ack_if_requested(&self, conn: &ConnContext, event: &SignalingEvent) {
        if event.require_ack {
            if let Some(id) = &event.id {
                conn.push(SignalingEvent::ack(id.clone())).await;
            }
        }
    }

    /// Best-effort relay: an absent or closed counterpart connection is
    /// tolerated, the persisted state change already took effect.
    async fn relay_to(&self, user: &UserId, mut event: SignalingEvent) {
        event.require_ack = false;
        match self.registry.get(user) {
            Some(handle) => {
                handle.push(event);
            }
            None => {
                debug!(
                    target: "Server/Coordinator",
                    "No connection for {user}, dropping {} relay", event.body.kind()
                );
            }
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("online", &self.registry.online_users().len())
            .field("pending", &self.pending.len())
            .finish()
    }
}
