//! Call event handler: the only component that drives both the state
//! machine and the media engine in response to network input.
//!
//! Inbound signaling events become validated transitions; every failure
//! path funnels into `cleanup()`, which is idempotent and can never leave
//! a dangling half-torn-down call.

use super::error::CallError;
use super::media::{LocalMedia, MediaEngine, MediaSession};
use super::state::{CallSession, CallStateManager, CallUpdate};
use crate::config::SignalingConfig;
use crate::directory::Directory;
use crate::protocol::EventBody;
use crate::queue::{DeliveryOutcome, OutboundQueue, PRIORITY_CALL};
use crate::types::call::{CallId, CallKind, CallPhase, EndReason};
use crate::types::events::{CallConnected, CallEnded, EventBus, IncomingCall};
use crate::types::user::UserId;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;

const MEDIA_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Parameters for an outgoing call, as returned by the call-start
/// endpoint of the HTTP layer.
#[derive(Debug, Clone)]
pub struct OutgoingCall {
    pub call_id: CallId,
    pub peer: UserId,
    pub kind: CallKind,
    pub room_name: String,
    pub token: String,
}

pub struct CallEventHandler {
    config: SignalingConfig,
    our_id: UserId,
    state: Arc<CallStateManager>,
    engine: Arc<dyn MediaEngine>,
    queue: Arc<OutboundQueue>,
    directory: Arc<dyn Directory>,
    bus: Arc<EventBus>,
    session_slot: Arc<Mutex<Option<Box<dyn MediaSession>>>>,
    media_slot: Arc<Mutex<Option<LocalMedia>>>,
}

impl CallEventHandler {
    pub fn new(
        config: SignalingConfig,
        our_id: UserId,
        engine: Arc<dyn MediaEngine>,
        queue: Arc<OutboundQueue>,
        directory: Arc<dyn Directory>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let state = CallStateManager::new(config.stuck_timeout);
        let handler = Arc::new(Self {
            config,
            our_id,
            state,
            engine,
            queue,
            directory,
            bus,
            session_slot: Arc::new(Mutex::new(None)),
            media_slot: Arc::new(Mutex::new(None)),
        });

        // Leaving Connected always tears the media down, whichever path
        // caused the exit.
        let session_slot = handler.session_slot.clone();
        let media_slot = handler.media_slot.clone();
        let engine = handler.engine.clone();
        handler.state.on_exit(
            CallPhase::Connected,
            Arc::new(move |_old: CallSession| {
                let session_slot = session_slot.clone();
                let media_slot = media_slot.clone();
                let engine = engine.clone();
                Box::pin(async move {
                    if let Some(session) = session_slot.lock().await.take() {
                        session.disconnect().await;
                    }
                    if let Some(media) = media_slot.lock().await.take() {
                        engine.release_local(&media).await;
                    }
                })
            }),
        );

        handler
    }

    pub fn state(&self) -> &Arc<CallStateManager> {
        &self.state
    }

    /// Starts an outgoing call previously admitted by the call-start
    /// endpoint.
    pub async fn place_call(self: &Arc<Self>, call: OutgoingCall) -> Result<(), CallError> {
        let phase = self.state.phase().await;
        if phase != CallPhase::Idle {
            return Err(CallError::WrongPhase {
                phase,
                action: "place a call",
            });
        }

        self.state
            .transition(
                CallUpdate::to_phase(CallPhase::Outgoing)
                    .call_id(call.call_id.clone())
                    .kind(call.kind)
                    .peer(call.peer.clone())
                    .room_name(call.room_name.clone())
                    .token(call.token.clone()),
            )
            .await?;

        let outcome_rx = self
            .queue
            .enqueue(
                EventBody::CallInitiate {
                    call_id: call.call_id.clone(),
                    caller_id: self.our_id.clone(),
                    recipient_id: call.peer.clone(),
                    call_type: call.kind,
                    room_name: call.room_name.clone(),
                    token: call.token.clone(),
                },
                PRIORITY_CALL,
            )
            .await;

        // An unreachable recipient comes back as a correlated error event
        // rather than an ack; fold that into a clean return to idle.
        let handler = self.clone();
        let watched_call = call.call_id.clone();
        tokio::spawn(async move {
            let reason = match outcome_rx.await {
                Ok(DeliveryOutcome::Delivered) => return,
                Ok(DeliveryOutcome::Rejected(message)) => {
                    warn!(target: "Client/Calls", "Call {watched_call} refused: {message}");
                    EndReason::Unreachable
                }
                Ok(DeliveryOutcome::Dropped) | Err(_) => EndReason::Error,
            };
            let snap = handler.state.snapshot().await;
            if snap.call_id.as_ref() == Some(&watched_call) && snap.phase == CallPhase::Outgoing {
                handler.finish(reason, false).await;
            }
        });

        self.arm_ring_timer(CallPhase::Outgoing, call.call_id);
        Ok(())
    }

    /// Reacts to a `call_initiate` addressed to us. Only acts from idle;
    /// there is no call waiting.
    pub async fn handle_incoming_call(
        self: &Arc<Self>,
        call_id: CallId,
        caller: UserId,
        kind: CallKind,
        room_name: String,
        token: String,
    ) -> Result<(), CallError> {
        if self.state.phase().await != CallPhase::Idle {
            debug!(
                target: "Client/Calls",
                "Ignoring incoming call {call_id} while busy"
            );
            return Ok(());
        }
        if caller.is_empty() || room_name.is_empty() {
            warn!(target: "Client/Calls", "Incomplete invite for call {call_id}, cleaning up");
            self.cleanup().await;
            return Err(CallError::UnknownCaller(caller.to_string()));
        }

        let caller_name = match self.directory.display_name(&caller).await {
            Some(name) => name,
            None => {
                warn!(
                    target: "Client/Calls",
                    "Caller lookup failed for {caller}, cleaning up"
                );
                self.cleanup().await;
                return Err(CallError::UnknownCaller(caller.to_string()));
            }
        };

        if let Err(e) = self
            .state
            .transition(
                CallUpdate::to_phase(CallPhase::Incoming)
                    .call_id(call_id.clone())
                    .kind(kind)
                    .peer(caller.clone())
                    .peer_name(caller_name.clone())
                    .room_name(room_name.clone())
                    .token(token),
            )
            .await
        {
            warn!(target: "Client/Calls", "Failed to ring for call {call_id}: {e}");
            self.cleanup().await;
            return Err(e);
        }

        let _ = self.bus.incoming_call.send(Arc::new(IncomingCall {
            call_id: call_id.clone(),
            caller,
            caller_name,
            kind,
            room_name,
        }));

        self.arm_ring_timer(CallPhase::Incoming, call_id);
        Ok(())
    }

    /// Local user answers the ringing call.
    pub async fn accept_call(self: &Arc<Self>) -> Result<(), CallError> {
        let snap = self.state.snapshot().await;
        if snap.phase != CallPhase::Incoming {
            return Err(CallError::WrongPhase {
                phase: snap.phase,
                action: "accept",
            });
        }
        let call_id = snap.call_id.clone().ok_or(CallError::NotInCall)?;

        let _ = self
            .queue
            .enqueue(
                EventBody::CallAccept {
                    call_id: call_id.clone(),
                    acceptor_id: self.our_id.clone(),
                },
                PRIORITY_CALL,
            )
            .await;

        self.state
            .transition(CallUpdate::to_phase(CallPhase::Connecting))
            .await?;

        if let Err(e) = self.establish_media(&snap).await {
            warn!(target: "Client/Calls", "Media setup failed for {call_id}: {e}");
            self.finish(EndReason::Error, true).await;
            return Err(e);
        }
        Ok(())
    }

    /// Local user declines the ringing call.
    pub async fn reject_call(self: &Arc<Self>) -> Result<(), CallError> {
        let snap = self.state.snapshot().await;
        if snap.phase != CallPhase::Incoming {
            return Err(CallError::WrongPhase {
                phase: snap.phase,
                action: "reject",
            });
        }
        if let Some(call_id) = snap.call_id.clone() {
            let _ = self
                .queue
                .enqueue(
                    EventBody::CallReject {
                        call_id,
                        rejector_id: self.our_id.clone(),
                    },
                    PRIORITY_CALL,
                )
                .await;
        }
        self.finish(EndReason::Rejected, false).await;
        Ok(())
    }

    /// Local user hangs up.
    pub async fn end_call(self: &Arc<Self>) -> Result<(), CallError> {
        let snap = self.state.snapshot().await;
        if !snap.is_in_call() {
            return Err(CallError::NotInCall);
        }
        self.finish(EndReason::UserEnded, true).await;
        Ok(())
    }

    /// The remote party accepted our outgoing call: bring up media and
    /// move to connected. Stale or duplicate accepts are dropped.
    pub async fn handle_call_accepted(self: &Arc<Self>, call_id: &CallId) -> Result<(), CallError> {
        let snap = self.state.snapshot().await;
        if !matches!(snap.phase, CallPhase::Outgoing | CallPhase::Connecting)
            || snap.call_id.as_ref() != Some(call_id)
        {
            debug!(
                target: "Client/Calls",
                "Ignoring stale call_accept for {call_id} in {}", snap.phase
            );
            return Ok(());
        }

        if snap.phase == CallPhase::Connecting && self.session_slot.lock().await.is_some() {
            debug!(
                target: "Client/Calls",
                "Duplicate call_accept for {call_id}, media setup already running"
            );
            return Ok(());
        }

        if snap.phase == CallPhase::Outgoing {
            self.state
                .transition(CallUpdate::to_phase(CallPhase::Connecting))
                .await?;
        }

        if let Err(e) = self.establish_media(&snap).await {
            warn!(target: "Client/Calls", "Media setup failed for {call_id}: {e}");
            self.finish(EndReason::Error, true).await;
            return Err(e);
        }
        Ok(())
    }

    /// The remote party rejected our call.
    pub async fn handle_call_rejected(self: &Arc<Self>) {
        if !self.state.phase().await.is_in_call() {
            debug!(target: "Client/Calls", "Ignoring call_reject while idle");
            return;
        }
        self.finish(EndReason::Rejected, false).await;
    }

    /// A `call_end` arrived from the network. `remote_originated` guards
    /// against two peers bouncing end notifications forever.
    pub async fn handle_call_ended(self: &Arc<Self>, call_id: &CallId, remote_originated: bool) {
        let snap = self.state.snapshot().await;
        if !snap.is_in_call() || snap.call_id.as_ref() != Some(call_id) {
            debug!(
                target: "Client/Calls",
                "Ignoring call_end for {call_id}: no matching call"
            );
            return;
        }
        self.finish(EndReason::RemoteEnded, !remote_originated).await;
    }

    /// Acquires local media (if not already held) and connects the
    /// provider session, then completes the transition to Connected.
    async fn establish_media(self: &Arc<Self>, snap: &CallSession) -> Result<(), CallError> {
        let kind = snap.kind.unwrap_or(CallKind::Voice);
        let room_name = snap.room_name.clone().ok_or(CallError::MissingRoom {
            target: CallPhase::Connected,
        })?;
        let token = snap.token.clone().unwrap_or_default();

        if self.media_slot.lock().await.is_none() {
            let media = self.engine.acquire_local(kind).await?;
            *self.media_slot.lock().await = Some(media);
        }

        // If anything below fails, the acquired tracks must not leak.
        let mut release_guard = scopeguard::guard(true, |armed| {
            if armed {
                let media_slot = self.media_slot.clone();
                let engine = self.engine.clone();
                tokio::spawn(async move {
                    if let Some(media) = media_slot.lock().await.take() {
                        engine.release_local(&media).await;
                    }
                });
            }
        });

        let session = self.engine.connect(&room_name, &token, kind).await?;
        let remote = session.remote_media().await;
        *self.session_slot.lock().await = Some(session);

        let local = self.media_slot.lock().await.clone();
        let mut update = CallUpdate::to_phase(CallPhase::Connected);
        if let Some(media) = local {
            update.local_media = Some(media);
        }
        if let Some(remote) = remote {
            update.remote_media = Some(remote);
        }

        loop {
            match self.state.transition(update.clone()).await {
                Ok(_) => break,
                Err(CallError::MediaNotReady { .. }) => sleep(MEDIA_RETRY_DELAY).await,
                Err(e) => {
                    if let Some(session) = self.session_slot.lock().await.take() {
                        session.disconnect().await;
                    }
                    return Err(e);
                }
            }
        }
        *release_guard = false;

        let snap = self.state.snapshot().await;
        let _ = self.bus.call_connected.send(Arc::new(CallConnected {
            call_id: snap.call_id.clone().unwrap_or_else(|| CallId::new("")),
            kind,
        }));
        self.spawn_quality_monitor();
        Ok(())
    }

    /// Periodically samples media quality into the call state while the
    /// session is alive. Self-terminating: exits when the session slot
    /// empties or the call leaves Connected.
    fn spawn_quality_monitor(self: &Arc<Self>) {
        let handler = self.clone();
        tokio::spawn(async move {
            loop {
                sleep(handler.config.quality_interval).await;
                if handler.state.phase().await != CallPhase::Connected {
                    return;
                }
                let sample = {
                    let slot = handler.session_slot.lock().await;
                    match slot.as_ref() {
                        Some(session) => session.quality().await,
                        None => return,
                    }
                };
                match sample {
                    Ok(sample) => {
                        let _ = handler
                            .state
                            .transition(CallUpdate {
                                quality: Some(sample),
                                ..Default::default()
                            })
                            .await;
                    }
                    Err(_) => return,
                }
            }
        });
    }

    /// Expires an unanswered call. The timer is detached and re-checks
    /// both phase and call id at fire time, so stale timers are inert.
    fn arm_ring_timer(self: &Arc<Self>, armed_phase: CallPhase, armed_call: CallId) {
        let handler = self.clone();
        tokio::spawn(async move {
            sleep(handler.config.ring_timeout).await;
            let snap = handler.state.snapshot().await;
            if snap.phase != armed_phase || snap.call_id.as_ref() != Some(&armed_call) {
                return;
            }
            warn!(
                target: "Client/Calls",
                "Call {armed_call} unanswered after {}s, expiring",
                handler.config.ring_timeout.as_secs()
            );
            match armed_phase {
                CallPhase::Incoming => {
                    let _ = handler
                        .queue
                        .enqueue(
                            EventBody::CallReject {
                                call_id: armed_call,
                                rejector_id: handler.our_id.clone(),
                            },
                            PRIORITY_CALL,
                        )
                        .await;
                    handler.finish(EndReason::Timeout, false).await;
                }
                CallPhase::Outgoing => {
                    handler.finish(EndReason::Timeout, true).await;
                }
                _ => {}
            }
        });
    }

    /// Common exit path: optionally notify the remote party, then tear
    /// everything down and surface the outcome.
    async fn finish(self: &Arc<Self>, reason: EndReason, notify_remote: bool) {
        let snap = self.state.snapshot().await;
        if notify_remote {
            if let Some(call_id) = snap.call_id.clone() {
                let _ = self
                    .queue
                    .enqueue(
                        EventBody::CallEnd {
                            call_id,
                            user_id: self.our_id.clone(),
                        },
                        PRIORITY_CALL,
                    )
                    .await;
            }
        }
        if snap.is_in_call() {
            if let Err(e) = self
                .state
                .transition(CallUpdate::to_phase(CallPhase::Ended))
                .await
            {
                debug!(target: "Client/Calls", "Transition to ended failed: {e}");
            }
        }
        self.cleanup().await;
        let _ = self.bus.call_ended.send(Arc::new(CallEnded {
            call_id: snap.call_id,
            reason,
        }));
    }

    /// Idempotent teardown. Secondary errors are swallowed; the state is
    /// reset no matter what, so a failed teardown cannot wedge the
    /// component.
    pub async fn cleanup(&self) {
        if let Some(session) = self.session_slot.lock().await.take() {
            session.disconnect().await;
        }
        if let Some(media) = self.media_slot.lock().await.take() {
            self.engine.release_local(&media).await;
        }
        self.state.reset().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::PendingAcks;
    use crate::test_utils::{FakeMediaEngine, FakeTransport, StaticDirectory};

    struct Fixture {
        handler: Arc<CallEventHandler>,
        engine: Arc<FakeMediaEngine>,
        transport: Arc<FakeTransport>,
        bus: Arc<EventBus>,
    }

    fn fixture_with_config(config: SignalingConfig) -> Fixture {
        let transport = FakeTransport::new(true);
        let pending = Arc::new(PendingAcks::new());
        transport.auto_ack_into(pending.clone());
        let queue = OutboundQueue::new(config.clone(), transport.clone(), pending);
        tokio::spawn(queue.clone().run());

        let engine = FakeMediaEngine::new();
        let bus = Arc::new(EventBus::new());
        let directory = Arc::new(
            StaticDirectory::new()
                .with_user("A", "Alice")
                .with_user("B", "Bob")
                .with_friends("A", "B"),
        );
        let handler = CallEventHandler::new(
            config,
            UserId::from("B"),
            engine.clone(),
            queue,
            directory,
            bus.clone(),
        );
        Fixture {
            handler,
            engine,
            transport,
            bus,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_config(SignalingConfig {
            ack_timeout: Duration::from_millis(50),
            retry_base_delay: Duration::from_millis(5),
            ring_timeout: Duration::from_millis(150),
            ..SignalingConfig::default()
        })
    }

    async fn ring(fx: &Fixture) {
        fx.handler
            .handle_incoming_call(
                CallId::from("c1"),
                UserId::from("A"),
                CallKind::Voice,
                "voice-A-B-1700000000000".into(),
                "tok-b".into(),
            )
            .await
            .unwrap();
    }

    /// Incoming invite from idle rings and surfaces the caller identity.
    #[tokio::test]
    async fn test_incoming_call_rings() {
        let fx = fixture();
        let mut incoming = fx.bus.incoming_call.subscribe();
        ring(&fx).await;

        assert_eq!(fx.handler.state().phase().await, CallPhase::Incoming);
        let event = incoming.recv().await.unwrap();
        assert_eq!(event.caller_name, "Alice");
        assert_eq!(event.call_id, CallId::from("c1"));
    }

    /// An invite while already in a call is ignored: no call waiting.
    #[tokio::test]
    async fn test_incoming_call_while_busy_is_ignored() {
        let fx = fixture();
        ring(&fx).await;

        fx.handler
            .handle_incoming_call(
                CallId::from("c2"),
                UserId::from("A"),
                CallKind::Video,
                "video-A-B-2".into(),
                "tok".into(),
            )
            .await
            .unwrap();

        let snap = fx.handler.state().snapshot().await;
        assert_eq!(snap.call_id, Some(CallId::from("c1")));
        assert_eq!(snap.phase, CallPhase::Incoming);
    }

    /// A failed caller lookup cleans up instead of leaving a half-applied
    /// state.
    #[tokio::test]
    async fn test_unknown_caller_triggers_cleanup() {
        let fx = fixture();
        let err = fx
            .handler
            .handle_incoming_call(
                CallId::from("c1"),
                UserId::from("stranger"),
                CallKind::Voice,
                "voice-S-B-1".into(),
                "tok".into(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::UnknownCaller(_)));
        assert_eq!(fx.handler.state().phase().await, CallPhase::Idle);
    }

    /// Accepting acquires media, connects the session and lands in
    /// Connected.
    #[tokio::test]
    async fn test_accept_connects_media() {
        let fx = fixture();
        ring(&fx).await;

        fx.handler.accept_call().await.unwrap();

        let snap = fx.handler.state().snapshot().await;
        assert_eq!(snap.phase, CallPhase::Connected);
        assert!(snap.local_media.is_some());
        assert_eq!(fx.engine.acquired(), 1);
        assert_eq!(fx.engine.sessions_connected(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.transport.sent_kinds().contains(&"call_accept"));
    }

    /// Media acquisition failure on accept tears everything down and
    /// notifies the peer.
    #[tokio::test]
    async fn test_accept_media_failure_cleans_up() {
        let fx = fixture();
        fx.engine.fail_acquire(true);
        ring(&fx).await;

        assert!(fx.handler.accept_call().await.is_err());

        assert_eq!(fx.handler.state().phase().await, CallPhase::Idle);
        assert_eq!(fx.engine.released(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.transport.sent_kinds().contains(&"call_end"));
    }

    /// Duplicate call_end events after teardown produce no extra side
    /// effects.
    #[tokio::test]
    async fn test_duplicate_call_end_is_idempotent() {
        let fx = fixture();
        ring(&fx).await;
        fx.handler.accept_call().await.unwrap();

        let call_id = CallId::from("c1");
        fx.handler.handle_call_ended(&call_id, true).await;
        assert_eq!(fx.engine.released(), 1);
        assert_eq!(fx.engine.sessions_disconnected(), 1);

        fx.handler.handle_call_ended(&call_id, true).await;
        fx.handler.handle_call_ended(&call_id, true).await;
        assert_eq!(fx.engine.released(), 1);
        assert_eq!(fx.engine.sessions_disconnected(), 1);
        assert_eq!(fx.handler.state().phase().await, CallPhase::Idle);
    }

    /// A remote-originated end does not echo another call_end back.
    #[tokio::test]
    async fn test_remote_end_does_not_echo() {
        let fx = fixture();
        ring(&fx).await;
        fx.handler.accept_call().await.unwrap();

        fx.handler.handle_call_ended(&CallId::from("c1"), true).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!fx.transport.sent_kinds().contains(&"call_end"));
    }

    /// A locally-initiated hangup does notify the peer.
    #[tokio::test]
    async fn test_local_end_notifies_peer() {
        let fx = fixture();
        ring(&fx).await;
        fx.handler.accept_call().await.unwrap();

        fx.handler.end_call().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.transport.sent_kinds().contains(&"call_end"));
        assert_eq!(fx.handler.state().phase().await, CallPhase::Idle);
    }

    /// Stale call_accept after the call is gone is ignored without error.
    #[tokio::test]
    async fn test_stale_accept_is_ignored() {
        let fx = fixture();
        fx.handler
            .handle_call_accepted(&CallId::from("ghost"))
            .await
            .unwrap();
        assert_eq!(fx.handler.state().phase().await, CallPhase::Idle);
        assert_eq!(fx.engine.acquired(), 0);
    }

    /// An unanswered incoming call expires at the ring timeout and issues
    /// the reject equivalent.
    #[tokio::test]
    async fn test_unanswered_call_expires() {
        let fx = fixture();
        let mut ended = fx.bus.call_ended.subscribe();
        ring(&fx).await;

        let event = ended.recv().await.unwrap();
        assert_eq!(event.reason, EndReason::Timeout);
        assert_eq!(fx.handler.state().phase().await, CallPhase::Idle);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.transport.sent_kinds().contains(&"call_reject"));
    }

    /// Rejecting locally sends call_reject and returns to idle.
    #[tokio::test]
    async fn test_local_reject() {
        let fx = fixture();
        ring(&fx).await;

        fx.handler.reject_call().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.transport.sent_kinds().contains(&"call_reject"));
        assert_eq!(fx.handler.state().phase().await, CallPhase::Idle);
    }
}
