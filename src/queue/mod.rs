//! Outbound event queue: reliable-effort delivery over an unreliable
//! transport.
//!
//! Events are enqueued with a priority, sent head-first while the
//! connection is open, and retried with linear-multiple backoff when an
//! acknowledgment does not arrive in time. Call-lifecycle events are
//! hoisted ahead of everything else; chat noise must never delay call
//! setup. On connection loss the loop parks without dropping entries and
//! resumes when the transport comes back.

use crate::config::SignalingConfig;
use crate::pending::{AckOutcome, PendingAcks};
use crate::protocol::{EventBody, SignalingEvent};
use crate::socket::Transport;
use log::{debug, warn};
use rand::RngCore;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, Notify, oneshot};
use tokio::time::sleep;

/// Baseline priorities for enqueued events. Call-lifecycle events jump
/// the queue regardless of these values.
pub const PRIORITY_REGISTER: i32 = 100;
pub const PRIORITY_CALL: i32 = 50;
pub const PRIORITY_STATUS: i32 = 10;
pub const PRIORITY_CHAT: i32 = 0;

/// Final fate of an enqueued event, reported on the receiver returned by
/// [`OutboundQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Sent and, where required, acknowledged.
    Delivered,
    /// Gave up after the retry ceiling, or evicted from a full queue.
    Dropped,
    /// The server answered with an error event instead of an ack.
    Rejected(String),
}

struct QueuedEvent {
    event: SignalingEvent,
    priority: i32,
    attempts: u32,
    seq: u64,
    enqueued_at: Instant,
    ready_at: Instant,
    outcome_tx: Option<oneshot::Sender<DeliveryOutcome>>,
}

impl QueuedEvent {
    fn resolve(mut self, outcome: DeliveryOutcome) {
        if let Some(tx) = self.outcome_tx.take() {
            let _ = tx.send(outcome);
        }
    }
}

enum Next {
    Entry(Box<QueuedEvent>),
    Sleep(std::time::Duration),
    Idle,
}

pub struct OutboundQueue {
    config: SignalingConfig,
    transport: Arc<dyn Transport>,
    pending: Arc<PendingAcks>,
    entries: Mutex<Vec<QueuedEvent>>,
    wake: Notify,
    shutdown: Notify,
    unique_id: String,
    id_counter: AtomicU64,
    seq_counter: AtomicU64,
}

impl OutboundQueue {
    pub fn new(
        config: SignalingConfig,
        transport: Arc<dyn Transport>,
        pending: Arc<PendingAcks>,
    ) -> Arc<Self> {
        let mut random_bytes = [0u8; 4];
        rand::rng().fill_bytes(&mut random_bytes);
        Arc::new(Self {
            config,
            transport,
            pending,
            entries: Mutex::new(Vec::new()),
            wake: Notify::new(),
            shutdown: Notify::new(),
            unique_id: hex::encode(random_bytes),
            id_counter: AtomicU64::new(1),
            seq_counter: AtomicU64::new(1),
        })
    }

    /// Generates a new unique event id string.
    pub fn next_event_id(&self) -> String {
        let count = self.id_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.unique_id, count)
    }

    /// Wraps `body` in an envelope and appends it to the queue. The
    /// returned receiver resolves with the entry's final fate; dropping it
    /// is fine for fire-and-forget callers.
    pub async fn enqueue(
        &self,
        body: EventBody,
        priority: i32,
    ) -> oneshot::Receiver<DeliveryOutcome> {
        let event = SignalingEvent::new(body).with_id(self.next_event_id());
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();

        let mut entries = self.entries.lock().await;
        if entries.len() >= self.config.queue_capacity {
            self.prune_locked(&mut entries, now);
        }
        entries.push(QueuedEvent {
            event,
            priority,
            attempts: 0,
            seq: self.seq_counter.fetch_add(1, Ordering::Relaxed),
            enqueued_at: now,
            ready_at: now,
            outcome_tx: Some(tx),
        });
        drop(entries);

        self.wake.notify_one();
        rx
    }

    /// Evicts aged entries from a full queue; if nothing has aged out yet,
    /// the oldest entry goes instead.
    fn prune_locked(&self, entries: &mut Vec<QueuedEvent>, now: Instant) {
        let max_age = self.config.queue_max_age;
        let mut evicted = 0usize;
        let mut index = 0;
        while index < entries.len() {
            if now.duration_since(entries[index].enqueued_at) > max_age {
                entries.remove(index).resolve(DeliveryOutcome::Dropped);
                evicted += 1;
            } else {
                index += 1;
            }
        }
        if evicted == 0 && entries.len() >= self.config.queue_capacity {
            if let Some(oldest) = entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.enqueued_at)
                .map(|(i, _)| i)
            {
                entries.remove(oldest).resolve(DeliveryOutcome::Dropped);
                evicted = 1;
            }
        }
        if evicted > 0 {
            warn!(target: "Client/Queue", "Queue full, evicted {evicted} entr(ies)");
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    /// The delivery loop. Spawn once per queue.
    pub async fn run(self: Arc<Self>) {
        let mut connected = self.transport.subscribe_connected();
        loop {
            // Park while the connection is down; entries stay queued.
            while !*connected.borrow() {
                tokio::select! {
                    changed = connected.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = self.shutdown.notified() => return,
                }
            }

            match self.take_next().await {
                Next::Entry(entry) => self.process_entry(*entry).await,
                Next::Sleep(delay) => {
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = self.wake.notified() => {}
                        _ = self.shutdown.notified() => return,
                    }
                }
                Next::Idle => {
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = self.shutdown.notified() => return,
                    }
                }
            }
        }
    }

    /// Sorts the queue (call events first, then priority descending,
    /// then arrival order) and pops the head-most entry whose backoff
    /// delay has elapsed.
    async fn take_next(&self) -> Next {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if entries.is_empty() {
            return Next::Idle;
        }
        entries.sort_by(|a, b| {
            b.event
                .body
                .is_call_event()
                .cmp(&a.event.body.is_call_event())
                .then(b.priority.cmp(&a.priority))
                .then(a.seq.cmp(&b.seq))
        });
        if let Some(index) = entries.iter().position(|e| e.ready_at <= now) {
            return Next::Entry(Box::new(entries.remove(index)));
        }
        let earliest = entries
            .iter()
            .map(|e| e.ready_at)
            .min()
            .unwrap_or_else(Instant::now);
        Next::Sleep(earliest.saturating_duration_since(now))
    }

    async fn process_entry(&self, mut entry: QueuedEvent) {
        // Ids are assigned at enqueue; this cannot be None.
        let Some(id) = entry.event.id.clone() else {
            entry.resolve(DeliveryOutcome::Dropped);
            return;
        };

        let rx = if entry.event.require_ack {
            Some(self.pending.register(&id))
        } else {
            None
        };

        if let Err(e) = self.transport.send(&entry.event).await {
            self.pending.cancel(&id);
            if self.transport.is_connected() {
                warn!(target: "Client/Queue", "Send failed for {id}: {e}");
                self.retry_or_drop(entry).await;
            } else {
                debug!(target: "Client/Queue", "Connection lost sending {id}, pausing");
                self.requeue(entry).await;
            }
            return;
        }

        let Some(rx) = rx else {
            entry.resolve(DeliveryOutcome::Delivered);
            return;
        };

        match self.pending.wait(&id, rx, self.config.ack_timeout).await {
            AckOutcome::Acked => entry.resolve(DeliveryOutcome::Delivered),
            AckOutcome::ConnectionClosed => {
                debug!(target: "Client/Queue", "Connection closed awaiting ack for {id}, pausing");
                self.requeue(entry).await;
            }
            AckOutcome::Rejected(message) => {
                warn!(target: "Client/Queue", "Event {id} rejected by server: {message}");
                entry.resolve(DeliveryOutcome::Rejected(message));
            }
            AckOutcome::TimedOut => {
                debug!(
                    target: "Client/Queue",
                    "Ack timeout for {id} (attempt {})", entry.attempts + 1
                );
                self.retry_or_drop(entry).await;
            }
        }
    }

    /// Failure path: increment attempts, back off, move to the tail;
    /// past the ceiling the entry is dropped for good.
    async fn retry_or_drop(&self, mut entry: QueuedEvent) {
        entry.attempts += 1;
        if entry.attempts > self.config.max_retries {
            warn!(
                target: "Client/Queue",
                "Dropping {} event after {} attempts",
                entry.event.body.kind(),
                entry.attempts
            );
            entry.resolve(DeliveryOutcome::Dropped);
            return;
        }
        entry.ready_at = Instant::now() + self.config.retry_base_delay * entry.attempts;
        self.entries.lock().await.push(entry);
        self.wake.notify_one();
    }

    /// Pause path: the entry goes back untouched, keeping its place.
    async fn requeue(&self, mut entry: QueuedEvent) {
        entry.ready_at = Instant::now();
        self.entries.lock().await.push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeTransport;
    use crate::types::user::UserId;
    use std::time::Duration;

    fn test_config() -> SignalingConfig {
        SignalingConfig {
            ack_timeout: Duration::from_millis(30),
            retry_base_delay: Duration::from_millis(5),
            max_retries: 2,
            queue_capacity: 4,
            queue_max_age: Duration::from_millis(50),
            ..SignalingConfig::default()
        }
    }

    fn message_body(n: u32) -> EventBody {
        EventBody::Message {
            sender_id: UserId::from("A"),
            receiver_id: UserId::from("B"),
            content: format!("m{n}"),
        }
    }

    /// Bounded retry: after the ceiling the entry is dropped and no
    /// further sends happen.
    #[tokio::test]
    async fn test_retry_ceiling_drops_entry() {
        let transport = FakeTransport::new(true);
        let pending = Arc::new(PendingAcks::new());
        let queue = OutboundQueue::new(test_config(), transport.clone(), pending);

        let outcome_rx = queue.enqueue(message_body(1), 0).await;
        tokio::spawn(queue.clone().run());

        assert_eq!(outcome_rx.await.unwrap(), DeliveryOutcome::Dropped);
        let sent = transport.sent_count();
        assert_eq!(sent, 1 + test_config().max_retries as usize);

        // No further attempts after the drop.
        sleep(Duration::from_millis(80)).await;
        assert_eq!(transport.sent_count(), sent);
        queue.shutdown();
    }

    /// Call events are delivered before same-or-higher-priority chat
    /// events already queued.
    #[tokio::test]
    async fn test_call_events_jump_the_queue() {
        let transport = FakeTransport::new(true);
        let pending = Arc::new(PendingAcks::new());
        transport.auto_ack_into(pending.clone());
        let queue = OutboundQueue::new(test_config(), transport.clone(), pending);

        let _m = queue.enqueue(message_body(1), 5).await;
        let _t = queue
            .enqueue(
                EventBody::Typing {
                    sender_id: UserId::from("A"),
                    receiver_id: UserId::from("B"),
                    is_typing: true,
                },
                5,
            )
            .await;
        let end_rx = queue
            .enqueue(
                EventBody::CallEnd {
                    call_id: "c1".into(),
                    user_id: UserId::from("A"),
                },
                0,
            )
            .await;

        tokio::spawn(queue.clone().run());
        assert_eq!(end_rx.await.unwrap(), DeliveryOutcome::Delivered);

        let kinds = transport.sent_kinds();
        assert_eq!(kinds[0], "call_end");
        queue.shutdown();
    }

    /// A full queue prunes aged entries before accepting a new one.
    #[tokio::test]
    async fn test_full_queue_prunes_aged_entries() {
        let transport = FakeTransport::new(false);
        let pending = Arc::new(PendingAcks::new());
        let config = SignalingConfig {
            queue_capacity: 2,
            queue_max_age: Duration::from_millis(20),
            ..test_config()
        };
        let queue = OutboundQueue::new(config, transport, pending);

        let rx1 = queue.enqueue(message_body(1), 0).await;
        let rx2 = queue.enqueue(message_body(2), 0).await;
        sleep(Duration::from_millis(30)).await;
        let _rx3 = queue.enqueue(message_body(3), 0).await;

        assert_eq!(rx1.await.unwrap(), DeliveryOutcome::Dropped);
        assert_eq!(rx2.await.unwrap(), DeliveryOutcome::Dropped);
        assert_eq!(queue.len().await, 1);
    }

    /// When nothing has aged out, the oldest entry is evicted instead.
    #[tokio::test]
    async fn test_full_queue_evicts_oldest_when_nothing_aged() {
        let transport = FakeTransport::new(false);
        let pending = Arc::new(PendingAcks::new());
        let config = SignalingConfig {
            queue_capacity: 2,
            queue_max_age: Duration::from_secs(60),
            ..test_config()
        };
        let queue = OutboundQueue::new(config, transport, pending);

        let rx1 = queue.enqueue(message_body(1), 0).await;
        let _rx2 = queue.enqueue(message_body(2), 0).await;
        let _rx3 = queue.enqueue(message_body(3), 0).await;

        assert_eq!(rx1.await.unwrap(), DeliveryOutcome::Dropped);
        assert_eq!(queue.len().await, 2);
    }

    /// Entries survive a disconnect and go out after reconnection.
    #[tokio::test]
    async fn test_queue_pauses_and_resumes() {
        let transport = FakeTransport::new(false);
        let pending = Arc::new(PendingAcks::new());
        transport.auto_ack_into(pending.clone());
        let queue = OutboundQueue::new(test_config(), transport.clone(), pending);

        let outcome_rx = queue.enqueue(message_body(1), 0).await;
        tokio::spawn(queue.clone().run());

        sleep(Duration::from_millis(30)).await;
        assert_eq!(transport.sent_count(), 0);

        transport.set_connected(true);
        assert_eq!(outcome_rx.await.unwrap(), DeliveryOutcome::Delivered);
        assert_eq!(transport.sent_count(), 1);
        queue.shutdown();
    }

    /// A server error correlated to the event id resolves it as rejected,
    /// not retried.
    #[tokio::test]
    async fn test_rejected_event_is_not_retried() {
        let transport = FakeTransport::new(true);
        let pending = Arc::new(PendingAcks::new());
        transport.auto_reject_into(pending.clone(), "no such recipient");
        let queue = OutboundQueue::new(test_config(), transport.clone(), pending);

        let outcome_rx = queue.enqueue(message_body(1), 0).await;
        tokio::spawn(queue.clone().run());

        assert_eq!(
            outcome_rx.await.unwrap(),
            DeliveryOutcome::Rejected("no such recipient".into())
        );
        assert_eq!(transport.sent_count(), 1);
        queue.shutdown();
    }
}
