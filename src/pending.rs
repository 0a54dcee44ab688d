//! Pending-acknowledgment table shared by the client queue and the
//! server relay.
//!
//! Each entry maps an event id to a oneshot resolver. The waiter applies
//! its own deadline and deregisters on expiry; connection close fails
//! every outstanding entry at once so nothing is left hanging.

use dashmap::DashMap;
use log::warn;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;

/// How a wait for an acknowledgment resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Acked,
    TimedOut,
    ConnectionClosed,
    Rejected(String),
}

impl AckOutcome {
    pub fn is_acked(&self) -> bool {
        matches!(self, Self::Acked)
    }
}

struct PendingEntry {
    resolver: oneshot::Sender<AckOutcome>,
    /// Connection the ack is expected from; lets a close fail only its
    /// own entries.
    tag: Option<u64>,
}

#[derive(Default)]
pub struct PendingAcks {
    waiters: DashMap<String, PendingEntry>,
}

impl PendingAcks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `id`. Must be called before the event is
    /// sent, or the ack can race the registration.
    pub fn register(&self, id: &str) -> oneshot::Receiver<AckOutcome> {
        self.register_tagged(id, None)
    }

    pub fn register_tagged(&self, id: &str, tag: Option<u64>) -> oneshot::Receiver<AckOutcome> {
        let (tx, rx) = oneshot::channel();
        if self
            .waiters
            .insert(id.to_string(), PendingEntry { resolver: tx, tag })
            .is_some()
        {
            warn!(target: "Pending", "Duplicate pending registration for id {id}, replacing");
        }
        rx
    }

    /// Resolves the waiter for `id`, returning whether one existed.
    pub fn resolve(&self, id: &str, outcome: AckOutcome) -> bool {
        match self.waiters.remove(id) {
            Some((_, entry)) => {
                if entry.resolver.send(outcome).is_err() {
                    warn!(target: "Pending", "Waiter for id {id} was dropped before resolution");
                }
                true
            }
            None => false,
        }
    }

    /// Drops the waiter for `id` without resolving it.
    pub fn cancel(&self, id: &str) {
        self.waiters.remove(id);
    }

    /// Fails every outstanding entry; used when a connection closes.
    pub fn fail_all(&self) {
        let ids: Vec<String> = self.waiters.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.resolve(&id, AckOutcome::ConnectionClosed);
        }
    }

    /// Fails every entry registered against connection `tag`.
    pub fn fail_tagged(&self, tag: u64) {
        let ids: Vec<String> = self
            .waiters
            .iter()
            .filter(|e| e.value().tag == Some(tag))
            .map(|e| e.key().clone())
            .collect();
        for id in ids {
            self.resolve(&id, AckOutcome::ConnectionClosed);
        }
    }

    /// Awaits the registered receiver with a deadline, deregistering the
    /// entry if the deadline fires first.
    pub async fn wait(
        &self,
        id: &str,
        rx: oneshot::Receiver<AckOutcome>,
        deadline: Duration,
    ) -> AckOutcome {
        match timeout(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => AckOutcome::ConnectionClosed,
            Err(_) => {
                self.cancel(id);
                AckOutcome::TimedOut
            }
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_wakes_waiter() {
        let pending = PendingAcks::new();
        let rx = pending.register("ev-1");
        assert!(pending.resolve("ev-1", AckOutcome::Acked));
        assert_eq!(
            pending.wait("ev-1", rx, Duration::from_secs(1)).await,
            AckOutcome::Acked
        );
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_deregisters_entry() {
        let pending = PendingAcks::new();
        let rx = pending.register("ev-1");
        let outcome = pending.wait("ev-1", rx, Duration::from_millis(10)).await;
        assert_eq!(outcome, AckOutcome::TimedOut);
        assert!(pending.is_empty());
        // A late ack for the expired id is simply unknown.
        assert!(!pending.resolve("ev-1", AckOutcome::Acked));
    }

    #[tokio::test]
    async fn test_fail_all_resolves_everything() {
        let pending = PendingAcks::new();
        let rx1 = pending.register("ev-1");
        let rx2 = pending.register("ev-2");
        pending.fail_all();
        assert_eq!(rx1.await.unwrap(), AckOutcome::ConnectionClosed);
        assert_eq!(rx2.await.unwrap(), AckOutcome::ConnectionClosed);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_fail_tagged_spares_other_connections() {
        let pending = PendingAcks::new();
        let rx1 = pending.register_tagged("ev-1", Some(7));
        let _rx2 = pending.register_tagged("ev-2", Some(8));
        pending.fail_tagged(7);
        assert_eq!(rx1.await.unwrap(), AckOutcome::ConnectionClosed);
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_ack_is_reported() {
        let pending = PendingAcks::new();
        assert!(!pending.resolve("nope", AckOutcome::Acked));
    }
}
