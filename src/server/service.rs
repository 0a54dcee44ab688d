//! Call lifecycle service: admission rules, status transitions and
//! media-session credentials.
//!
//! Backs both the HTTP call endpoints (start/accept/reject/end) and the
//! WebSocket coordinator. All rules here are plain async methods with no
//! socket in sight, so they are tested without one.

use super::store::{CallStore, StoreError};
use crate::config::SignalingConfig;
use crate::directory::Directory;
use crate::types::call::{CallId, CallKind, CallRecord, CallRecordStatus};
use crate::types::user::UserId;
use chrono::Utc;
use log::{info, warn};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("user not found: {0}")]
    UnknownUser(UserId),

    #[error("cannot call yourself")]
    SelfCall,

    #[error("no accepted friendship between {0} and {1}")]
    NotFriends(UserId, UserId),

    #[error("active call already exists between {caller} and {recipient}")]
    AlreadyActive { caller: UserId, recipient: UserId },

    #[error("call {id} is {status:?}, cannot {action}")]
    InvalidStatus {
        id: CallId,
        status: CallRecordStatus,
        action: &'static str,
    },

    #[error("{user} is not a participant of call {id}")]
    NotParticipant { id: CallId, user: UserId },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of an admitted call start: the persisted record plus the
/// caller's media credential.
#[derive(Debug, Clone)]
pub struct CallStart {
    pub record: CallRecord,
    pub token: String,
}

pub struct CallService {
    config: SignalingConfig,
    store: Arc<dyn CallStore>,
    directory: Arc<dyn Directory>,
}

impl CallService {
    pub fn new(
        config: SignalingConfig,
        store: Arc<dyn CallStore>,
        directory: Arc<dyn Directory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            directory,
        })
    }

    pub fn store(&self) -> &Arc<dyn CallStore> {
        &self.store
    }

    /// Short-lived credential for connecting to a call's media room.
    /// Derived, not stored; the provider validates it out of band.
    pub fn issue_token(&self, room_name: &str, user: &UserId) -> String {
        let mut data = Vec::with_capacity(room_name.len() + 8 + 16);
        data.extend_from_slice(room_name.as_bytes());
        data.extend_from_slice(user.as_str().as_bytes());
        data.extend_from_slice(&Utc::now().timestamp_millis().to_be_bytes());
        let mut random_bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut random_bytes);
        data.extend_from_slice(&random_bytes);
        hex::encode(Sha256::digest(&data))
    }

    /// Admission for a new call attempt: both users exist, are distinct,
    /// are friends, and have no live call between them. Stale active
    /// records left behind by crashed clients are marked failed on the
    /// way through.
    pub async fn start_call(
        &self,
        caller: UserId,
        recipient: UserId,
        kind: CallKind,
    ) -> Result<CallStart, ServiceError> {
        if caller == recipient {
            return Err(ServiceError::SelfCall);
        }
        if !self.directory.user_exists(&caller).await {
            return Err(ServiceError::UnknownUser(caller));
        }
        if !self.directory.user_exists(&recipient).await {
            return Err(ServiceError::UnknownUser(recipient));
        }
        if !self.directory.are_friends(&caller, &recipient).await {
            return Err(ServiceError::NotFriends(caller, recipient));
        }

        let window = chrono::Duration::from_std(self.config.active_call_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let cutoff = Utc::now() - window;
        for stale in self.store.active_between(&caller, &recipient, kind).await? {
            if stale.created_at < cutoff {
                warn!(
                    target: "Server/Calls",
                    "Marking stale call {} as failed", stale.id
                );
                self.store
                    .update(
                        &stale.id,
                        Box::new(|r| {
                            r.status = CallRecordStatus::Failed;
                            r.ended_at = Some(Utc::now());
                        }),
                    )
                    .await?;
            } else {
                return Err(ServiceError::AlreadyActive { caller, recipient });
            }
        }

        let mut record = CallRecord::new(caller.clone(), recipient, kind);
        record.session_ref = Some(hex::encode(
            &Sha256::digest(record.room_name.as_bytes())[..8],
        ));
        let token = self.issue_token(&record.room_name, &caller);
        info!(
            target: "Server/Calls",
            "Call {} admitted: {} -> {} ({kind})", record.id, record.caller, record.recipient
        );
        self.store.insert(record.clone()).await?;
        Ok(CallStart { record, token })
    }

    /// The relay was acknowledged by the recipient's client: the call is
    /// audibly ringing now.
    pub async fn mark_ringing(&self, id: &CallId) -> Result<CallRecord, ServiceError> {
        let record = self.store.get(id).await?;
        if record.status != CallRecordStatus::Initiated {
            return Ok(record);
        }
        Ok(self
            .store
            .update(
                id,
                Box::new(|r| {
                    if r.status == CallRecordStatus::Initiated {
                        r.status = CallRecordStatus::Ringing;
                    }
                }),
            )
            .await?)
    }

    /// Delivery to the recipient failed outright.
    pub async fn mark_missed(&self, id: &CallId) -> Result<CallRecord, ServiceError> {
        Ok(self
            .store
            .update(
                id,
                Box::new(|r| {
                    if r.status.is_active() {
                        r.status = CallRecordStatus::Missed;
                        r.ended_at = Some(Utc::now());
                    }
                }),
            )
            .await?)
    }

    pub async fn accept_call(
        &self,
        id: &CallId,
        acceptor: &UserId,
    ) -> Result<CallRecord, ServiceError> {
        let record = self.store.get(id).await?;
        if &record.recipient != acceptor {
            return Err(ServiceError::NotParticipant {
                id: id.clone(),
                user: acceptor.clone(),
            });
        }
        if !record.status.is_active() {
            return Err(ServiceError::InvalidStatus {
                id: id.clone(),
                status: record.status,
                action: "accept",
            });
        }
        Ok(self
            .store
            .update(
                id,
                Box::new(|r| {
                    r.status = CallRecordStatus::Connected;
                    r.started_at = Some(Utc::now());
                }),
            )
            .await?)
    }

    pub async fn reject_call(
        &self,
        id: &CallId,
        rejector: &UserId,
    ) -> Result<CallRecord, ServiceError> {
        let record = self.store.get(id).await?;
        if !record.involves(rejector) {
            return Err(ServiceError::NotParticipant {
                id: id.clone(),
                user: rejector.clone(),
            });
        }
        if !record.status.is_active() {
            return Err(ServiceError::InvalidStatus {
                id: id.clone(),
                status: record.status,
                action: "reject",
            });
        }
        Ok(self
            .store
            .update(
                id,
                Box::new(|r| {
                    r.status = CallRecordStatus::Rejected;
                    r.ended_at = Some(Utc::now());
                }),
            )
            .await?)
    }

    /// Terminates a call. A connected call completes; an unanswered one
    /// counts as missed. Ending an already-terminal call is a no-op so
    /// duplicate `call_end` events stay idempotent.
    pub async fn end_call(&self, id: &CallId, user: &UserId) -> Result<CallRecord, ServiceError> {
        let record = self.store.get(id).await?;
        if !record.involves(user) {
            return Err(ServiceError::NotParticipant {
                id: id.clone(),
                user: user.clone(),
            });
        }
        if record.status.is_terminal() {
            return Ok(record);
        }
        Ok(self
            .store
            .update(
                id,
                Box::new(|r| {
                    r.status = match r.status {
                        CallRecordStatus::Connected => CallRecordStatus::Completed,
                        _ => CallRecordStatus::Missed,
                    };
                    r.ended_at = Some(Utc::now());
                }),
            )
            .await?)
    }

    /// Sweeps active records older than the recency window to failed.
    /// Bounds how long a record orphaned by a crashed client (or a lost
    /// relay ack) can dangle in `initiated`/`ringing`.
    pub async fn expire_stale(&self) -> Result<usize, ServiceError> {
        let window = chrono::Duration::from_std(self.config.active_call_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let cutoff = Utc::now() - window;
        let mut expired = 0usize;
        for record in self.store.all_active().await? {
            if record.created_at < cutoff {
                self.store
                    .update(
                        &record.id,
                        Box::new(|r| {
                            if r.status.is_active() {
                                r.status = CallRecordStatus::Failed;
                                r.ended_at = Some(Utc::now());
                            }
                        }),
                    )
                    .await?;
                expired += 1;
            }
        }
        if expired > 0 {
            info!(target: "Server/Calls", "Expired {expired} stale call record(s)");
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::store::MemoryCallStore;
    use crate::test_utils::StaticDirectory;
    use std::time::Duration;

    fn service_with_window(window: Duration) -> (Arc<CallService>, Arc<MemoryCallStore>) {
        let store = Arc::new(MemoryCallStore::new());
        let directory = Arc::new(
            StaticDirectory::new()
                .with_user("A", "Alice")
                .with_user("B", "Bob")
                .with_user("C", "Carol")
                .with_friends("A", "B"),
        );
        let config = SignalingConfig {
            active_call_window: window,
            ..SignalingConfig::default()
        };
        let service = CallService::new(config, store.clone(), directory);
        (service, store)
    }

    fn service() -> (Arc<CallService>, Arc<MemoryCallStore>) {
        service_with_window(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_start_call_happy_path() {
        let (service, store) = service();
        let start = service
            .start_call(UserId::from("A"), UserId::from("B"), CallKind::Voice)
            .await
            .unwrap();

        assert_eq!(start.record.status, CallRecordStatus::Initiated);
        assert!(start.record.room_name.starts_with("voice-A-B-"));
        assert!(!start.token.is_empty());
        assert!(start.record.session_ref.is_some());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_admission_rules() {
        let (service, _) = service();

        let err = service
            .start_call(UserId::from("A"), UserId::from("A"), CallKind::Voice)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::SelfCall));

        let err = service
            .start_call(UserId::from("A"), UserId::from("nobody"), CallKind::Voice)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::UnknownUser(_)));

        // C exists but has no friendship with A.
        let err = service
            .start_call(UserId::from("A"), UserId::from("C"), CallKind::Voice)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFriends(_, _)));
    }

    /// A second start within the recency window is refused while the
    /// first is still active.
    #[tokio::test]
    async fn test_duplicate_active_call_refused() {
        let (service, _) = service();
        service
            .start_call(UserId::from("A"), UserId::from("B"), CallKind::Voice)
            .await
            .unwrap();

        let err = service
            .start_call(UserId::from("A"), UserId::from("B"), CallKind::Voice)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyActive { .. }));
    }

    /// A stale active record is self-healed to failed and the new call
    /// admitted.
    #[tokio::test]
    async fn test_stale_active_call_is_healed() {
        let (service, store) = service_with_window(Duration::from_millis(10));
        let first = service
            .start_call(UserId::from("A"), UserId::from("B"), CallKind::Voice)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = service
            .start_call(UserId::from("A"), UserId::from("B"), CallKind::Voice)
            .await
            .unwrap();

        assert_eq!(
            store.get(&first.record.id).await.unwrap().status,
            CallRecordStatus::Failed
        );
        assert_eq!(second.record.status, CallRecordStatus::Initiated);
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let (service, _) = service();
        let start = service
            .start_call(UserId::from("A"), UserId::from("B"), CallKind::Video)
            .await
            .unwrap();
        let id = start.record.id.clone();

        let ringing = service.mark_ringing(&id).await.unwrap();
        assert_eq!(ringing.status, CallRecordStatus::Ringing);

        let connected = service.accept_call(&id, &UserId::from("B")).await.unwrap();
        assert_eq!(connected.status, CallRecordStatus::Connected);
        assert!(connected.started_at.is_some());

        let completed = service.end_call(&id, &UserId::from("A")).await.unwrap();
        assert_eq!(completed.status, CallRecordStatus::Completed);
        assert!(completed.ended_at.is_some());
    }

    /// Only the recipient may accept, and never twice.
    #[tokio::test]
    async fn test_accept_guards() {
        let (service, _) = service();
        let start = service
            .start_call(UserId::from("A"), UserId::from("B"), CallKind::Voice)
            .await
            .unwrap();
        let id = start.record.id.clone();

        let err = service.accept_call(&id, &UserId::from("A")).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotParticipant { .. }));

        service.accept_call(&id, &UserId::from("B")).await.unwrap();
        let err = service.accept_call(&id, &UserId::from("B")).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidStatus { .. }));
    }

    /// Ending twice is idempotent: the second call returns the terminal
    /// record unchanged.
    #[tokio::test]
    async fn test_end_is_idempotent() {
        let (service, _) = service();
        let start = service
            .start_call(UserId::from("A"), UserId::from("B"), CallKind::Voice)
            .await
            .unwrap();
        let id = start.record.id.clone();
        service.accept_call(&id, &UserId::from("B")).await.unwrap();

        let first = service.end_call(&id, &UserId::from("B")).await.unwrap();
        assert_eq!(first.status, CallRecordStatus::Completed);
        let ended_at = first.ended_at;

        let second = service.end_call(&id, &UserId::from("A")).await.unwrap();
        assert_eq!(second.status, CallRecordStatus::Completed);
        assert_eq!(second.ended_at, ended_at);
    }

    /// Ending an unanswered call records it as missed.
    #[tokio::test]
    async fn test_cancel_unanswered_is_missed() {
        let (service, _) = service();
        let start = service
            .start_call(UserId::from("A"), UserId::from("B"), CallKind::Voice)
            .await
            .unwrap();

        let record = service
            .end_call(&start.record.id, &UserId::from("A"))
            .await
            .unwrap();
        assert_eq!(record.status, CallRecordStatus::Missed);
    }

    /// The expiry sweep fails dangling active records past the window.
    #[tokio::test]
    async fn test_expire_stale_sweep() {
        let (service, store) = service_with_window(Duration::from_millis(10));
        let start = service
            .start_call(UserId::from("A"), UserId::from("B"), CallKind::Voice)
            .await
            .unwrap();

        assert_eq!(service.expire_stale().await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(service.expire_stale().await.unwrap(), 1);
        assert_eq!(
            store.get(&start.record.id).await.unwrap().status,
            CallRecordStatus::Failed
        );
    }
}
