//! Call-record persistence behind a trait, with an in-memory default.
//!
//! The production deployment backs this with the document store the CRUD
//! layer already uses; the signaling core only needs the operations
//! below.

use crate::types::call::{CallId, CallKind, CallRecord};
use crate::types::user::UserId;
use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("call not found: {0}")]
    NotFound(CallId),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Mutation applied under the store's record lock.
pub type RecordUpdate = Box<dyn FnOnce(&mut CallRecord) + Send>;

#[async_trait]
pub trait CallStore: Send + Sync {
    async fn insert(&self, record: CallRecord) -> Result<()>;

    async fn get(&self, id: &CallId) -> Result<CallRecord>;

    /// Applies `update` atomically and returns the record after the
    /// mutation.
    async fn update(&self, id: &CallId, update: RecordUpdate) -> Result<CallRecord>;

    /// Records with an active status between the ordered pair, matching
    /// `kind`.
    async fn active_between(
        &self,
        caller: &UserId,
        recipient: &UserId,
        kind: CallKind,
    ) -> Result<Vec<CallRecord>>;

    /// Every record still in an active status, for the expiry sweep.
    async fn all_active(&self) -> Result<Vec<CallRecord>>;
}

#[derive(Default)]
pub struct MemoryCallStore {
    records: DashMap<CallId, CallRecord>,
}

impl MemoryCallStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl CallStore for MemoryCallStore {
    async fn insert(&self, record: CallRecord) -> Result<()> {
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get(&self, id: &CallId) -> Result<CallRecord> {
        self.records
            .get(id)
            .map(|r| r.clone())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn update(&self, id: &CallId, update: RecordUpdate) -> Result<CallRecord> {
        let mut entry = self
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        update(entry.value_mut());
        Ok(entry.clone())
    }

    async fn active_between(
        &self,
        caller: &UserId,
        recipient: &UserId,
        kind: CallKind,
    ) -> Result<Vec<CallRecord>> {
        Ok(self
            .records
            .iter()
            .filter(|r| {
                r.status.is_active()
                    && r.kind == kind
                    && &r.caller == caller
                    && &r.recipient == recipient
            })
            .map(|r| r.clone())
            .collect())
    }

    async fn all_active(&self) -> Result<Vec<CallRecord>> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.status.is_active())
            .map(|r| r.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::call::CallRecordStatus;

    fn record() -> CallRecord {
        CallRecord::new(UserId::from("A"), UserId::from("B"), CallKind::Voice)
    }

    #[tokio::test]
    async fn test_insert_get_update() {
        let store = MemoryCallStore::new();
        let rec = record();
        let id = rec.id.clone();
        store.insert(rec).await.unwrap();

        let fetched = store.get(&id).await.unwrap();
        assert_eq!(fetched.status, CallRecordStatus::Initiated);

        let updated = store
            .update(
                &id,
                Box::new(|r| {
                    r.status = CallRecordStatus::Ringing;
                }),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, CallRecordStatus::Ringing);
        assert_eq!(
            store.get(&id).await.unwrap().status,
            CallRecordStatus::Ringing
        );
    }

    #[tokio::test]
    async fn test_missing_record_is_not_found() {
        let store = MemoryCallStore::new();
        let err = store.get(&CallId::from("nope")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_active_between_filters_by_pair_kind_and_status() {
        let store = MemoryCallStore::new();
        let rec = record();
        let id = rec.id.clone();
        store.insert(rec).await.unwrap();

        let active = store
            .active_between(&UserId::from("A"), &UserId::from("B"), CallKind::Voice)
            .await
            .unwrap();
        assert_eq!(active.len(), 1);

        // Reverse direction and different kind do not match.
        assert!(
            store
                .active_between(&UserId::from("B"), &UserId::from("A"), CallKind::Voice)
                .await
                .unwrap()
                .is_empty()
        );
        assert!(
            store
                .active_between(&UserId::from("A"), &UserId::from("B"), CallKind::Video)
                .await
                .unwrap()
                .is_empty()
        );

        store
            .update(
                &id,
                Box::new(|r| {
                    r.status = CallRecordStatus::Completed;
                }),
            )
            .await
            .unwrap();
        assert!(
            store
                .active_between(&UserId::from("A"), &UserId::from("B"), CallKind::Voice)
                .await
                .unwrap()
                .is_empty()
        );
    }
}
