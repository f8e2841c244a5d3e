//! Persistence for the desired and observed VM record sets.
//!
//! Backends implement the `StateStore` trait. Every operation is atomic per
//! key; `list` returns a consistent snapshot of one set.

pub mod sqlite;

pub use sqlite::SqliteStateStore;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::{StoreError, StoreResult};
use crate::vm::{RecordSet, VmRecord};

/// Dual-set VM record store.
///
/// Reads take a cancellation token and give up as soon as it fires. Writes
/// do not: once issued they either commit or fail as a whole.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert or replace a record, refreshing its `updated_at`.
    ///
    /// Returns the record as stored.
    async fn put(&self, set: RecordSet, record: VmRecord) -> StoreResult<VmRecord>;

    /// Store `record` only if it is newer than what is already stored.
    ///
    /// Last writer wins by `updated_at`; the supplied timestamp is kept.
    /// Returns `false` when an equal or newer record was already present.
    async fn put_if_newer(&self, set: RecordSet, record: VmRecord) -> StoreResult<bool>;

    /// Fetch one record. A missing key is `StoreError::NotFound`.
    async fn get(
        &self,
        set: RecordSet,
        name: &str,
        cancel: &CancellationToken,
    ) -> StoreResult<VmRecord>;

    /// Snapshot of a whole set, in no particular order.
    async fn list(&self, set: RecordSet, cancel: &CancellationToken)
        -> StoreResult<Vec<VmRecord>>;

    /// Remove a record. Returns whether it existed.
    async fn delete(&self, set: RecordSet, name: &str) -> StoreResult<bool>;
}

/// Race a read against cancellation.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    read: impl Future<Output = StoreResult<T>>,
) -> StoreResult<T> {
    if cancel.is_cancelled() {
        return Err(StoreError::Cancelled);
    }
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(StoreError::Cancelled),
        result = read => result,
    }
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    desired: RwLock<HashMap<String, VmRecord>>,
    observed: RwLock<HashMap<String, VmRecord>>,
    unavailable: AtomicBool,
}

impl InMemoryStateStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with `StoreUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn records(&self, set: RecordSet) -> &RwLock<HashMap<String, VmRecord>> {
        match set {
            RecordSet::Desired => &self.desired,
            RecordSet::Observed => &self.observed,
        }
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::StoreUnavailable(
                "in-memory store switched off".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn put(&self, set: RecordSet, mut record: VmRecord) -> StoreResult<VmRecord> {
        self.check_available()?;
        record.validate()?;
        record.updated_at = Utc::now();
        self.records(set)
            .write()
            .insert(record.name.clone(), record.clone());
        Ok(record)
    }

    async fn put_if_newer(&self, set: RecordSet, record: VmRecord) -> StoreResult<bool> {
        self.check_available()?;
        record.validate()?;
        let mut records = self.records(set).write();
        if let Some(current) = records.get(&record.name) {
            if current.updated_at >= record.updated_at {
                return Ok(false);
            }
        }
        records.insert(record.name.clone(), record);
        Ok(true)
    }

    async fn get(
        &self,
        set: RecordSet,
        name: &str,
        cancel: &CancellationToken,
    ) -> StoreResult<VmRecord> {
        cancellable(cancel, async {
            self.check_available()?;
            self.records(set)
                .read()
                .get(name)
                .cloned()
                .ok_or_else(|| StoreError::not_found(set, name))
        })
        .await
    }

    async fn list(
        &self,
        set: RecordSet,
        cancel: &CancellationToken,
    ) -> StoreResult<Vec<VmRecord>> {
        cancellable(cancel, async {
            self.check_available()?;
            Ok(self.records(set).read().values().cloned().collect())
        })
        .await
    }

    async fn delete(&self, set: RecordSet, name: &str) -> StoreResult<bool> {
        self.check_available()?;
        Ok(self.records(set).write().remove(name).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VmState;

    fn web1() -> VmRecord {
        VmRecord::new("web1", 2, 2048, "ubuntu-22.04", VmState::Running)
    }

    #[tokio::test]
    async fn test_sets_are_independent() {
        let store = InMemoryStateStore::new();
        let cancel = CancellationToken::new();
        store.put(RecordSet::Desired, web1()).await.unwrap();

        let err = store
            .get(RecordSet::Observed, "web1", &cancel)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.list(RecordSet::Desired, &cancel).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_put_if_newer_keeps_latest() {
        let store = InMemoryStateStore::new();
        let cancel = CancellationToken::new();
        let stored = store.put(RecordSet::Observed, web1()).await.unwrap();

        let mut stale = stored.clone();
        stale.state = VmState::Stopped;
        stale.updated_at = stored.updated_at - chrono::Duration::seconds(5);
        assert!(!store.put_if_newer(RecordSet::Observed, stale).await.unwrap());

        let mut fresh = stored.clone();
        fresh.state = VmState::Failed;
        fresh.updated_at = stored.updated_at + chrono::Duration::seconds(5);
        assert!(store.put_if_newer(RecordSet::Observed, fresh).await.unwrap());

        let got = store.get(RecordSet::Observed, "web1", &cancel).await.unwrap();
        assert_eq!(got.state, VmState::Failed);
    }

    #[tokio::test]
    async fn test_unavailable_fails_every_operation() {
        let store = InMemoryStateStore::new();
        let cancel = CancellationToken::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.put(RecordSet::Desired, web1()).await,
            Err(StoreError::StoreUnavailable(_))
        ));
        assert!(matches!(
            store.list(RecordSet::Desired, &cancel).await,
            Err(StoreError::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_read() {
        let store = InMemoryStateStore::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            store.list(RecordSet::Desired, &cancel).await,
            Err(StoreError::Cancelled)
        ));
    }
}
