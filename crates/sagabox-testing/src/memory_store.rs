//! In-memory implementation of the store ports for testing.
//!
//! Thread-safe, no database required. Transactions buffer their writes and
//! apply them atomically under one lock at commit, re-checking the inbox
//! uniqueness constraint and the saga version compare-and-swap against the
//! committed state. Early checks can therefore pass and still lose at
//! commit, exactly like two database transactions racing on a constraint.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use sagabox_core::port::{
    InboxRecord, OutboxMessage, OutboxState, OutboxStore, StoreError, StoreTransaction,
    TransactionalStore,
};
use sagabox_core::saga::SagaInstance;

#[derive(Default)]
struct Inner {
    outbox: Vec<OutboxMessage>,
    inbox: HashMap<Uuid, InboxRecord>,
    sagas: HashMap<String, SagaInstance>,
    /// Failpoint: the next N commits fail with a version conflict after
    /// buffering, without applying anything.
    commit_conflicts: u32,
}

/// In-memory transactional store.
///
/// Shared state lives behind one `parking_lot::Mutex`; locks are only held
/// across synchronous sections, never across awaits.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with a version conflict, to exercise
    /// the consumer's re-read-and-retry path without real thread races.
    pub fn inject_commit_conflicts(&self, n: u32) {
        self.inner.lock().commit_conflicts = n;
    }

    /// Committed saga instance, if any.
    pub fn saga(&self, correlation_id: &str) -> Option<SagaInstance> {
        self.inner.lock().sagas.get(correlation_id).cloned()
    }

    /// Committed outbox rows, oldest first.
    pub fn outbox_rows(&self) -> Vec<OutboxMessage> {
        self.inner.lock().outbox.clone()
    }

    /// Number of committed inbox markers.
    pub fn inbox_len(&self) -> usize {
        self.inner.lock().inbox.len()
    }
}

#[async_trait]
impl TransactionalStore for MemoryStore {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction, StoreError> {
        Ok(MemoryTransaction {
            inner: self.inner.clone(),
            outbox: Vec::new(),
            inbox: Vec::new(),
            sagas: Vec::new(),
        })
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxMessage>, StoreError> {
        let inner = self.inner.lock();
        let mut rows: Vec<OutboxMessage> = inner
            .outbox
            .iter()
            .filter(|row| row.is_pending())
            .cloned()
            .collect();
        // Oldest first per the contract; commit order breaks timestamp ties.
        rows.sort_by_key(|row| row.created_at);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn mark_sent(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        match inner.outbox.iter_mut().find(|row| row.id == id) {
            Some(row) if row.is_pending() => {
                row.state = OutboxState::Sent;
                row.sent_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// One buffered unit of work against a [`MemoryStore`].
pub struct MemoryTransaction {
    inner: Arc<Mutex<Inner>>,
    outbox: Vec<OutboxMessage>,
    inbox: Vec<InboxRecord>,
    sagas: Vec<(SagaInstance, Option<u64>)>,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn append_outbox(&mut self, message: OutboxMessage) -> Result<(), StoreError> {
        self.outbox.push(message);
        Ok(())
    }

    async fn insert_inbox(&mut self, record: InboxRecord) -> Result<bool, StoreError> {
        if self.inner.lock().inbox.contains_key(&record.message_id) {
            return Ok(false);
        }
        if self.inbox.iter().any(|r| r.message_id == record.message_id) {
            return Ok(false);
        }
        self.inbox.push(record);
        Ok(true)
    }

    async fn load_saga(
        &mut self,
        correlation_id: &str,
    ) -> Result<Option<SagaInstance>, StoreError> {
        // Reads see committed state plus this transaction's own writes.
        if let Some((instance, _)) = self
            .sagas
            .iter()
            .rev()
            .find(|(i, _)| i.correlation_id == correlation_id)
        {
            return Ok(Some(instance.clone()));
        }
        Ok(self.inner.lock().sagas.get(correlation_id).cloned())
    }

    async fn save_saga(
        &mut self,
        instance: SagaInstance,
        expected_version: Option<u64>,
    ) -> Result<(), StoreError> {
        self.sagas.push((instance, expected_version));
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();

        if inner.commit_conflicts > 0 {
            inner.commit_conflicts -= 1;
            let correlation_id = self
                .sagas
                .first()
                .map(|(i, _)| i.correlation_id.clone())
                .unwrap_or_default();
            return Err(StoreError::VersionConflict {
                correlation_id,
                expected: 0,
                found: 0,
            });
        }

        // Validate every constraint before applying anything.
        for record in &self.inbox {
            if inner.inbox.contains_key(&record.message_id) {
                return Err(StoreError::DuplicateKey(record.message_id));
            }
        }
        for (instance, expected_version) in &self.sagas {
            let found = inner
                .sagas
                .get(&instance.correlation_id)
                .map(|existing| existing.version);
            match (expected_version, found) {
                (None, None) => {}
                (None, Some(found)) => {
                    return Err(StoreError::VersionConflict {
                        correlation_id: instance.correlation_id.clone(),
                        expected: 0,
                        found,
                    });
                }
                (Some(expected), Some(found)) if *expected == found => {}
                (Some(expected), found) => {
                    return Err(StoreError::VersionConflict {
                        correlation_id: instance.correlation_id.clone(),
                        expected: *expected,
                        found: found.unwrap_or(0),
                    });
                }
            }
        }

        for record in self.inbox {
            inner.inbox.insert(record.message_id, record);
        }
        for (instance, _) in self.sagas {
            inner
                .sagas
                .insert(instance.correlation_id.clone(), instance);
        }
        inner.outbox.extend(self.outbox);
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}
