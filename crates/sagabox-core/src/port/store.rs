//! # Transactional Store Port
//!
//! The data store collaborator: atomic multi-row transactions with a
//! uniqueness-constraint primitive (inbox deduplication) and a
//! compare-and-swap update primitive (saga version checks).
//!
//! All exactly-once guarantees in this crate rest on one rule: the inbox
//! record, the business effect (saga mutation) and the emitted outbox rows
//! are written through the *same* [`StoreTransaction`], so they commit or
//! roll back as a unit. No in-memory lock anywhere substitutes for this.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::port::{InboxRecord, OutboxMessage};
use crate::saga::SagaInstance;

/// Store-level errors. All variants except the constraint violations are
/// transient: retry with backoff.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection dropped, commit timed out, store down.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Optimistic concurrency check failed: another worker advanced the
    /// saga instance first. Re-read and re-decide.
    #[error("version conflict on saga '{correlation_id}': expected {expected}, found {found}")]
    VersionConflict {
        correlation_id: String,
        expected: u64,
        found: u64,
    },

    /// Uniqueness constraint violation on the inbox primary key: the
    /// message was already processed by a concurrent transaction.
    #[error("duplicate inbox key {0}")]
    DuplicateKey(Uuid),

    /// Persisted instance could not be (de)serialized.
    #[error("serialization failure: {0}")]
    Serialization(String),
}

/// Factory for store transactions.
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    /// Transaction handle type produced by this store.
    type Tx: StoreTransaction;

    /// Open a new transaction with at least read-committed isolation.
    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}

/// One open unit of work against the store.
///
/// Dropping a transaction without calling [`commit`](Self::commit) must
/// discard every buffered write, equivalent to [`rollback`](Self::rollback).
#[async_trait]
pub trait StoreTransaction: Send {
    /// Stage an outbound message. Only ever called inside an open
    /// transaction; performs no broker I/O.
    async fn append_outbox(&mut self, message: OutboxMessage) -> Result<(), StoreError>;

    /// Try to insert an inbox record. Returns `false` when a record for the
    /// message id already exists (duplicate delivery). A `true` here can
    /// still lose a race at commit time, surfacing as
    /// [`StoreError::DuplicateKey`].
    async fn insert_inbox(&mut self, record: InboxRecord) -> Result<bool, StoreError>;

    /// Load a saga instance by correlation id.
    async fn load_saga(&mut self, correlation_id: &str)
        -> Result<Option<SagaInstance>, StoreError>;

    /// Persist a saga instance.
    ///
    /// `expected_version: None` inserts a new instance (fails with
    /// [`StoreError::VersionConflict`] if one exists); `Some(v)` is a
    /// compare-and-swap against the currently committed version.
    async fn save_saga(
        &mut self,
        instance: SagaInstance,
        expected_version: Option<u64>,
    ) -> Result<(), StoreError>;

    /// Atomically commit every buffered write. Constraint races that passed
    /// the early checks are reported here.
    async fn commit(self) -> Result<(), StoreError>;

    /// Discard every buffered write.
    async fn rollback(self) -> Result<(), StoreError>;
}
