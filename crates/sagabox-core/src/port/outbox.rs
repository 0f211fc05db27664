//! # Outbox Port
//!
//! Durable staging table for outbound messages, written in the same local
//! transaction as the domain state change they announce. A separate relay
//! drains pending rows and publishes them to the broker, giving
//! at-least-once delivery without a distributed transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::Result;
use crate::port::StoreError;

/// Lifecycle of an outbox row. Once `Sent`, the row is never mutated again
/// except for archival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxState {
    /// Staged, waiting for the relay.
    Pending,
    /// Confirmed published to the broker.
    Sent,
}

impl std::fmt::Display for OutboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutboxState::Pending => write!(f, "pending"),
            OutboxState::Sent => write!(f, "sent"),
        }
    }
}

/// One staged outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    /// Message id, equal to the staged envelope's id.
    pub id: Uuid,
    /// Logical topic/queue name the relay publishes to.
    pub destination: String,
    /// Message type tag, duplicated out of the envelope for observability.
    pub message_type: String,
    /// Encoded envelope bytes, published verbatim.
    pub payload: Vec<u8>,
    /// Current lifecycle state.
    pub state: OutboxState,
    /// When the row was staged.
    pub created_at: DateTime<Utc>,
    /// When the relay confirmed publication.
    pub sent_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    /// Stage an envelope for a destination. The row id is the envelope id,
    /// which downstream inboxes use as their deduplication key.
    pub fn stage(destination: impl Into<String>, envelope: &Envelope) -> Result<Self> {
        Ok(Self {
            id: envelope.id,
            destination: destination.into(),
            message_type: envelope.message_type.clone(),
            payload: envelope.encode()?,
            state: OutboxState::Pending,
            created_at: Utc::now(),
            sent_at: None,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.state == OutboxState::Pending
    }
}

/// Relay-facing read side of the outbox table.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Fetch pending rows, oldest first, bounding staleness.
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxMessage>, StoreError>;

    /// Mark a row sent, conditioned on it still being `Pending`. Returns
    /// `false` when another relay instance won the race; the caller must
    /// not treat that as a failure.
    async fn mark_sent(&self, id: Uuid) -> Result<bool, StoreError>;
}
