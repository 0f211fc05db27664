//! # Dead-Letter Port
//!
//! Sink for events that must never be retried: unregistered state/event
//! pairs, unresolvable correlations, undecodable payloads and escalated
//! compensation failures. Entries keep the full envelope so an operator can
//! inspect, fix the workflow definition and replay.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::port::StoreError;

/// A dead-lettered event with its reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub envelope: Envelope,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(envelope: Envelope, reason: impl Into<String>) -> Self {
        Self {
            envelope,
            reason: reason.into(),
            occurred_at: Utc::now(),
        }
    }
}

/// Durable dead-letter sink.
#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    async fn push(&self, letter: DeadLetter) -> Result<(), StoreError>;
}
