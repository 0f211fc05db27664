//! # Message Envelope
//!
//! The envelope is the logical wire format shared by every component:
//! `{ id, type, correlationKey, payload }`.
//!
//! The `id` is generated exactly once, when the message is first staged in
//! the outbox, and travels with the message end to end. Downstream inboxes
//! use it as their deduplication key, so a redelivered message is always
//! recognizable regardless of how many broker hops it took.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Wire-format envelope for every message crossing the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// End-to-end unique message identifier (inbox deduplication key).
    pub id: Uuid,
    /// Message type tag, used to select the handler and deserialize the payload.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Business identifier routing an event to its owning saga instance.
    #[serde(rename = "correlationKey")]
    pub correlation_key: Option<String>,
    /// Opaque serialized payload.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Create an envelope with a fresh id and no correlation key.
    pub fn new(message_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type: message_type.into(),
            correlation_key: None,
            payload,
        }
    }

    /// Create an envelope carrying a JSON payload.
    pub fn from_json(message_type: impl Into<String>, payload: &serde_json::Value) -> Result<Self> {
        Ok(Self::new(message_type, serde_json::to_vec(payload)?))
    }

    /// Attach a correlation key.
    pub fn with_correlation_key(mut self, key: impl Into<String>) -> Self {
        self.correlation_key = Some(key.into());
        self
    }

    /// Decode the payload as JSON.
    pub fn payload_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Encode the whole envelope for broker transport.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode an envelope from broker transport bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(Error::from)
    }

    /// The outcome an event reports: a `success: false` field in the payload
    /// marks an explicit failure result. Absent or non-boolean means success,
    /// so plain notification events need no outcome field at all.
    pub fn outcome(&self) -> EventOutcome {
        match self.payload_json() {
            Ok(value) => match value.get("success").and_then(serde_json::Value::as_bool) {
                Some(false) => EventOutcome::Failure,
                _ => EventOutcome::Success,
            },
            Err(_) => EventOutcome::Success,
        }
    }
}

/// Explicit success/failure result carried by an event payload.
///
/// Failures cross component boundaries as values, never as panics or
/// handler errors, so transition tables can match on them deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Success,
    Failure,
}

impl EventOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, EventOutcome::Failure)
    }
}
