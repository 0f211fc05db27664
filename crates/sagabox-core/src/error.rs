//! # Error Taxonomy
//!
//! Central error type for the messaging core. Every error carries a
//! [`Recovery`] classification the consumer shell dispatches on:
//!
//! - `Transient` errors are retried (store conflicts, broker timeouts);
//!   ultimately the broker's redelivery provides the retry loop.
//! - `Fatal` errors are never retried; the event is dead-lettered with full
//!   context for operator review (a workflow definition gap, not a glitch).
//! - `Escalate` halts automatic progress on the affected saga instance but
//!   commits the halt, so redeliveries no-op instead of looping.
//!
//! Duplicate delivery is deliberately *not* an error: it is the normal
//! at-least-once outcome, reported through [`crate::consumer::Outcome`].

use thiserror::Error;

use crate::port::{BrokerError, StoreError};

/// Result type for messaging-core operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Central error type for the messaging core.
#[derive(Debug, Error)]
pub enum Error {
    /// Store unavailable or conflicted; retry with backoff.
    #[error("transient store error: {0}")]
    TransientStore(#[from] StoreError),

    /// Broker publish failed or timed out; retry with backoff.
    #[error("transient broker error: {0}")]
    TransientBroker(#[from] BrokerError),

    /// No transition registered for the current state/event pair.
    /// Fatal to that event: dead-lettered, never retried.
    #[error(
        "protocol error: no transition for event '{event_type}' in state '{state}' \
         (workflow '{workflow}', correlation '{correlation_id}')"
    )]
    Protocol {
        workflow: String,
        correlation_id: String,
        state: String,
        event_type: String,
    },

    /// Event has no resolvable saga instance and is not a registered
    /// trigger event. Dead-lettered.
    #[error("correlation error: event '{event_type}': {reason}")]
    Correlation { event_type: String, reason: String },

    /// A compensating command did not complete. Automatic progress on the
    /// instance halts pending operator resolution.
    #[error(
        "compensation '{command}' failed for saga '{correlation_id}', \
         automatic progress halted"
    )]
    CompensationFailed {
        correlation_id: String,
        command: String,
    },

    /// No handler registered for a message type. Dead-lettered.
    #[error("no handler registered for message type '{0}'")]
    UnknownMessageType(String),

    /// Envelope or payload (de)serialization failed. Dead-lettered: the
    /// bytes will not become valid on redelivery.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Invalid workflow definition or component configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// How a failed operation should be recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Retry with backoff / rely on broker redelivery.
    Transient,
    /// Never retry; dead-letter and acknowledge.
    Fatal,
    /// Commit the staged halt, dead-letter, acknowledge.
    Escalate,
}

impl Error {
    /// Classify this error for the consumer shell.
    pub fn recovery(&self) -> Recovery {
        match self {
            Error::TransientStore(_) | Error::TransientBroker(_) => Recovery::Transient,
            Error::CompensationFailed { .. } => Recovery::Escalate,
            Error::Protocol { .. }
            | Error::Correlation { .. }
            | Error::UnknownMessageType(_)
            | Error::Codec(_)
            | Error::Configuration(_) => Recovery::Fatal,
        }
    }

    /// True when the error stems from an optimistic-concurrency conflict,
    /// which the consumer shell retries in-process (re-read, re-decide)
    /// before falling back to broker redelivery.
    pub fn is_version_conflict(&self) -> bool {
        matches!(
            self,
            Error::TransientStore(StoreError::VersionConflict { .. })
        )
    }
}
