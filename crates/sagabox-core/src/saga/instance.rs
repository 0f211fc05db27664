//! Saga instance state.
//!
//! One instance exists per business process, exclusively owned by the
//! engine. It is mutated exactly once per incoming event and persisted with
//! a compare-and-swap on `version`; once a terminal state is reached it is
//! never mutated again.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::saga::workflow::CommandSpec;

/// A forward step whose side effect has observably completed, together with
/// the command that would semantically reverse it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedStep {
    /// Step name, for logging and operator context.
    pub name: String,
    /// Declared compensating command.
    pub compensation: CommandSpec,
    /// Event type acknowledging the compensating command. While this step
    /// heads the compensation queue, only this event type advances it.
    pub ack_event_type: String,
}

/// Durable state of one saga.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaInstance {
    /// Business process identifier; unique per instance.
    pub correlation_id: String,
    /// Name of the registered workflow definition driving this instance.
    pub workflow: String,
    /// Current named state within the workflow's closed state set.
    pub current_state: String,
    /// Accumulated business data (payment ids, reservation ids, ...).
    pub data: HashMap<String, serde_json::Value>,
    /// Monotonically increasing counter for optimistic concurrency control.
    pub version: u64,
    /// Forward steps completed so far, in completion order.
    pub completed_steps: Vec<CompletedStep>,
    /// Compensations still owed, drained front-to-back one ack at a time.
    pub pending_compensations: Vec<CompletedStep>,
    /// Set when a compensating command failed; no automatic progress until
    /// an operator resolves the instance.
    pub halted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaInstance {
    /// Create a fresh instance in its initial state, at version 1.
    pub fn new(
        correlation_id: impl Into<String>,
        workflow: impl Into<String>,
        initial_state: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            correlation_id: correlation_id.into(),
            workflow: workflow.into(),
            current_state: initial_state.into(),
            data: HashMap::new(),
            version: 1,
            completed_steps: Vec::new(),
            pending_compensations: Vec::new(),
            halted: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Store a data field.
    pub fn set_data(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    /// Read a data field.
    pub fn get_data(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Record a completed forward step and its compensation.
    pub fn record_step(&mut self, step: CompletedStep) {
        self.completed_steps.push(step);
    }

    /// The sequence of state names visited so far is not stored; only the
    /// current one. Whether it is terminal is the workflow's call, since
    /// state sets differ per definition.
    pub fn is_in(&self, state: &str) -> bool {
        self.current_state == state
    }
}
