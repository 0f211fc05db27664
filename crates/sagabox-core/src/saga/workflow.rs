//! # Workflow Definitions
//!
//! A workflow is a declarative transition table keyed by
//! `(current state, event type)`, populated once at registration time.
//! There is no virtual dispatch per workflow: the engine interprets the
//! table, so adding a workflow means declaring data, never subclassing.
//!
//! ```
//! use sagabox_core::saga::{CommandSpec, Transition, WorkflowDefinition};
//!
//! let order = WorkflowDefinition::builder("order-fulfilment")
//!     .trigger(
//!         "OrderSubmitted",
//!         Transition::to("Submitted")
//!             .capture(&["amount"])
//!             .emit(CommandSpec::new("payments", "ProcessPayment").with_fields(&["amount"])),
//!     )
//!     .on(
//!         "Submitted",
//!         "PaymentProcessed",
//!         Transition::to("PaymentAccepted")
//!             .capture(&["paymentId"])
//!             .record_step(
//!                 "payment",
//!                 CommandSpec::new("payments", "CancelPayment"),
//!                 "PaymentCancelled",
//!             )
//!             .emit(CommandSpec::new("inventory", "ReserveInventory")),
//!     )
//!     .build()
//!     .unwrap();
//! assert!(order.trigger("OrderSubmitted").is_some());
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::saga::instance::CompletedStep;

/// Default name of the state entered while compensations run.
pub const COMPENSATING_STATE: &str = "Compensating";
/// Default terminal state for a successful saga.
pub const COMPLETED_STATE: &str = "Completed";
/// Default terminal state for a fully compensated failure.
pub const FAILED_STATE: &str = "Failed";

/// A command to be emitted through the outbox.
///
/// The payload is materialized at emission time: the listed fields are
/// copied out of the saga's current data, and the envelope carries the
/// saga's correlation key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Logical destination (topic/queue) for the command.
    pub destination: String,
    /// Command type tag.
    pub message_type: String,
    /// Saga data fields copied into the command payload.
    pub fields: Vec<String>,
}

impl CommandSpec {
    pub fn new(destination: impl Into<String>, message_type: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            message_type: message_type.into(),
            fields: Vec::new(),
        }
    }

    /// Copy the given saga data fields into the command payload.
    pub fn with_fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| (*f).to_string()).collect();
        self
    }

    /// Build the command envelope from the saga's current data.
    pub fn materialize(
        &self,
        correlation_id: &str,
        data: &HashMap<String, serde_json::Value>,
    ) -> Result<Envelope> {
        let mut payload = serde_json::Map::new();
        for field in &self.fields {
            if let Some(value) = data.get(field) {
                payload.insert(field.clone(), value.clone());
            }
        }
        Envelope::from_json(&self.message_type, &serde_json::Value::Object(payload))
            .map(|envelope| envelope.with_correlation_key(correlation_id))
    }
}

/// Custom data transform applied when a transition fires: receives the
/// saga's data map and the event payload.
pub type DataUpdateFn =
    dyn Fn(&mut HashMap<String, serde_json::Value>, &serde_json::Value) + Send + Sync;

/// One entry in the transition table.
#[derive(Clone)]
pub struct Transition {
    /// Target state when the event reports success.
    pub next_state: String,
    /// Event payload fields copied into saga data before anything else.
    pub captures: Vec<String>,
    /// Optional custom data transform, run after the captures.
    pub update: Option<Arc<DataUpdateFn>>,
    /// Commands emitted (appended to the outbox) when this transition fires.
    pub commands: Vec<CommandSpec>,
    /// Forward step this event acknowledges as durably complete, with the
    /// command that compensates it and the event type acking that command.
    pub step: Option<CompletedStep>,
}

impl Transition {
    /// Start a transition towards a target state.
    pub fn to(next_state: impl Into<String>) -> Self {
        Self {
            next_state: next_state.into(),
            captures: Vec::new(),
            update: None,
            commands: Vec::new(),
            step: None,
        }
    }

    /// Copy the given event payload fields into saga data.
    pub fn capture(mut self, fields: &[&str]) -> Self {
        self.captures = fields.iter().map(|f| (*f).to_string()).collect();
        self
    }

    /// Apply a custom data transform.
    pub fn update<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut HashMap<String, serde_json::Value>, &serde_json::Value) + Send + Sync + 'static,
    {
        self.update = Some(Arc::new(f));
        self
    }

    /// Emit a command when the transition fires.
    pub fn emit(mut self, command: CommandSpec) -> Self {
        self.commands.push(command);
        self
    }

    /// Record the step this event acknowledges, together with its
    /// compensating command and the event type that acks that command.
    /// Steps without side effects declare nothing.
    pub fn record_step(
        mut self,
        name: impl Into<String>,
        compensation: CommandSpec,
        acked_by: impl Into<String>,
    ) -> Self {
        self.step = Some(CompletedStep {
            name: name.into(),
            compensation,
            ack_event_type: acked_by.into(),
        });
        self
    }
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("next_state", &self.next_state)
            .field("captures", &self.captures)
            .field("commands", &self.commands)
            .field("step", &self.step)
            .field("update", &self.update.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Immutable, fully validated transition table for one workflow.
pub struct WorkflowDefinition {
    name: String,
    triggers: HashMap<String, Transition>,
    transitions: HashMap<(String, String), Transition>,
    compensation_acks: HashSet<String>,
    compensating_state: String,
    completed_state: String,
    failed_state: String,
    terminal_states: HashSet<String>,
}

impl WorkflowDefinition {
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder {
            name: name.into(),
            triggers: HashMap::new(),
            transitions: HashMap::new(),
            compensating_state: COMPENSATING_STATE.to_string(),
            completed_state: COMPLETED_STATE.to_string(),
            failed_state: FAILED_STATE.to_string(),
            extra_terminals: HashSet::new(),
            duplicate: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Initial transition for a trigger event type, if registered.
    pub fn trigger(&self, event_type: &str) -> Option<&Transition> {
        self.triggers.get(event_type)
    }

    /// Event types that create a new instance.
    pub fn trigger_event_types(&self) -> impl Iterator<Item = &str> {
        self.triggers.keys().map(String::as_str)
    }

    /// Transition registered for `(state, event type)`, if any.
    pub fn transition(&self, state: &str, event_type: &str) -> Option<&Transition> {
        self.transitions
            .get(&(state.to_string(), event_type.to_string()))
    }

    pub fn is_compensation_ack(&self, event_type: &str) -> bool {
        self.compensation_acks.contains(event_type)
    }

    pub fn is_terminal(&self, state: &str) -> bool {
        self.terminal_states.contains(state)
    }

    pub fn compensating_state(&self) -> &str {
        &self.compensating_state
    }

    pub fn completed_state(&self) -> &str {
        &self.completed_state
    }

    pub fn failed_state(&self) -> &str {
        &self.failed_state
    }

    /// Every event type this workflow reacts to (triggers, table entries
    /// and compensation acks), for consumer registration.
    pub fn event_types(&self) -> HashSet<String> {
        let mut types: HashSet<String> = self.triggers.keys().cloned().collect();
        types.extend(self.transitions.keys().map(|(_, event)| event.clone()));
        types.extend(self.compensation_acks.iter().cloned());
        types
    }
}

impl fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("name", &self.name)
            .field("triggers", &self.triggers.keys())
            .field("transitions", &self.transitions.keys())
            .field("compensation_acks", &self.compensation_acks)
            .finish()
    }
}

/// Builder for [`WorkflowDefinition`]. Duplicate registrations are reported
/// at [`build`](WorkflowBuilder::build) time as configuration errors, never
/// silently overwritten.
pub struct WorkflowBuilder {
    name: String,
    triggers: HashMap<String, Transition>,
    transitions: HashMap<(String, String), Transition>,
    compensating_state: String,
    completed_state: String,
    failed_state: String,
    extra_terminals: HashSet<String>,
    duplicate: Option<String>,
}

impl WorkflowBuilder {
    /// Register an event type that creates a new instance; the transition's
    /// target is the initial state.
    pub fn trigger(mut self, event_type: impl Into<String>, transition: Transition) -> Self {
        let event_type = event_type.into();
        if self.triggers.insert(event_type.clone(), transition).is_some() {
            self.duplicate = Some(format!("trigger '{event_type}'"));
        }
        self
    }

    /// Register a transition for `(state, event type)`.
    pub fn on(
        mut self,
        state: impl Into<String>,
        event_type: impl Into<String>,
        transition: Transition,
    ) -> Self {
        let key = (state.into(), event_type.into());
        let label = format!("transition ('{}', '{}')", key.0, key.1);
        if self.transitions.insert(key, transition).is_some() {
            self.duplicate = Some(label);
        }
        self
    }

    /// Mark an additional state as terminal (the completed and failed
    /// states always are).
    pub fn terminal(mut self, state: impl Into<String>) -> Self {
        self.extra_terminals.insert(state.into());
        self
    }

    /// Override the default `Compensating` state name.
    pub fn compensating_state(mut self, state: impl Into<String>) -> Self {
        self.compensating_state = state.into();
        self
    }

    /// Override the default `Completed` state name.
    pub fn completed_state(mut self, state: impl Into<String>) -> Self {
        self.completed_state = state.into();
        self
    }

    /// Override the default `Failed` state name.
    pub fn failed_state(mut self, state: impl Into<String>) -> Self {
        self.failed_state = state.into();
        self
    }

    pub fn build(self) -> Result<WorkflowDefinition> {
        if let Some(duplicate) = self.duplicate {
            return Err(Error::Configuration(format!(
                "workflow '{}': duplicate {duplicate}",
                self.name
            )));
        }
        if self.triggers.is_empty() {
            return Err(Error::Configuration(format!(
                "workflow '{}' declares no trigger event",
                self.name
            )));
        }

        let mut terminal_states = self.extra_terminals;
        terminal_states.insert(self.completed_state.clone());
        terminal_states.insert(self.failed_state.clone());

        // The ack event types are exactly the ones the recorded steps
        // declare; they need no separate registration.
        let compensation_acks: HashSet<String> = self
            .triggers
            .values()
            .chain(self.transitions.values())
            .filter_map(|transition| transition.step.as_ref())
            .map(|step| step.ack_event_type.clone())
            .collect();

        Ok(WorkflowDefinition {
            name: self.name,
            triggers: self.triggers,
            transitions: self.transitions,
            compensation_acks,
            compensating_state: self.compensating_state,
            completed_state: self.completed_state,
            failed_state: self.failed_state,
            terminal_states,
        })
    }
}
