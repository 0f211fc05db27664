//! # Saga Engine
//!
//! Interprets registered [`WorkflowDefinition`]s: one incoming event mutates
//! one saga instance exactly once (state transition, data updates, emitted
//! commands), all written through the caller's open store transaction, so
//! the mutation, the outbox rows and the inbox marker commit as a unit.
//!
//! Concurrency control is purely optimistic: the instance is persisted with
//! a compare-and-swap on `version`, and a losing writer's whole transaction
//! fails so the consumer shell re-reads and re-decides.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::consumer::MessageHandler;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::port::{OutboxMessage, StoreTransaction};
use crate::saga::instance::SagaInstance;
use crate::saga::workflow::{CommandSpec, Transition, WorkflowDefinition};

/// Registry and interpreter for saga workflows.
///
/// The engine is handed to a consumer shell as the handler for every event
/// type its workflows react to. It holds no mutable state of its own; all
/// exclusion is row-level in the store.
pub struct SagaEngine {
    workflows: HashMap<String, Arc<WorkflowDefinition>>,
    /// Trigger event type -> workflow name.
    triggers: HashMap<String, String>,
}

impl SagaEngine {
    pub fn new() -> Self {
        Self {
            workflows: HashMap::new(),
            triggers: HashMap::new(),
        }
    }

    /// Register a workflow definition. Trigger event types must be unique
    /// across the engine, since they decide which workflow a new instance
    /// belongs to.
    pub fn register(&mut self, workflow: WorkflowDefinition) -> Result<()> {
        for event_type in workflow.trigger_event_types() {
            if let Some(owner) = self.triggers.get(event_type) {
                return Err(Error::Configuration(format!(
                    "trigger event '{event_type}' already owned by workflow '{owner}'"
                )));
            }
        }
        let workflow = Arc::new(workflow);
        for event_type in workflow.trigger_event_types() {
            self.triggers
                .insert(event_type.to_string(), workflow.name().to_string());
        }
        self.workflows
            .insert(workflow.name().to_string(), workflow);
        Ok(())
    }

    /// Every event type any registered workflow reacts to.
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .workflows
            .values()
            .flat_map(|w| w.event_types())
            .collect();
        types.sort();
        types.dedup();
        types
    }

    /// Process one event inside an open transaction.
    async fn process<Tx: StoreTransaction>(&self, tx: &mut Tx, envelope: &Envelope) -> Result<()> {
        let correlation_id = match &envelope.correlation_key {
            Some(key) => key.clone(),
            None => {
                return Err(Error::Correlation {
                    event_type: envelope.message_type.clone(),
                    reason: "event carries no correlation key".to_string(),
                });
            }
        };

        match tx.load_saga(&correlation_id).await? {
            None => self.start_instance(tx, envelope, &correlation_id).await,
            Some(instance) => self.advance_instance(tx, envelope, instance).await,
        }
    }

    /// Step 2 of event processing: no instance exists, so the event must be
    /// a registered trigger.
    async fn start_instance<Tx: StoreTransaction>(
        &self,
        tx: &mut Tx,
        envelope: &Envelope,
        correlation_id: &str,
    ) -> Result<()> {
        let workflow = self
            .triggers
            .get(&envelope.message_type)
            .and_then(|name| self.workflows.get(name))
            .ok_or_else(|| Error::Correlation {
                event_type: envelope.message_type.clone(),
                reason: format!(
                    "no saga instance for correlation '{correlation_id}' \
                     and the event is not a registered trigger"
                ),
            })?;

        // trigger() is present by construction of the triggers map
        let transition = workflow
            .trigger(&envelope.message_type)
            .ok_or_else(|| Error::Configuration(format!(
                "workflow '{}' lost its trigger '{}'",
                workflow.name(),
                envelope.message_type
            )))?;

        let mut instance =
            SagaInstance::new(correlation_id, workflow.name(), &transition.next_state);
        self.apply_transition(tx, &mut instance, transition, envelope)
            .await?;

        info!(
            workflow = workflow.name(),
            correlation_id,
            state = %instance.current_state,
            "saga instance created"
        );
        tx.save_saga(instance, None).await?;
        Ok(())
    }

    /// Steps 3-6 of event processing for an existing instance.
    async fn advance_instance<Tx: StoreTransaction>(
        &self,
        tx: &mut Tx,
        envelope: &Envelope,
        mut instance: SagaInstance,
    ) -> Result<()> {
        let workflow = self
            .workflows
            .get(&instance.workflow)
            .cloned()
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "saga '{}' references unregistered workflow '{}'",
                    instance.correlation_id, instance.workflow
                ))
            })?;

        if workflow.is_terminal(&instance.current_state) {
            debug!(
                correlation_id = %instance.correlation_id,
                state = %instance.current_state,
                event_type = %envelope.message_type,
                "event for finalized saga discarded"
            );
            return Ok(());
        }

        if instance.halted {
            warn!(
                correlation_id = %instance.correlation_id,
                event_type = %envelope.message_type,
                "event for halted saga discarded, awaiting operator resolution"
            );
            return Ok(());
        }

        let expected_version = instance.version;

        // A failed compensation still persists the halt: the instance is
        // saved and the error surfaces afterwards, so the shell can commit
        // the halt and dead-letter the event (redeliveries then no-op).
        let mut escalation = None;

        if instance.is_in(workflow.compensating_state()) {
            match self
                .advance_compensation(tx, &workflow, &mut instance, envelope)
                .await
            {
                Ok(()) => {}
                Err(err @ Error::CompensationFailed { .. }) => escalation = Some(err),
                Err(err) => return Err(err),
            }
        } else {
            let transition = workflow
                .transition(&instance.current_state, &envelope.message_type)
                .cloned()
                .ok_or_else(|| Error::Protocol {
                    workflow: workflow.name().to_string(),
                    correlation_id: instance.correlation_id.clone(),
                    state: instance.current_state.clone(),
                    event_type: envelope.message_type.clone(),
                })?;

            if envelope.outcome().is_failure() {
                self.begin_compensation(tx, &workflow, &mut instance, envelope)
                    .await?;
            } else {
                self.apply_transition(tx, &mut instance, &transition, envelope)
                    .await?;
            }
        }

        instance.version = expected_version + 1;
        instance.updated_at = chrono::Utc::now();
        tx.save_saga(instance, Some(expected_version)).await?;

        match escalation {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Apply a forward transition: captures, custom update, step recording,
    /// state change, command emission.
    async fn apply_transition<Tx: StoreTransaction>(
        &self,
        tx: &mut Tx,
        instance: &mut SagaInstance,
        transition: &Transition,
        envelope: &Envelope,
    ) -> Result<()> {
        let payload = envelope.payload_json().unwrap_or(serde_json::Value::Null);

        for field in &transition.captures {
            if let Some(value) = payload.get(field) {
                instance.set_data(field, value.clone());
            }
        }
        if let Some(update) = &transition.update {
            update(&mut instance.data, &payload);
        }
        if let Some(step) = &transition.step {
            instance.record_step(step.clone());
        }

        instance.current_state = transition.next_state.clone();

        for command in &transition.commands {
            self.emit(tx, instance, command).await?;
        }

        debug!(
            correlation_id = %instance.correlation_id,
            state = %instance.current_state,
            event_type = %envelope.message_type,
            commands = transition.commands.len(),
            "transition applied"
        );
        Ok(())
    }

    /// A forward step reported failure: emit the compensations of every
    /// previously completed step, strictly one at a time in reverse
    /// completion order. With nothing to undo the saga fails immediately.
    async fn begin_compensation<Tx: StoreTransaction>(
        &self,
        tx: &mut Tx,
        workflow: &WorkflowDefinition,
        instance: &mut SagaInstance,
        envelope: &Envelope,
    ) -> Result<()> {
        instance.set_data(
            "failedEvent",
            serde_json::Value::String(envelope.message_type.clone()),
        );
        instance.pending_compensations =
            instance.completed_steps.iter().rev().cloned().collect();

        match instance.pending_compensations.first().cloned() {
            Some(head) => {
                instance.current_state = workflow.compensating_state().to_string();
                warn!(
                    correlation_id = %instance.correlation_id,
                    failed_event = %envelope.message_type,
                    steps_to_compensate = instance.pending_compensations.len(),
                    first = %head.compensation.message_type,
                    "forward step failed, compensating in reverse order"
                );
                self.emit(tx, instance, &head.compensation).await
            }
            None => {
                instance.current_state = workflow.failed_state().to_string();
                warn!(
                    correlation_id = %instance.correlation_id,
                    failed_event = %envelope.message_type,
                    "forward step failed with nothing to compensate, saga failed"
                );
                Ok(())
            }
        }
    }

    /// Handle an event while compensating: only the ack declared by the
    /// outstanding (head) compensation is accepted; any other event type is
    /// a protocol violation. A success ack releases the next compensation,
    /// a failure halts the instance for operator intervention.
    async fn advance_compensation<Tx: StoreTransaction>(
        &self,
        tx: &mut Tx,
        workflow: &WorkflowDefinition,
        instance: &mut SagaInstance,
        envelope: &Envelope,
    ) -> Result<()> {
        // While the saga is compensating the queue is non-empty by
        // construction; an event with nothing outstanding, or an ack of any
        // type other than the head's, must fail loudly rather than guess.
        let head = match instance.pending_compensations.first().cloned() {
            Some(head) if head.ack_event_type == envelope.message_type => head,
            _ => {
                return Err(Error::Protocol {
                    workflow: workflow.name().to_string(),
                    correlation_id: instance.correlation_id.clone(),
                    state: instance.current_state.clone(),
                    event_type: envelope.message_type.clone(),
                });
            }
        };

        if envelope.outcome().is_failure() {
            let command = head.compensation.message_type;
            instance.halted = true;
            error!(
                correlation_id = %instance.correlation_id,
                command = %command,
                ack_event = %envelope.message_type,
                "compensating command failed, halting saga for operator intervention"
            );
            return Err(Error::CompensationFailed {
                correlation_id: instance.correlation_id.clone(),
                command,
            });
        }

        instance.pending_compensations.remove(0);
        debug!(
            correlation_id = %instance.correlation_id,
            step = %head.name,
            remaining = instance.pending_compensations.len(),
            "compensation acknowledged"
        );

        match instance.pending_compensations.first().cloned() {
            Some(next) => self.emit(tx, instance, &next.compensation).await,
            None => {
                instance.current_state = workflow.failed_state().to_string();
                info!(
                    correlation_id = %instance.correlation_id,
                    "all compensations acknowledged, saga failed (terminal)"
                );
                Ok(())
            }
        }
    }

    /// Materialize a command and append it to the outbox through the open
    /// transaction. No broker I/O happens here.
    async fn emit<Tx: StoreTransaction>(
        &self,
        tx: &mut Tx,
        instance: &SagaInstance,
        command: &CommandSpec,
    ) -> Result<()> {
        let envelope = command.materialize(&instance.correlation_id, &instance.data)?;
        let message = OutboxMessage::stage(&command.destination, &envelope)?;
        debug!(
            correlation_id = %instance.correlation_id,
            destination = %message.destination,
            message_type = %message.message_type,
            "command staged in outbox"
        );
        tx.append_outbox(message).await?;
        Ok(())
    }
}

impl Default for SagaEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<Tx: StoreTransaction> MessageHandler<Tx> for SagaEngine {
    async fn handle(&self, tx: &mut Tx, envelope: &Envelope) -> Result<()> {
        self.process(tx, envelope).await
    }
}
