//! # Consumer Shell
//!
//! Wraps every service's message handlers with inbox-based deduplication.
//! Per inbound envelope the shell opens one store transaction, tries the
//! inbox insert, runs the handler, and commits, so the dedup marker and
//! the business effect are atomic as a unit. A handler failure rolls both
//! back, leaving the message eligible for broker redelivery.
//!
//! Version conflicts (two workers advancing the same saga) are retried
//! in-process with bounded backoff: each retry re-opens a transaction and
//! re-reads, never overwriting the winner's state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::config::ConsumerConfig;
use crate::envelope::Envelope;
use crate::error::{Error, Recovery, Result};
use crate::port::{
    DeadLetter, DeadLetterQueue, InboxRecord, StoreError, StoreTransaction, TransactionalStore,
};
use crate::saga::SagaEngine;

/// A business message handler, invoked inside the shell's transaction.
///
/// Handlers write every effect through the given transaction; they never
/// commit or roll back themselves, and they report failures as errors
/// rather than panicking.
#[async_trait]
pub trait MessageHandler<Tx: StoreTransaction>: Send + Sync {
    async fn handle(&self, tx: &mut Tx, envelope: &Envelope) -> Result<()>;
}

/// What became of one inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handler ran and the transaction committed.
    Processed,
    /// Already processed before; acknowledged without running the handler.
    Duplicate,
    /// Fatal for this event: dead-lettered and acknowledged.
    DeadLettered,
    /// Compensation failure: the staged halt committed, the event was
    /// dead-lettered for the operator, and the message acknowledged.
    Escalated,
}

/// Deduplicating wrapper around a set of message handlers.
pub struct ConsumerShell<S: TransactionalStore> {
    store: Arc<S>,
    handlers: HashMap<String, Arc<dyn MessageHandler<S::Tx>>>,
    dead_letters: Arc<dyn DeadLetterQueue>,
    config: ConsumerConfig,
}

impl<S: TransactionalStore> ConsumerShell<S> {
    pub fn new(store: Arc<S>, dead_letters: Arc<dyn DeadLetterQueue>, config: ConsumerConfig) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            dead_letters,
            config,
        }
    }

    /// Register a handler for one message type. A second registration for
    /// the same type is a configuration error, never a silent overwrite.
    pub fn register(
        &mut self,
        message_type: impl Into<String>,
        handler: Arc<dyn MessageHandler<S::Tx>>,
    ) -> Result<()> {
        let message_type = message_type.into();
        if self.handlers.contains_key(&message_type) {
            return Err(Error::Configuration(format!(
                "handler for message type '{message_type}' already registered"
            )));
        }
        self.handlers.insert(message_type, handler);
        Ok(())
    }

    /// Register a saga engine as the handler for every event type its
    /// workflows react to. Fails if any of those types already has a
    /// handler; nothing is registered in that case.
    pub fn register_engine(&mut self, engine: Arc<SagaEngine>) -> Result<()> {
        let event_types = engine.event_types();
        for event_type in &event_types {
            if self.handlers.contains_key(event_type) {
                return Err(Error::Configuration(format!(
                    "handler for message type '{event_type}' already registered"
                )));
            }
        }
        for event_type in event_types {
            self.handlers.insert(event_type, engine.clone());
        }
        Ok(())
    }

    /// Process one inbound envelope end to end.
    ///
    /// A returned error is always transient: the caller must not
    /// acknowledge, so the broker redelivers. Every non-transient path is
    /// folded into an [`Outcome`].
    pub async fn process(&self, envelope: &Envelope) -> Result<Outcome> {
        let handler = match self.handlers.get(&envelope.message_type) {
            Some(handler) => handler.clone(),
            None => {
                let err = Error::UnknownMessageType(envelope.message_type.clone());
                return self.dead_letter(envelope, &err, Outcome::DeadLettered).await;
            }
        };

        let mut attempt: u32 = 0;
        loop {
            match self.try_once(&*handler, envelope).await {
                Attempt::Done(outcome) => return outcome,
                Attempt::Conflict(err) => {
                    if attempt >= self.config.max_conflict_retries {
                        warn!(
                            message_id = %envelope.id,
                            attempts = attempt + 1,
                            "version-conflict retries exhausted, yielding to redelivery"
                        );
                        return Err(err);
                    }
                    let delay = self.config.conflict_backoff.delay_for(attempt);
                    debug!(
                        message_id = %envelope.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "version conflict, re-reading and retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// One full dedup-handle-commit attempt.
    async fn try_once(
        &self,
        handler: &dyn MessageHandler<S::Tx>,
        envelope: &Envelope,
    ) -> Attempt {
        let mut tx = match self.store.begin().await {
            Ok(tx) => tx,
            Err(err) => return Attempt::Done(Err(err.into())),
        };

        match tx.insert_inbox(InboxRecord::new(envelope.id)).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(message_id = %envelope.id, "duplicate delivery, acknowledging");
                let _ = tx.rollback().await;
                return Attempt::Done(Ok(Outcome::Duplicate));
            }
            Err(err) => {
                let _ = tx.rollback().await;
                return Attempt::Done(Err(err.into()));
            }
        }

        match handler.handle(&mut tx, envelope).await {
            Ok(()) => match tx.commit().await {
                Ok(()) => Attempt::Done(Ok(Outcome::Processed)),
                Err(StoreError::DuplicateKey(_)) => {
                    // Lost the inbox race at commit: a concurrent worker
                    // processed this id first. Same as an early duplicate.
                    debug!(message_id = %envelope.id, "duplicate detected at commit");
                    Attempt::Done(Ok(Outcome::Duplicate))
                }
                Err(err @ StoreError::VersionConflict { .. }) => Attempt::Conflict(err.into()),
                Err(err) => Attempt::Done(Err(err.into())),
            },
            Err(err) => match err.recovery() {
                Recovery::Transient if err.is_version_conflict() => {
                    let _ = tx.rollback().await;
                    Attempt::Conflict(err)
                }
                Recovery::Transient => {
                    let _ = tx.rollback().await;
                    Attempt::Done(Err(err))
                }
                Recovery::Fatal => {
                    let _ = tx.rollback().await;
                    Attempt::Done(self.dead_letter(envelope, &err, Outcome::DeadLettered).await)
                }
                Recovery::Escalate => match tx.commit().await {
                    Ok(()) => {
                        Attempt::Done(self.dead_letter(envelope, &err, Outcome::Escalated).await)
                    }
                    Err(commit_err @ StoreError::VersionConflict { .. }) => {
                        Attempt::Conflict(commit_err.into())
                    }
                    Err(commit_err) => Attempt::Done(Err(commit_err.into())),
                },
            },
        }
    }

    async fn dead_letter(
        &self,
        envelope: &Envelope,
        err: &Error,
        outcome: Outcome,
    ) -> Result<Outcome> {
        error!(
            message_id = %envelope.id,
            message_type = %envelope.message_type,
            correlation_key = envelope.correlation_key.as_deref().unwrap_or("-"),
            error = %err,
            "event dead-lettered"
        );
        self.dead_letters
            .push(DeadLetter::new(envelope.clone(), err.to_string()))
            .await?;
        Ok(outcome)
    }
}

/// Result of one processing attempt: finished, or retryable conflict.
enum Attempt {
    Done(Result<Outcome>),
    Conflict(Error),
}
