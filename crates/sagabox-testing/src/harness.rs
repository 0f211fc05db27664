//! End-to-end test harness.
//!
//! Wires a [`SagaEngine`] into a consumer shell, a relay and the in-memory
//! adapters, and lets tests drive the whole message round-trip by hand:
//! submit an event, pump the outbox, inspect what the broker delivered,
//! reply as the participant services would.

use std::sync::Arc;

use sagabox_core::config::{ConsumerConfig, RelayConfig};
use sagabox_core::consumer::{ConsumerShell, Outcome};
use sagabox_core::envelope::Envelope;
use sagabox_core::error::Result;
use sagabox_core::relay::OutboxRelay;
use sagabox_core::saga::SagaEngine;

use crate::memory_broker::{Delivery, MemoryBroker};
use crate::memory_dead_letters::MemoryDeadLetterQueue;
use crate::memory_store::MemoryStore;

pub struct SagaHarness {
    pub store: Arc<MemoryStore>,
    pub broker: Arc<MemoryBroker>,
    pub dead_letters: Arc<MemoryDeadLetterQueue>,
    pub shell: ConsumerShell<MemoryStore>,
    relay: OutboxRelay<MemoryStore, MemoryBroker>,
}

impl SagaHarness {
    pub fn new(engine: SagaEngine) -> Self {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let dead_letters = Arc::new(MemoryDeadLetterQueue::new());

        let mut shell = ConsumerShell::new(
            store.clone(),
            dead_letters.clone(),
            ConsumerConfig::default(),
        );
        shell
            .register_engine(Arc::new(engine))
            .expect("no handlers registered yet");

        let relay = OutboxRelay::new(store.clone(), broker.clone(), RelayConfig::default());

        Self {
            store,
            broker,
            dead_letters,
            shell,
            relay,
        }
    }

    /// Feed one inbound envelope through the consumer shell, as the broker
    /// subscription would.
    pub async fn submit(&self, envelope: &Envelope) -> Result<Outcome> {
        self.shell.process(envelope).await
    }

    /// Drain the outbox through the relay until no row makes progress, then
    /// take everything the broker received.
    pub async fn pump(&self) -> Result<Vec<Delivery>> {
        loop {
            let batch = self.relay.process_batch().await?;
            if batch.fetched == 0 || batch.published + batch.races == 0 {
                break;
            }
        }
        Ok(self.broker.drain())
    }
}

/// Build the event a participant service would emit in reaction to a
/// command, carrying the command's correlation key.
pub fn reply(command: &Envelope, event_type: &str, payload: &serde_json::Value) -> Envelope {
    let envelope = Envelope::from_json(event_type, payload)
        .unwrap_or_else(|_| Envelope::new(event_type, Vec::new()));
    match &command.correlation_key {
        Some(key) => envelope.with_correlation_key(key.clone()),
        None => envelope,
    }
}
