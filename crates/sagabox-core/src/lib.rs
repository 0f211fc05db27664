//! # Sagabox Core
//!
//! Reliable messaging building blocks for services that coordinate
//! multi-step business processes over an unreliable broker:
//!
//! - **Transactional outbox**: stage messages in the same local transaction
//!   as the state change they announce, then let the [`relay::OutboxRelay`]
//!   publish them. No state change without its message, no message without
//!   its state change.
//! - **Inbox deduplication**: the [`consumer::ConsumerShell`] records each
//!   envelope id inside the processing transaction, so at-least-once
//!   delivery collapses to exactly-once effect.
//! - **Saga orchestration**: the [`saga::SagaEngine`] drives instances
//!   through a declarative transition table and runs compensations in
//!   reverse order when a step reports failure.
//!
//! Storage and broker integrations are behind the traits in [`port`];
//! in-memory adapters for tests live in the `sagabox-testing` crate.

pub mod config;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod port;
pub mod relay;
pub mod saga;

pub use config::{BackoffConfig, ConsumerConfig, RelayConfig};
pub use consumer::{ConsumerShell, MessageHandler, Outcome};
pub use envelope::{Envelope, EventOutcome};
pub use error::{Error, Recovery, Result};
pub use relay::{OutboxRelay, RelayMetrics, RelayMetricsSnapshot};
pub use saga::{CommandSpec, SagaEngine, SagaInstance, Transition, WorkflowDefinition};
