//! Ports for the external collaborators.
//!
//! The core has zero infrastructure dependencies: the relational store and
//! the message broker exist only as traits here. Adapters (Postgres, NATS,
//! the in-memory test doubles in `sagabox-testing`) implement them.

pub mod broker;
pub mod dead_letter;
pub mod inbox;
pub mod outbox;
pub mod store;

pub use broker::{BrokerError, BrokerPublisher};
pub use dead_letter::{DeadLetter, DeadLetterQueue};
pub use inbox::InboxRecord;
pub use outbox::{OutboxMessage, OutboxState, OutboxStore};
pub use store::{StoreError, StoreTransaction, TransactionalStore};
