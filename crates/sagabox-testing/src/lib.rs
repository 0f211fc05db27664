//! # sagabox-testing
//!
//! In-memory adapters for the sagabox-core ports plus an end-to-end test
//! harness. Provides [`MemoryStore`], [`MemoryBroker`],
//! [`MemoryDeadLetterQueue`] and [`SagaHarness`].

pub mod harness;
pub mod memory_broker;
pub mod memory_dead_letters;
pub mod memory_store;

pub use harness::{reply, SagaHarness};
pub use memory_broker::{Delivery, FlakyPublisher, MemoryBroker};
pub use memory_dead_letters::MemoryDeadLetterQueue;
pub use memory_store::{MemoryStore, MemoryTransaction};

/// Install a subscriber reading `RUST_LOG`, for opt-in logging while
/// debugging a test run. Safe to call from every test; only the first call
/// per process installs anything.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
