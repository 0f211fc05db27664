//! # Broker Port
//!
//! The message broker collaborator: at-least-once delivery of byte payloads
//! to named destinations, no ordering guarantee across destinations.
//! Ordering within one saga's commands is the engine's responsibility.

use async_trait::async_trait;
use thiserror::Error;

/// Broker publish failures. All transient: the relay leaves the row
/// `Pending` and retries on the next cycle.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("publish timed out")]
    Timeout,

    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// Publish side of the broker.
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    /// Publish bytes to a destination; resolves once the broker acknowledges.
    async fn publish(&self, destination: &str, payload: &[u8]) -> Result<(), BrokerError>;
}
