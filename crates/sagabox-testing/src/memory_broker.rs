//! In-memory broker doubles.
//!
//! [`MemoryBroker`] records every publish per destination so tests can
//! drain and inspect deliveries. [`FlakyPublisher`] wraps any publisher and
//! fails the first N publishes, for exercising the relay's retry behavior.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use sagabox_core::envelope::Envelope;
use sagabox_core::port::{BrokerError, BrokerPublisher};

/// One delivered message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub destination: String,
    pub envelope: Envelope,
}

/// Broker double that queues deliveries and keeps a cumulative publish log.
#[derive(Default)]
pub struct MemoryBroker {
    queue: Mutex<Vec<Delivery>>,
    log: Mutex<Vec<Delivery>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every queued delivery, in publish order.
    pub fn drain(&self) -> Vec<Delivery> {
        std::mem::take(&mut *self.queue.lock())
    }

    /// Every publish since construction, grouped by message type; drains do
    /// not affect the log, so exact-emission asserts can run at the end of
    /// a scenario.
    pub fn published_types(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for delivery in self.log.lock().iter() {
            *counts
                .entry(delivery.envelope.message_type.clone())
                .or_insert(0) += 1;
        }
        counts
    }
}

#[async_trait]
impl BrokerPublisher for MemoryBroker {
    async fn publish(&self, destination: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let envelope = Envelope::decode(payload)
            .map_err(|err| BrokerError::Unavailable(format!("undecodable payload: {err}")))?;
        let delivery = Delivery {
            destination: destination.to_string(),
            envelope,
        };
        self.log.lock().push(delivery.clone());
        self.queue.lock().push(delivery);
        Ok(())
    }
}

/// Publisher wrapper failing the first N publishes.
pub struct FlakyPublisher<P> {
    inner: Arc<P>,
    failures_left: AtomicU32,
}

impl<P: BrokerPublisher> FlakyPublisher<P> {
    pub fn new(inner: Arc<P>, failures: u32) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl<P: BrokerPublisher> BrokerPublisher for FlakyPublisher<P> {
    async fn publish(&self, destination: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0
            && self
                .failures_left
                .compare_exchange(left, left - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(BrokerError::Unavailable("injected failure".to_string()));
        }
        self.inner.publish(destination, payload).await
    }
}
