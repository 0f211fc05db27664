//! # Outbox Relay
//!
//! Background loop that drains the outbox: fetch a bounded batch of pending
//! rows (oldest first), publish each to the broker, then mark it sent.
//!
//! The ordering of those two effects is the whole point. A crash between
//! publish and mark-sent leaves the row `Pending`, so it is republished on
//! recovery: delivery is at-least-once, never at-most-once, and consumers
//! deduplicate via their inbox. A row is never deleted or marked before the
//! broker acknowledged it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::config::RelayConfig;
use crate::error::Result;
use crate::port::{BrokerPublisher, OutboxStore};

/// Counters for one relay instance.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Pending rows fetched since start.
    pub fetched: AtomicU64,
    /// Rows confirmed published and marked sent.
    pub published: AtomicU64,
    /// Rows whose publish cycle did not complete (row stays pending).
    pub publish_failures: AtomicU64,
    /// Rows another relay instance marked sent first.
    pub mark_races: AtomicU64,
    /// Duration of the last non-empty batch, milliseconds.
    pub last_batch_ms: AtomicU64,
}

impl RelayMetrics {
    pub fn snapshot(&self) -> RelayMetricsSnapshot {
        RelayMetricsSnapshot {
            fetched: self.fetched.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            mark_races: self.mark_races.load(Ordering::Relaxed),
            last_batch_ms: self.last_batch_ms.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RelayMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayMetricsSnapshot {
    pub fetched: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub mark_races: u64,
    pub last_batch_ms: u64,
}

/// Result of draining one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchResult {
    pub fetched: usize,
    pub published: usize,
    pub failed: usize,
    pub races: usize,
}

impl BatchResult {
    pub fn empty() -> Self {
        Self {
            fetched: 0,
            published: 0,
            failed: 0,
            races: 0,
        }
    }
}

/// Polling relay between an outbox store and a broker publisher.
///
/// One logical instance per deployment; scale out by partitioning
/// destinations across instances. Safe to run concurrently anyway, since
/// `mark_sent` is conditioned on the row still being pending.
pub struct OutboxRelay<O, P>
where
    O: OutboxStore,
    P: BrokerPublisher,
{
    outbox: Arc<O>,
    publisher: Arc<P>,
    config: RelayConfig,
    metrics: Arc<RelayMetrics>,
}

impl<O, P> OutboxRelay<O, P>
where
    O: OutboxStore,
    P: BrokerPublisher,
{
    pub fn new(outbox: Arc<O>, publisher: Arc<P>, config: RelayConfig) -> Self {
        Self {
            outbox,
            publisher,
            config,
            metrics: Arc::new(RelayMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<RelayMetrics> {
        self.metrics.clone()
    }

    /// Run until shutdown. Store and broker hiccups are logged and retried
    /// on the next cycle; the loop itself never gives up.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("relay shutting down between iterations");
                    return Ok(());
                }
                result = self.process_batch() => {
                    if let Err(err) = result {
                        error!(error = %err, "relay batch failed, retrying next cycle");
                    }
                }
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Drain one bounded batch. Each row is an independent unit of work:
    /// one row's publish failure never blocks the rest of the batch.
    pub async fn process_batch(&self) -> Result<BatchResult> {
        let started = Instant::now();
        let pending = self.outbox.fetch_pending(self.config.batch_size).await?;
        if pending.is_empty() {
            return Ok(BatchResult::empty());
        }

        let mut result = BatchResult {
            fetched: pending.len(),
            ..BatchResult::empty()
        };
        self.metrics
            .fetched
            .fetch_add(pending.len() as u64, Ordering::Relaxed);

        for message in pending {
            match self
                .publisher
                .publish(&message.destination, &message.payload)
                .await
            {
                Ok(()) => match self.outbox.mark_sent(message.id).await {
                    Ok(true) => {
                        result.published += 1;
                        self.metrics.published.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(false) => {
                        // Another relay instance won; the double publish is
                        // absorbed downstream by the inbox.
                        result.races += 1;
                        self.metrics.mark_races.fetch_add(1, Ordering::Relaxed);
                        debug!(message_id = %message.id, "row already marked sent");
                    }
                    Err(err) => {
                        // Published but not marked: the row stays pending
                        // and is republished next cycle. Required behavior.
                        result.failed += 1;
                        self.metrics.publish_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            message_id = %message.id,
                            error = %err,
                            "mark-sent failed after publish, row will be republished"
                        );
                    }
                },
                Err(err) => {
                    result.failed += 1;
                    self.metrics.publish_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        message_id = %message.id,
                        destination = %message.destination,
                        error = %err,
                        "publish failed, row stays pending"
                    );
                }
            }
        }

        self.metrics
            .last_batch_ms
            .store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
        Ok(result)
    }
}
