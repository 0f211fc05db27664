//! Component configuration.
//!
//! Plain structs with `Default` impls and serde support, so deployments can
//! load them from any configuration source without this crate caring which.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff with jitter.
///
/// Shared by the consumer shell's version-conflict retry loop; delays grow
/// as `base * multiplier^attempt`, capped at `max`, with ±`jitter` noise to
/// keep racing workers from retrying in lockstep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Base delay for the first retry.
    #[serde(default = "default_base")]
    pub base: Duration,
    /// Upper bound for any single delay.
    #[serde(default = "default_max")]
    pub max: Duration,
    /// Exponential growth factor.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Jitter factor in `0.0..=1.0` (0.1 = ±10%).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_base() -> Duration {
    Duration::from_millis(25)
}

fn default_max() -> Duration {
    Duration::from_secs(2)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: default_base(),
            max: default_max(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl BackoffConfig {
    /// Delay before the given retry attempt (0-based), jitter applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponential = self.base.mul_f64(self.multiplier.powi(attempt as i32));
        let capped = exponential.min(self.max);
        if self.jitter <= 0.0 {
            return capped;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        capped.mul_f64((1.0 + spread).max(0.0))
    }
}

/// Configuration for the outbox relay loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Sleep between polling cycles when the outbox is drained.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Maximum pending rows fetched per cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_batch_size() -> usize {
    100
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            batch_size: default_batch_size(),
        }
    }
}

/// Configuration for the consumer shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// In-process retries on optimistic-concurrency conflicts before
    /// yielding the message back to broker redelivery.
    #[serde(default = "default_conflict_retries")]
    pub max_conflict_retries: u32,
    /// Backoff between conflict retries.
    #[serde(default)]
    pub conflict_backoff: BackoffConfig,
}

fn default_conflict_retries() -> u32 {
    5
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: default_conflict_retries(),
            conflict_backoff: BackoffConfig::default(),
        }
    }
}
