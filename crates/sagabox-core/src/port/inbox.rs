//! # Inbox Port
//!
//! Durable table of processed message ids. A row's presence means the
//! associated business effect has already been applied exactly once; the
//! handler is never re-run for that id. The insert shares a transaction
//! with the effect, so rolling back one rolls back both.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One processed-message marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxRecord {
    /// Primary key: the originating envelope's id (end-to-end idempotency key).
    pub message_id: Uuid,
    /// When processing committed.
    pub processed_at: DateTime<Utc>,
}

impl InboxRecord {
    pub fn new(message_id: Uuid) -> Self {
        Self {
            message_id,
            processed_at: Utc::now(),
        }
    }
}
