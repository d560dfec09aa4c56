//! Outbox mutation record

use serde::{Deserialize, Serialize};

use crate::protocol::Operation;

/// One locally issued write waiting for (or confirmed by) the server.
///
/// Only `synced` ever changes after the record is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub local_id: i64,
    pub operation: Operation,
    /// Monotonic per client; the delivery order
    pub enqueued_at: i64,
    pub synced: bool,
    /// Failed delivery attempts so far
    pub attempts: i64,
}
