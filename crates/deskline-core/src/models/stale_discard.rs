//! Record of a server-originated row that lost to a newer local copy

use serde::{Deserialize, Serialize};

/// An incoming row discarded because the replica already held a newer one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleDiscard {
    /// Discard log row identifier
    pub id: i64,
    pub table_name: String,
    pub row_id: String,
    /// Replica row's timestamp when the incoming copy arrived
    pub local_updated_at: i64,
    /// Incoming row's timestamp that was discarded
    pub incoming_updated_at: i64,
    /// Discard timestamp (unix ms)
    pub discarded_at: i64,
}
