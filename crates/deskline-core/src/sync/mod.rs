//! Client-side synchronization: outbox delivery, incremental pull and the
//! realtime change channel.

mod engine;
mod pull;
mod realtime;
mod retry;
mod sse;
mod transport;

pub use engine::{RoundOutcome, SyncEngine, SyncEngineConfig, SyncWorker};
pub use pull::{PullReport, PullService};
pub use realtime::{ChangeSource, RealtimeConnection};
pub use retry::{Backoff, RetryPolicy};
pub use sse::{SseChangeSource, SseParser};
pub use transport::{HttpSyncTransport, SyncTransport};
