//! Outbox delivery: drains pending mutations through the transport.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;

use super::retry::{Backoff, RetryPolicy};
use super::transport::SyncTransport;
use crate::error::Error;
use crate::protocol::SyncRequest;
use crate::services::ReplicaService;
use crate::state::SyncState;
use crate::util::compact_text;
use crate::Result;

const DEFAULT_MAX_BATCH: usize = 100;
const DEFAULT_IDLE_POLL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncEngineConfig {
    /// Most records shipped per request
    pub max_batch: usize,
    pub retry: RetryPolicy,
    /// Background wake-up interval when nothing triggers a round
    pub idle_poll: Duration,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            max_batch: DEFAULT_MAX_BATCH,
            retry: RetryPolicy::default(),
            idle_poll: DEFAULT_IDLE_POLL,
        }
    }
}

/// What one sync round did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Outbox was empty
    Idle,
    /// Still backing off; no request was made
    Deferred { retry_in: Duration },
    Delivered { operations: usize, rows: usize },
    /// Transport failed; every record stays pending
    Failed { retry_in: Duration },
}

pub struct SyncEngine {
    replica: ReplicaService,
    transport: Arc<dyn SyncTransport>,
    config: SyncEngineConfig,
    /// Batch size in use; shrinks when the server refuses a batch as too large
    batch_limit: AtomicUsize,
    backoff: Mutex<Backoff>,
    round: Mutex<()>,
    state: watch::Sender<SyncState>,
    trigger: Arc<Notify>,
}

impl SyncEngine {
    pub fn new(
        replica: ReplicaService,
        transport: Arc<dyn SyncTransport>,
        config: SyncEngineConfig,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::Offline);
        Self {
            replica,
            transport,
            config: SyncEngineConfig {
                max_batch: config.max_batch.max(1),
                ..config
            },
            batch_limit: AtomicUsize::new(config.max_batch.max(1)),
            backoff: Mutex::new(Backoff::new(config.retry)),
            round: Mutex::new(()),
            state,
            trigger: Arc::new(Notify::new()),
        }
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// Records shipped per request right now
    pub fn batch_limit(&self) -> usize {
        self.batch_limit.load(Ordering::Acquire)
    }

    /// Handle that wakes the background worker; given to `Mutations`
    pub fn trigger(&self) -> Arc<Notify> {
        self.trigger.clone()
    }

    /// Run a round unless the engine is backing off
    pub async fn run_round(&self) -> Result<RoundOutcome> {
        self.round_inner(false).await
    }

    /// Run a round now, ignoring any backoff (explicit user request)
    pub async fn sync_now(&self) -> Result<RoundOutcome> {
        self.round_inner(true).await
    }

    async fn round_inner(&self, force: bool) -> Result<RoundOutcome> {
        let _round = self.round.lock().await;

        if !force {
            let backoff = self.backoff.lock().await;
            let now = Instant::now();
            if !backoff.is_ready(now) {
                return Ok(RoundOutcome::Deferred {
                    retry_in: backoff.remaining(now),
                });
            }
        }

        let mut operations = 0;
        let mut rows = 0;
        loop {
            let limit = self.batch_limit();
            let batch = self.replica.pending_batch(limit).await?;
            if batch.is_empty() {
                break;
            }

            let local_ids: Vec<i64> = batch.iter().map(|record| record.local_id).collect();
            let request = SyncRequest {
                operations: batch.iter().map(|record| record.operation.clone()).collect(),
            };
            self.state.send_replace(SyncState::Syncing);

            match self.transport.push(&request).await {
                Ok(response) => {
                    rows += self
                        .replica
                        .apply_sync_response(&response, &local_ids)
                        .await?;
                    operations += local_ids.len();
                    tracing::debug!(
                        operations = local_ids.len(),
                        rows = response.len(),
                        "Delivered outbox batch"
                    );
                    if batch.len() < limit {
                        break;
                    }
                }
                Err(Error::BatchTooLarge(message)) if batch.len() > 1 => {
                    let smaller = batch.len() / 2;
                    self.batch_limit.store(smaller, Ordering::Release);
                    tracing::warn!(
                        error = %message,
                        refused = batch.len(),
                        batch_limit = smaller,
                        "Server refused batch size; retrying with smaller batches"
                    );
                }
                Err(error) if error.is_transport() => {
                    let message = compact_text(&error.to_string());
                    self.replica.record_failure(&local_ids, &message).await?;
                    let retry_in = self.backoff.lock().await.record_failure(Instant::now());
                    tracing::warn!(
                        error = %message,
                        pending = local_ids.len(),
                        retry_in_ms = u64::try_from(retry_in.as_millis()).unwrap_or(u64::MAX),
                        "Sync round failed; outbox kept for retry"
                    );
                    self.state.send_replace(SyncState::Offline);
                    return Ok(RoundOutcome::Failed { retry_in });
                }
                Err(error) => {
                    self.state.send_replace(SyncState::Error);
                    return Err(error);
                }
            }
        }

        self.backoff.lock().await.record_success();
        self.state.send_replace(SyncState::Synced);

        if operations == 0 {
            Ok(RoundOutcome::Idle)
        } else {
            tracing::info!(operations, rows, "Outbox drained");
            Ok(RoundOutcome::Delivered { operations, rows })
        }
    }

    async fn next_wake(&self) -> Duration {
        let backoff = self.backoff.lock().await;
        let now = Instant::now();
        if backoff.is_ready(now) {
            self.config.idle_poll
        } else {
            backoff.remaining(now)
        }
    }

    /// Start the background loop: a round per trigger, per backoff expiry,
    /// and per idle poll.
    pub fn spawn(self: &Arc<Self>) -> SyncWorker {
        let shutdown = Arc::new(Notify::new());
        let stopping = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(Self::run_loop(
            self.clone(),
            shutdown.clone(),
            stopping.clone(),
        ));
        SyncWorker {
            shutdown,
            stopping,
            task: std::sync::Mutex::new(Some(task)),
        }
    }

    async fn run_loop(engine: Arc<Self>, shutdown: Arc<Notify>, stopping: Arc<AtomicBool>) {
        loop {
            if stopping.load(Ordering::Acquire) {
                break;
            }
            let wait = engine.next_wake().await;
            tokio::select! {
                () = shutdown.notified() => break,
                () = engine.trigger.notified() => {}
                () = tokio::time::sleep(wait) => {}
            }

            match engine.run_round().await {
                Ok(outcome) => tracing::debug!(?outcome, "Sync round finished"),
                Err(error) => tracing::warn!(error = %error, "Sync round aborted"),
            }
        }
        tracing::debug!("Sync worker stopped");
    }
}

/// Running background delivery loop
pub struct SyncWorker {
    shutdown: Arc<Notify>,
    stopping: Arc<AtomicBool>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SyncWorker {
    /// Stop the loop and wait for an in-flight round to finish
    pub async fn shutdown(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            self.stopping.store(true, Ordering::Release);
            self.shutdown.notify_waiters();
            if let Err(error) = task.await {
                tracing::warn!("Sync worker join error during shutdown: {error}");
            }
        }
    }
}

impl Drop for SyncWorker {
    fn drop(&mut self) {
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::{OrganizationId, Ticket, TicketStatus};
    use crate::protocol::{Operation, PullRequest, PullResponse, SyncResponse, UpdateTicket};
    use crate::services::Mutations;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    /// Echoes every create/update as a canonical server row
    #[derive(Default)]
    struct FakeServer {
        fail: AtomicBool,
        /// Largest batch accepted; zero accepts any size
        accepts: AtomicUsize,
        pushes: AtomicUsize,
        seen: std::sync::Mutex<Vec<Operation>>,
    }

    #[async_trait]
    impl SyncTransport for FakeServer {
        async fn push(&self, request: &SyncRequest) -> Result<SyncResponse> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Transport("connection refused".to_string()));
            }
            let accepts = self.accepts.load(Ordering::SeqCst);
            if accepts > 0 && request.operations.len() > accepts {
                return Err(Error::BatchTooLarge(format!(
                    "Batch of {} operations exceeds the limit of {accepts} (413)",
                    request.operations.len()
                )));
            }
            let mut response = SyncResponse::new();
            let mut seen = self.seen.lock().unwrap();
            for operation in &request.operations {
                seen.push(operation.clone());
                let at = i64::try_from(seen.len()).unwrap() * 10;
                match operation {
                    Operation::CreateTicket(op) => {
                        let ticket = Ticket {
                            id: op.id,
                            organization_id: op.organization_id,
                            title: op.title.clone(),
                            body: op.body.clone(),
                            status: op.status,
                            created_by: "user-1".to_string(),
                            created_at: at,
                            updated_at: at,
                            deleted_at: None,
                        };
                        response.insert(&ticket.into()).unwrap();
                    }
                    Operation::UpdateTicket(op) => {
                        let Some(mut value) = response
                            .get(crate::models::Table::Tickets)
                            .iter()
                            .find(|row| row["id"] == serde_json::json!(op.id))
                            .cloned()
                        else {
                            continue;
                        };
                        if let Some(title) = &op.title {
                            value["title"] = serde_json::json!(title);
                        }
                        value["updated_at"] = serde_json::json!(at);
                        response
                            .insert_value(crate::models::Table::Tickets, value)
                            .unwrap();
                    }
                    _ => {}
                }
            }
            Ok(response)
        }

        async fn pull(&self, _request: &PullRequest) -> Result<PullResponse> {
            Ok(PullResponse::default())
        }
    }

    async fn engine(server: Arc<FakeServer>, max_batch: usize) -> (ReplicaService, SyncEngine) {
        let replica = ReplicaService::open_in_memory().await.unwrap();
        let engine = SyncEngine::new(
            replica.clone(),
            server,
            SyncEngineConfig {
                max_batch,
                ..SyncEngineConfig::default()
            },
        );
        (replica, engine)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scenario_create_and_two_edits_converge_to_one_row() {
        let server = Arc::new(FakeServer::default());
        let (replica, engine) = engine(server.clone(), 100).await;
        let mutations = Mutations::new(replica.clone(), "user-1");

        let id = mutations
            .create_ticket(OrganizationId::new(), "Draft", "")
            .await
            .unwrap();
        for title in ["Second", "Final"] {
            mutations
                .update_ticket(UpdateTicket {
                    id,
                    title: Some(title.to_string()),
                    ..UpdateTicket::default()
                })
                .await
                .unwrap();
        }

        let outcome = engine.run_round().await.unwrap();
        assert_eq!(
            outcome,
            RoundOutcome::Delivered {
                operations: 3,
                rows: 1
            }
        );
        assert_eq!(server.pushes.load(Ordering::SeqCst), 1);
        assert_eq!(replica.pending_count().await.unwrap(), 0);

        let ticket: Ticket = replica.get(id).await.unwrap().unwrap();
        assert_eq!(ticket.title, "Final");
        assert_eq!(ticket.status, TicketStatus::Open);
        assert_eq!(engine.state(), SyncState::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transport_failure_keeps_outbox_and_defers_next_round() {
        let server = Arc::new(FakeServer::default());
        server.fail.store(true, Ordering::SeqCst);
        let (replica, engine) = engine(server.clone(), 100).await;
        let mutations = Mutations::new(replica.clone(), "user-1");
        mutations
            .create_ticket(OrganizationId::new(), "Offline ticket", "")
            .await
            .unwrap();

        let outcome = engine.run_round().await.unwrap();
        assert!(matches!(outcome, RoundOutcome::Failed { .. }));
        assert_eq!(replica.pending_count().await.unwrap(), 1);
        assert_eq!(engine.state(), SyncState::Offline);

        // Triggered round inside the backoff window makes no request
        let outcome = engine.run_round().await.unwrap();
        assert!(matches!(outcome, RoundOutcome::Deferred { .. }));
        assert_eq!(server.pushes.load(Ordering::SeqCst), 1);

        // Explicit sync bypasses backoff and succeeds once the network is back
        server.fail.store(false, Ordering::SeqCst);
        let outcome = engine.sync_now().await.unwrap();
        assert!(matches!(outcome, RoundOutcome::Delivered { operations: 1, .. }));
        assert_eq!(replica.pending_count().await.unwrap(), 0);
        assert_eq!(replica.pending_batch(10).await.unwrap().len(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn drains_outbox_in_capped_batches() {
        let server = Arc::new(FakeServer::default());
        let (replica, engine) = engine(server.clone(), 2).await;
        let mutations = Mutations::new(replica.clone(), "user-1");
        let org = OrganizationId::new();
        for n in 0..5 {
            mutations
                .create_ticket(org, &format!("Ticket {n}"), "")
                .await
                .unwrap();
        }

        let outcome = engine.run_round().await.unwrap();
        assert!(matches!(outcome, RoundOutcome::Delivered { operations: 5, .. }));
        assert_eq!(server.pushes.load(Ordering::SeqCst), 3);

        let kinds: Vec<_> = server
            .seen
            .lock()
            .unwrap()
            .iter()
            .map(Operation::kind)
            .collect();
        assert_eq!(kinds.len(), 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn refused_batches_shrink_until_the_server_accepts() {
        let server = Arc::new(FakeServer::default());
        server.accepts.store(3, Ordering::SeqCst);
        let (replica, engine) = engine(server.clone(), 8).await;
        let mutations = Mutations::new(replica.clone(), "user-1");
        let org = OrganizationId::new();
        for n in 0..7 {
            mutations
                .create_ticket(org, &format!("Ticket {n}"), "")
                .await
                .unwrap();
        }

        let outcome = engine.run_round().await.unwrap();
        assert!(matches!(outcome, RoundOutcome::Delivered { operations: 7, .. }));
        assert_eq!(engine.batch_limit(), 3);
        assert_eq!(replica.pending_count().await.unwrap(), 0);
        assert_eq!(server.seen.lock().unwrap().len(), 7);
        // 7 refused, 3 accepted, 3 accepted, 1 accepted
        assert_eq!(server.pushes.load(Ordering::SeqCst), 4);
        assert_eq!(engine.state(), SyncState::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_outbox_is_idle() {
        let server = Arc::new(FakeServer::default());
        let (_replica, engine) = engine(server.clone(), 100).await;

        assert_eq!(engine.run_round().await.unwrap(), RoundOutcome::Idle);
        assert_eq!(server.pushes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn worker_delivers_on_trigger_and_stops() {
        let server = Arc::new(FakeServer::default());
        let (replica, engine) = engine(server.clone(), 100).await;
        let engine = Arc::new(engine);
        let mutations = Mutations::new(replica.clone(), "user-1").with_sync_trigger(engine.trigger());
        let mut state = engine.subscribe_state();

        let worker = engine.spawn();
        mutations
            .create_ticket(OrganizationId::new(), "Triggered", "")
            .await
            .unwrap();

        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|state| *state == SyncState::Synced),
        )
        .await
        .unwrap()
        .unwrap();
        worker.shutdown().await;

        assert_eq!(replica.pending_count().await.unwrap(), 0);
    }
}
