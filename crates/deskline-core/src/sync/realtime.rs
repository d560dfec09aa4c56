//! Realtime change channel: applies pushed row changes to the replica.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::pull::PullService;
use crate::error::Result;
use crate::models::Table;
use crate::protocol::ChangeEvent;
use crate::services::ReplicaService;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Producer of row-level change events for a set of tables
#[async_trait]
pub trait ChangeSource: Send + Sync + 'static {
    async fn subscribe(&self, tables: &[Table]) -> Result<BoxStream<'static, Result<ChangeEvent>>>;
}

struct Inner {
    replica: ReplicaService,
    source: Arc<dyn ChangeSource>,
    tables: Vec<Table>,
    backfill: Option<Arc<PullService>>,
    connected: AtomicBool,
    applied: AtomicU64,
    shutdown: Notify,
    shutdown_requested: AtomicBool,
}

/// One live subscription, owned by the session that created it
pub struct RealtimeConnection {
    inner: Arc<Inner>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeConnection {
    /// Start consuming `source` in the background.
    ///
    /// When `backfill` is given, every (re)connect first catches up through
    /// incremental pull so events missed while disconnected are not lost.
    pub fn start(
        replica: ReplicaService,
        source: Arc<dyn ChangeSource>,
        tables: Vec<Table>,
        backfill: Option<Arc<PullService>>,
    ) -> Self {
        let tables = if tables.is_empty() {
            Table::ALL.to_vec()
        } else {
            tables
        };
        let inner = Arc::new(Inner {
            replica,
            source,
            tables,
            backfill,
            connected: AtomicBool::new(false),
            applied: AtomicU64::new(0),
            shutdown: Notify::new(),
            shutdown_requested: AtomicBool::new(false),
        });

        let task = tokio::spawn(Self::run_connection_loop(inner.clone()));
        Self {
            inner,
            task: std::sync::Mutex::new(Some(task)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Events applied to the replica since start
    pub fn events_applied(&self) -> u64 {
        self.inner.applied.load(Ordering::Acquire)
    }

    /// Stop the subscription and wait for the background task
    pub async fn shutdown(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            self.inner.shutdown_requested.store(true, Ordering::Release);
            self.inner.shutdown.notify_waiters();
            match task.await {
                Ok(()) => tracing::info!("Realtime connection shut down"),
                Err(error) => tracing::warn!("Realtime task join error during shutdown: {error}"),
            }
        }
    }

    async fn run_connection_loop(inner: Arc<Inner>) {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if inner.shutdown_requested.load(Ordering::Acquire) {
                break;
            }

            tokio::select! {
                () = inner.shutdown.notified() => break,
                result = Self::connect_once(&inner) => {
                    inner.connected.store(false, Ordering::Release);
                    match result {
                        Ok(()) => {
                            tracing::info!("Realtime stream ended; reconnecting");
                            backoff = INITIAL_BACKOFF;
                        }
                        Err(error) => {
                            tracing::warn!(
                                error = %error,
                                retry_in_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                                "Realtime connection failed"
                            );
                        }
                    }
                }
            }

            tokio::select! {
                () = inner.shutdown.notified() => break,
                () = sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }

        inner.connected.store(false, Ordering::Release);
    }

    async fn connect_once(inner: &Arc<Inner>) -> Result<()> {
        let mut events = inner.source.subscribe(&inner.tables).await?;
        inner.connected.store(true, Ordering::Release);
        tracing::info!(tables = inner.tables.len(), "Realtime channel subscribed");

        if let Some(pull) = &inner.backfill {
            if let Err(error) = pull.catch_up(&inner.tables).await {
                tracing::warn!(error = %error, "Realtime backfill pull failed");
            }
        }

        while let Some(event) = events.next().await {
            let event = event?;
            if !inner.tables.contains(&event.table()) {
                continue;
            }
            if let Err(error) = inner.replica.apply_change_event(&event).await {
                tracing::warn!(
                    error = %error,
                    table = %event.table(),
                    event = event.label(),
                    "Failed to apply realtime event"
                );
                continue;
            }
            inner.applied.fetch_add(1, Ordering::AcqRel);
            tracing::debug!(table = %event.table(), event = event.label(), "Applied realtime event");
        }
        Ok(())
    }
}

impl Drop for RealtimeConnection {
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
