//! In-process change feed behind `GET /v1/realtime`

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use deskline_core::models::{Memberships, OrganizationId, Table};
use deskline_core::protocol::ChangeEvent;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

/// A change tagged with the organization that owns the row
#[derive(Debug, Clone)]
pub struct FeedEvent {
    pub organization_id: OrganizationId,
    pub event: ChangeEvent,
}

#[derive(Default)]
struct FeedMetrics {
    published: AtomicU64,
    delivered: AtomicU64,
    lagged: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct FeedMetricsSnapshot {
    pub published: u64,
    pub delivered: u64,
    pub lagged: u64,
    pub subscribers: usize,
}

/// Fan-out of applied rows to every open realtime subscription
#[derive(Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<Arc<FeedEvent>>,
    metrics: Arc<FeedMetrics>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            metrics: Arc::new(FeedMetrics::default()),
        }
    }

    pub fn publish(&self, organization_id: OrganizationId, event: ChangeEvent) {
        self.metrics.published.fetch_add(1, Ordering::Relaxed);
        // No subscribers is not an error
        let _ = self.sender.send(Arc::new(FeedEvent {
            organization_id,
            event,
        }));
    }

    /// Events for `tables` in organizations the caller belongs to.
    ///
    /// The stream ends when the subscriber falls behind the buffer, so the
    /// client reconnects and backfills through pull instead of silently
    /// missing changes.
    pub fn subscribe(
        &self,
        memberships: Memberships,
        tables: BTreeSet<Table>,
    ) -> impl Stream<Item = ChangeEvent> + Send + 'static {
        let lag_metrics = self.metrics.clone();
        let delivered_metrics = self.metrics.clone();

        BroadcastStream::new(self.sender.subscribe())
            .take_while(move |item| match item {
                Ok(_) => true,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    lag_metrics.lagged.fetch_add(*skipped, Ordering::Relaxed);
                    tracing::warn!(skipped = *skipped, "Realtime subscriber lagged; closing stream");
                    false
                }
            })
            .filter_map(move |item| {
                let feed_event = item.ok()?;
                let visible = memberships.role_in(&feed_event.organization_id).is_some();
                if !visible || !tables.contains(&feed_event.event.table()) {
                    return None;
                }
                delivered_metrics.delivered.fetch_add(1, Ordering::Relaxed);
                Some(feed_event.event.clone())
            })
    }

    pub fn metrics_snapshot(&self) -> FeedMetricsSnapshot {
        FeedMetricsSnapshot {
            published: self.metrics.published.load(Ordering::Relaxed),
            delivered: self.metrics.delivered.load(Ordering::Relaxed),
            lagged: self.metrics.lagged.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }
}

/// Parse a `tables=a,b` query value; empty means every table
pub fn parse_tables(raw: Option<&str>) -> Result<BTreeSet<Table>, String> {
    let tables: BTreeSet<Table> = raw
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::parse)
        .collect::<Result<_, _>>()?;

    if tables.is_empty() {
        Ok(Table::ALL.into_iter().collect())
    } else {
        Ok(tables)
    }
}
