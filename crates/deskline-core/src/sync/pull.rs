//! Incremental pull: brings a cold or stale replica up to date.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::transport::SyncTransport;
use crate::models::{OrganizationId, Table};
use crate::protocol::PullRequest;
use crate::services::ReplicaService;
use crate::Result;

/// Safety stop for a server that keeps reporting `has_more`
const MAX_PAGES: usize = 10_000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    pub pages: usize,
    pub rows: usize,
    /// Watermarks after the last page
    pub watermarks: BTreeMap<Table, i64>,
}

pub struct PullService {
    replica: ReplicaService,
    transport: Arc<dyn SyncTransport>,
}

impl PullService {
    pub fn new(replica: ReplicaService, transport: Arc<dyn SyncTransport>) -> Self {
        Self { replica, transport }
    }

    /// Pull every row changed since the local watermarks of `tables`
    /// (all tables when empty), following `has_more` until caught up.
    ///
    /// Organizations the caller joined since a table was last pulled are
    /// then backfilled for that table, since their older rows sit below the
    /// watermark.
    pub async fn catch_up(&self, tables: &[Table]) -> Result<PullReport> {
        let mut pending: BTreeSet<Table> = if tables.is_empty() {
            Table::ALL.into_iter().collect()
        } else {
            tables.iter().copied().collect()
        };
        let covered: Vec<Table> = pending.iter().copied().collect();
        let before = self.replica.watermarks(&covered).await?;
        let mut organizations = None;
        let mut report = PullReport::default();

        while !pending.is_empty() && report.pages < MAX_PAGES {
            let requested: Vec<Table> = pending.iter().copied().collect();
            let watermarks = self.replica.watermarks(&requested).await?;
            let response = self
                .transport
                .pull(&PullRequest {
                    watermarks: watermarks.clone(),
                    tables: pending.clone(),
                    ..PullRequest::default()
                })
                .await?;

            report.pages += 1;
            report.rows += self.replica.apply_pull(&response.rows).await?;
            organizations = Some(response.organizations);

            let advanced = self.replica.watermarks(&requested).await?;
            pending = response
                .has_more
                .into_iter()
                .filter(|table| {
                    let moved = advanced.get(table) > watermarks.get(table);
                    if !moved {
                        tracing::warn!(table = %table, "Pull page did not advance watermark; stopping");
                    }
                    moved
                })
                .collect();
            report.watermarks.extend(advanced);
        }

        if let Some(current) = organizations {
            for table in covered {
                let ceiling = before.get(&table).copied().unwrap_or(0);
                self.backfill_joined(table, ceiling, &current, &mut report)
                    .await?;
            }
        }

        tracing::info!(
            pages = report.pages,
            rows = report.rows,
            "Incremental pull finished"
        );
        Ok(report)
    }

    /// Pull rows of newly joined organizations up to `ceiling`, the watermark
    /// held before this catch-up. Newer rows came through the regular pull.
    async fn backfill_joined(
        &self,
        table: Table,
        ceiling: i64,
        current: &BTreeSet<OrganizationId>,
        report: &mut PullReport,
    ) -> Result<()> {
        let known = self.replica.pulled_organizations(table).await?;
        let joined: BTreeSet<OrganizationId> = match &known {
            Some(known) => current.difference(known).copied().collect(),
            None => current.clone(),
        };

        if ceiling > 0 && !joined.is_empty() {
            tracing::info!(
                table = %table,
                organizations = joined.len(),
                ceiling,
                "Backfilling newly joined organizations"
            );
            let mut cursor = 0;
            while report.pages < MAX_PAGES {
                let response = self
                    .transport
                    .pull(&PullRequest {
                        watermarks: BTreeMap::from([(table, cursor)]),
                        tables: BTreeSet::from([table]),
                        organizations: joined.clone(),
                        ceilings: BTreeMap::from([(table, ceiling)]),
                    })
                    .await?;
                report.pages += 1;
                report.rows += self.replica.apply_pull(&response.rows).await?;

                let next = response
                    .rows
                    .get(table)
                    .iter()
                    .filter_map(|row| row["updated_at"].as_i64())
                    .max()
                    .unwrap_or(cursor);
                if !response.has_more.contains(&table) || next <= cursor {
                    break;
                }
                cursor = next;
            }
        }

        if known.as_ref() != Some(current) {
            self.replica.set_pulled_organizations(table, current).await?;
        }
        Ok(())
    }

    /// Clear the replica and outbox, then pull every table from epoch.
    ///
    /// Used only when the authenticated identity changes.
    pub async fn full_resync(&self) -> Result<PullReport> {
        self.replica.reset().await?;
        self.catch_up(&Table::ALL).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::{MacroChain, MacroChainId, OrganizationId, Ticket, TicketStatus};
    use crate::protocol::{PullResponse, SyncRequest, SyncResponse, TableRows};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    /// Serves a fixed set of rows with strict `>` watermark filtering and a page cap
    struct FakeStore {
        rows: Vec<MacroChain>,
        page_limit: usize,
        requests: Mutex<Vec<PullRequest>>,
        /// Caller memberships; empty serves every organization
        memberships: Mutex<BTreeSet<OrganizationId>>,
    }

    #[async_trait]
    impl SyncTransport for FakeStore {
        async fn push(&self, _request: &SyncRequest) -> Result<SyncResponse> {
            Err(Error::Transport("push not served".to_string()))
        }

        async fn pull(&self, request: &PullRequest) -> Result<PullResponse> {
            self.requests.lock().unwrap().push(request.clone());
            let watermark = request.watermark(Table::MacroChains);
            let ceiling = request.ceiling(Table::MacroChains);
            let memberships = self.memberships.lock().unwrap().clone();
            let mut matching: Vec<_> = self
                .rows
                .iter()
                .filter(|row| memberships.is_empty() || memberships.contains(&row.organization_id))
                .filter(|row| {
                    request.organizations.is_empty()
                        || request.organizations.contains(&row.organization_id)
                })
                .filter(|row| ceiling.is_none_or(|ceiling| row.updated_at <= ceiling))
                .filter(|row| row.updated_at > watermark)
                .filter(|row| watermark > 0 || row.deleted_at.is_none())
                .cloned()
                .collect();
            matching.sort_by_key(|row| row.updated_at);

            let mut response = PullResponse {
                organizations: memberships,
                ..PullResponse::default()
            };
            if matching.len() > self.page_limit {
                matching.truncate(self.page_limit);
                response.has_more.insert(Table::MacroChains);
            }
            let mut rows = TableRows::new();
            for row in matching {
                rows.insert(&row.into()).unwrap();
            }
            response.rows = rows;
            Ok(response)
        }
    }

    fn chain(name: &str, updated_at: i64, deleted: bool) -> MacroChain {
        MacroChain {
            id: MacroChainId::new(),
            organization_id: OrganizationId::new(),
            name: name.to_string(),
            actions: vec!["close".to_string()],
            created_at: 1,
            updated_at,
            deleted_at: deleted.then_some(updated_at),
        }
    }

    async fn service(rows: Vec<MacroChain>, page_limit: usize) -> (ReplicaService, Arc<FakeStore>, PullService) {
        let replica = ReplicaService::open_in_memory().await.unwrap();
        let store = Arc::new(FakeStore {
            rows,
            page_limit,
            requests: Mutex::new(Vec::new()),
            memberships: Mutex::new(BTreeSet::new()),
        });
        let service = PullService::new(replica.clone(), store.clone());
        (replica, store, service)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cold_start_pages_until_caught_up() {
        let rows = (1..=5).map(|n| chain(&format!("m{n}"), n * 10, false)).collect();
        let (replica, store, service) = service(rows, 2).await;

        let report = service.catch_up(&[Table::MacroChains]).await.unwrap();

        assert_eq!(report.pages, 3);
        assert_eq!(report.rows, 5);
        assert_eq!(report.watermarks[&Table::MacroChains], 50);
        assert_eq!(replica.list::<MacroChain>(false).await.unwrap().len(), 5);

        let sent: Vec<i64> = store
            .requests
            .lock()
            .unwrap()
            .iter()
            .map(|request| request.watermark(Table::MacroChains))
            .collect();
        assert_eq!(sent, [0, 20, 40]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn repeating_pull_at_new_watermark_is_empty() {
        let rows = vec![chain("a", 10, false), chain("b", 20, false)];
        let (_replica, _store, service) = service(rows, 100).await;

        service.catch_up(&[Table::MacroChains]).await.unwrap();
        let again = service.catch_up(&[Table::MacroChains]).await.unwrap();

        assert_eq!(again.pages, 1);
        assert_eq!(again.rows, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn incremental_pull_delivers_tombstones() {
        let live = chain("live", 10, false);
        let mut gone = chain("gone", 5, false);
        let (replica, _store, service) = service(vec![live.clone(), gone.clone()], 100).await;
        service.catch_up(&[Table::MacroChains]).await.unwrap();

        // Deleted on the server after the cold start
        gone.updated_at = 30;
        gone.deleted_at = Some(30);
        let store = Arc::new(FakeStore {
            rows: vec![live, gone.clone()],
            page_limit: 100,
            requests: Mutex::new(Vec::new()),
            memberships: Mutex::new(BTreeSet::new()),
        });
        let service = PullService::new(replica.clone(), store);
        service.catch_up(&[Table::MacroChains]).await.unwrap();

        let fetched: MacroChain = replica.get(gone.id).await.unwrap().unwrap();
        assert_eq!(fetched.deleted_at, Some(30));
        assert_eq!(replica.list::<MacroChain>(false).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn joining_an_organization_backfills_its_older_rows() {
        let acme = OrganizationId::new();
        let globex = OrganizationId::new();
        let in_org = |name: &str, updated_at: i64, deleted: bool, org: OrganizationId| MacroChain {
            organization_id: org,
            ..chain(name, updated_at, deleted)
        };
        let rows = vec![
            in_org("ours", 50, false, acme),
            in_org("old", 20, false, globex),
            in_org("gone", 30, true, globex),
            in_org("newer", 80, false, globex),
        ];
        let (replica, store, service) = service(rows, 100).await;
        store.memberships.lock().unwrap().insert(acme);

        service.catch_up(&[Table::MacroChains]).await.unwrap();
        assert_eq!(replica.list::<MacroChain>(false).await.unwrap().len(), 1);

        store.memberships.lock().unwrap().insert(globex);
        let report = service.catch_up(&[Table::MacroChains]).await.unwrap();

        let names: BTreeSet<String> = replica
            .list::<MacroChain>(true)
            .await
            .unwrap()
            .into_iter()
            .map(|chain| chain.name)
            .collect();
        assert_eq!(
            names,
            BTreeSet::from(["newer", "old", "ours"].map(String::from))
        );
        assert_eq!(report.pages, 2);
        assert_eq!(report.watermarks[&Table::MacroChains], 80);
        let backfill = store.requests.lock().unwrap().last().unwrap().clone();
        assert_eq!(backfill.organizations, BTreeSet::from([globex]));
        assert_eq!(backfill.ceiling(Table::MacroChains), Some(50));
        assert_eq!(backfill.watermark(Table::MacroChains), 0);

        let again = service.catch_up(&[Table::MacroChains]).await.unwrap();
        assert_eq!(again.pages, 1);
        assert_eq!(again.rows, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_resync_drops_previous_identity_data() {
        let (replica, _store, service) = service(vec![chain("shared", 10, false)], 100).await;
        let ticket = Ticket {
            id: crate::models::TicketId::new(),
            organization_id: OrganizationId::new(),
            title: "Other user's ticket".to_string(),
            body: String::new(),
            status: TicketStatus::Open,
            created_by: "someone-else".to_string(),
            created_at: 1,
            updated_at: 1,
            deleted_at: None,
        };
        let mut rows = TableRows::new();
        rows.insert(&ticket.into()).unwrap();
        replica.apply_pull(&rows).await.unwrap();

        service.full_resync().await.unwrap();

        assert!(replica.list::<Ticket>(true).await.unwrap().is_empty());
        assert_eq!(replica.list::<MacroChain>(false).await.unwrap().len(), 1);
    }
}
