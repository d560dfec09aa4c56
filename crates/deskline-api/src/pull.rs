//! Incremental pull: rows changed since the caller's per-table watermarks,
//! scoped to the caller's organizations.

use deskline_core::models::{
    MacroChain, Organization, SyncRow, Table, TagEnumOption, TagKey, Ticket, TicketTagEnumValue,
};
use deskline_core::protocol::{PullRequest, PullResponse};
use libsql::params::Params;
use libsql::{Connection, Value};

use crate::auth::Caller;
use crate::error::AppError;
use crate::store::rows::{query_all, StoredRow};
use crate::store::{Store, StoreResult};

struct Page<T> {
    rows: Vec<T>,
    has_more: bool,
}

#[derive(Clone)]
pub struct PullService {
    store: Store,
    page_limit: usize,
}

impl PullService {
    pub fn new(store: Store, page_limit: usize) -> Self {
        Self {
            store,
            page_limit: page_limit.max(1),
        }
    }

    pub async fn pull(
        &self,
        caller: &Caller,
        request: &PullRequest,
    ) -> Result<PullResponse, AppError> {
        let mut response = PullResponse {
            organizations: caller.memberships.organization_ids().copied().collect(),
            ..PullResponse::default()
        };

        let organizations: Vec<Value> = response
            .organizations
            .iter()
            .filter(|id| request.organizations.is_empty() || request.organizations.contains(*id))
            .map(|id| Value::Text(id.to_string()))
            .collect();
        if organizations.is_empty() {
            return Ok(response);
        }
        let db = self.store.lock().await;
        let conn = db.connection();

        for table in request.requested_tables() {
            let query = TableQuery::new(
                table,
                request.watermark(table),
                request.ceiling(table),
                &organizations,
            );
            let has_more = match table {
                Table::Organizations => {
                    self.collect::<Organization>(conn, &query, &mut response).await?
                }
                Table::Tickets => self.collect::<Ticket>(conn, &query, &mut response).await?,
                Table::TagKeys => self.collect::<TagKey>(conn, &query, &mut response).await?,
                Table::TagEnumOptions => {
                    self.collect::<TagEnumOption>(conn, &query, &mut response)
                        .await?
                }
                Table::TicketTagEnumValues => {
                    self.collect::<TicketTagEnumValue>(conn, &query, &mut response)
                        .await?
                }
                Table::MacroChains => {
                    self.collect::<MacroChain>(conn, &query, &mut response)
                        .await?
                }
            };
            if has_more {
                response.has_more.insert(table);
            }
        }

        Ok(response)
    }

    async fn collect<T: StoredRow>(
        &self,
        conn: &Connection,
        query: &TableQuery<'_>,
        response: &mut PullResponse,
    ) -> Result<bool, AppError> {
        let page = self.page::<T>(conn, query).await?;
        tracing::debug!(
            table = %query.table,
            watermark = query.watermark,
            rows = page.rows.len(),
            has_more = page.has_more,
            "Pulled table page"
        );
        for row in page.rows {
            response.rows.insert(&row.into())?;
        }
        Ok(page.has_more)
    }

    /// One page in `(updated_at, id)` order. A group of rows sharing one
    /// `updated_at` is never split across pages, so a strict `>` watermark
    /// on the next pull cannot skip any of them.
    async fn page<T: StoredRow>(
        &self,
        conn: &Connection,
        query: &TableQuery<'_>,
    ) -> StoreResult<Page<T>> {
        let limit = i64::try_from(self.page_limit).unwrap_or(i64::MAX);
        let mut rows = query_all::<T>(
            conn,
            &format!(
                "SELECT {} FROM {} WHERE {} ORDER BY updated_at, id LIMIT ?2",
                T::COLUMNS,
                query.table,
                query.filter
            ),
            query.params(limit.saturating_add(1)),
        )
        .await?;

        if rows.len() <= self.page_limit {
            return Ok(Page {
                rows,
                has_more: false,
            });
        }

        let boundary = rows[self.page_limit].updated_at();
        rows.retain(|row| row.updated_at() < boundary);
        if !rows.is_empty() {
            return Ok(Page {
                rows,
                has_more: true,
            });
        }

        // The whole page shares one timestamp: return that group in full
        let rows = query_all::<T>(
            conn,
            &format!(
                "SELECT {} FROM {} WHERE {} AND updated_at = ?2 ORDER BY id",
                T::COLUMNS,
                query.table,
                query.filter
            ),
            query.params(boundary),
        )
        .await?;
        let mut more = conn
            .query(
                &format!(
                    "SELECT EXISTS (SELECT 1 FROM {} WHERE {} AND updated_at > ?2)",
                    query.table, query.filter
                ),
                query.params(boundary),
            )
            .await?;
        let has_more = match more.next().await? {
            Some(row) => row.get::<i64>(0)? != 0,
            None => false,
        };
        Ok(Page { rows, has_more })
    }
}

/// Filter and bindings for one table. `?1` is the watermark, `?2` is free
/// for the caller, organization ids start at `?3` and the ceiling, if any,
/// follows them.
struct TableQuery<'a> {
    table: Table,
    watermark: i64,
    ceiling: Option<i64>,
    filter: String,
    organizations: &'a [Value],
}

impl<'a> TableQuery<'a> {
    fn new(
        table: Table,
        watermark: i64,
        ceiling: Option<i64>,
        organizations: &'a [Value],
    ) -> Self {
        let placeholders = (0..organizations.len())
            .map(|index| format!("?{}", index + 3))
            .collect::<Vec<_>>()
            .join(", ");
        let scope = match table {
            Table::Organizations => format!("id IN ({placeholders})"),
            Table::Tickets | Table::TagKeys | Table::MacroChains => {
                format!("organization_id IN ({placeholders})")
            }
            Table::TagEnumOptions => format!(
                "tag_key_id IN (SELECT id FROM tag_keys WHERE organization_id IN ({placeholders}))"
            ),
            Table::TicketTagEnumValues => format!(
                "ticket_id IN (SELECT id FROM tickets WHERE organization_id IN ({placeholders}))"
            ),
        };
        // A cold replica has nothing to delete, so tombstones are skipped
        let window = if watermark <= 0 {
            "updated_at >= ?1 AND deleted_at IS NULL"
        } else {
            "updated_at > ?1"
        };

        let mut filter = format!("{scope} AND {window}");
        if ceiling.is_some() {
            filter.push_str(&format!(" AND updated_at <= ?{}", organizations.len() + 3));
        }

        Self {
            table,
            watermark,
            ceiling,
            filter,
            organizations,
        }
    }

    fn params(&self, second: i64) -> Params {
        let mut values = Vec::with_capacity(self.organizations.len() + 3);
        values.push(Value::Integer(self.watermark.max(0)));
        values.push(Value::Integer(second));
        values.extend(self.organizations.iter().cloned());
        if let Some(ceiling) = self.ceiling {
            values.push(Value::Integer(ceiling));
        }
        Params::Positional(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::ChangeFeed;
    use crate::reconciler::Reconciler;
    use deskline_core::models::{OrganizationId, Role, TicketId, TicketStatus};
    use deskline_core::protocol::{CreateTicket, DeleteRow, Operation};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    async fn caller(store: &Store, user_id: &str) -> Caller {
        Caller {
            user_id: user_id.to_string(),
            session_id: None,
            memberships: store.memberships_for(user_id).await.unwrap(),
        }
    }

    fn create_ticket(organization_id: OrganizationId, title: &str) -> Operation {
        Operation::CreateTicket(CreateTicket {
            id: TicketId::new(),
            organization_id,
            title: title.to_string(),
            body: String::new(),
            status: TicketStatus::Open,
        })
    }

    fn tickets_only(watermark: i64) -> PullRequest {
        PullRequest {
            watermarks: [(Table::Tickets, watermark)].into_iter().collect(),
            tables: [Table::Tickets].into_iter().collect(),
            ..PullRequest::default()
        }
    }

    fn watermark(response: &PullResponse, table: Table) -> i64 {
        response
            .rows
            .get(table)
            .iter()
            .filter_map(|row| row["updated_at"].as_i64())
            .max()
            .unwrap_or(0)
    }

    fn ids(response: &PullResponse, table: Table) -> BTreeSet<String> {
        response
            .rows
            .get(table)
            .iter()
            .map(|row| row["id"].as_str().unwrap().to_string())
            .collect()
    }

    async fn insert_ticket_at(store: &Store, organization_id: OrganizationId, updated_at: i64) {
        let db = store.lock().await;
        db.connection()
            .execute(
                "INSERT INTO tickets (id, organization_id, title, body, status, created_by, created_at, updated_at, deleted_at)
                 VALUES (?1, ?2, 'Imported', '', 'open', 'alice', ?3, ?3, NULL)",
                libsql::params![TicketId::new().to_string(), organization_id.to_string(), updated_at],
            )
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cold_pull_is_scoped_and_live_only() {
        let store = Store::open_in_memory().await.unwrap();
        let reconciler = Reconciler::new(store.clone(), ChangeFeed::new(16));
        let acme = store.create_organization("Acme", "alice").await.unwrap();
        let globex = store.create_organization("Globex", "gina").await.unwrap();
        let alice = caller(&store, "alice").await;
        let gina = caller(&store, "gina").await;

        let kept = create_ticket(acme.id, "Kept");
        let removed = create_ticket(acme.id, "Removed");
        reconciler.apply(&alice, &kept).await;
        reconciler.apply(&alice, &removed).await;
        reconciler.apply(&gina, &create_ticket(globex.id, "Elsewhere")).await;
        let (_, removed_id) = removed.target();
        let delete = Operation::DeleteTicket(DeleteRow {
            id: TicketId::from_uuid(removed_id),
        });
        reconciler.apply(&alice, &delete).await;

        let service = PullService::new(store.clone(), 100);
        let response = service.pull(&alice, &PullRequest::default()).await.unwrap();

        assert_eq!(
            ids(&response, Table::Tickets),
            BTreeSet::from([kept.target().1.to_string()])
        );
        assert_eq!(
            ids(&response, Table::Organizations),
            BTreeSet::from([acme.id.to_string()])
        );
        assert!(response.has_more.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn watermark_pull_carries_tombstones_then_goes_quiet() {
        let store = Store::open_in_memory().await.unwrap();
        let reconciler = Reconciler::new(store.clone(), ChangeFeed::new(16));
        let acme = store.create_organization("Acme", "alice").await.unwrap();
        let alice = caller(&store, "alice").await;
        let service = PullService::new(store.clone(), 100);

        let create = create_ticket(acme.id, "Short-lived");
        reconciler.apply(&alice, &create).await;
        let first = service.pull(&alice, &tickets_only(0)).await.unwrap();
        let mark = watermark(&first, Table::Tickets);
        assert!(mark > 0);

        let delete = Operation::DeleteTicket(DeleteRow {
            id: TicketId::from_uuid(create.target().1),
        });
        reconciler.apply(&alice, &delete).await;

        let delta = service.pull(&alice, &tickets_only(mark)).await.unwrap();
        let rows = delta.rows.get(Table::Tickets);
        assert_eq!(rows.len(), 1);
        assert!(rows[0]["deleted_at"].is_i64());

        let again = service
            .pull(&alice, &tickets_only(watermark(&delta, Table::Tickets)))
            .await
            .unwrap();
        assert!(again.rows.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn writes_right_after_a_pull_reach_the_next_pull() {
        let store = Store::open_in_memory().await.unwrap();
        let reconciler = Reconciler::new(store.clone(), ChangeFeed::new(16));
        let acme = store.create_organization("Acme", "alice").await.unwrap();
        let alice = caller(&store, "alice").await;
        let service = PullService::new(store.clone(), 100);

        let first = create_ticket(acme.id, "First");
        reconciler.apply(&alice, &first).await;
        let mut mark = watermark(
            &service.pull(&alice, &tickets_only(0)).await.unwrap(),
            Table::Tickets,
        );

        // Back-to-back writes and pulls land within one millisecond
        for round in 0..25 {
            let create = create_ticket(acme.id, &format!("Round {round}"));
            reconciler.apply(&alice, &create).await;
            let delta = service.pull(&alice, &tickets_only(mark)).await.unwrap();

            assert_eq!(
                ids(&delta, Table::Tickets),
                BTreeSet::from([create.target().1.to_string()])
            );
            let next = watermark(&delta, Table::Tickets);
            assert!(next > mark);
            mark = next;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn paging_visits_every_row_once() {
        let store = Store::open_in_memory().await.unwrap();
        let acme = store.create_organization("Acme", "alice").await.unwrap();
        for updated_at in [10, 20, 30, 40, 50] {
            insert_ticket_at(&store, acme.id, updated_at).await;
        }
        let alice = caller(&store, "alice").await;
        let service = PullService::new(store.clone(), 2);

        let mut seen = BTreeSet::new();
        let mut mark = 0;
        let mut rounds = 0;
        loop {
            let page = service.pull(&alice, &tickets_only(mark)).await.unwrap();
            let page_ids = ids(&page, Table::Tickets);
            assert!(page_ids.is_disjoint(&seen));
            seen.extend(page_ids);
            mark = watermark(&page, Table::Tickets);
            rounds += 1;
            if !page.has_more.contains(&Table::Tickets) {
                break;
            }
        }

        assert_eq!(seen.len(), 5);
        assert_eq!(rounds, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rows_sharing_a_timestamp_stay_on_one_page() {
        let store = Store::open_in_memory().await.unwrap();
        let acme = store.create_organization("Acme", "alice").await.unwrap();
        for _ in 0..3 {
            insert_ticket_at(&store, acme.id, 100).await;
        }
        insert_ticket_at(&store, acme.id, 200).await;
        let alice = caller(&store, "alice").await;
        let service = PullService::new(store.clone(), 2);

        let first = service.pull(&alice, &tickets_only(50)).await.unwrap();
        assert_eq!(first.rows.get(Table::Tickets).len(), 3);
        assert!(first.has_more.contains(&Table::Tickets));

        let second = service.pull(&alice, &tickets_only(100)).await.unwrap();
        assert_eq!(second.rows.get(Table::Tickets).len(), 1);
        assert!(second.has_more.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn narrowed_pull_stays_inside_organizations_and_ceiling() {
        let store = Store::open_in_memory().await.unwrap();
        let acme = store.create_organization("Acme", "alice").await.unwrap();
        let globex = store.create_organization("Globex", "gina").await.unwrap();
        insert_ticket_at(&store, globex.id, 100).await;
        insert_ticket_at(&store, acme.id, 150).await;
        insert_ticket_at(&store, globex.id, 300).await;
        store.set_member(globex.id, "alice", Role::Member).await.unwrap();
        let alice = caller(&store, "alice").await;

        let request = PullRequest {
            organizations: BTreeSet::from([globex.id]),
            ceilings: [(Table::Tickets, 200)].into_iter().collect(),
            ..tickets_only(0)
        };
        let response = PullService::new(store, 10).pull(&alice, &request).await.unwrap();

        let rows = response.rows.get(Table::Tickets);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["updated_at"], 100);
        assert_eq!(rows[0]["organization_id"], globex.id.to_string());
        assert!(response.has_more.is_empty());
        assert_eq!(response.organizations, BTreeSet::from([acme.id, globex.id]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn callers_without_memberships_get_nothing() {
        let store = Store::open_in_memory().await.unwrap();
        store.create_organization("Acme", "alice").await.unwrap();
        let ghost = caller(&store, "ghost").await;

        let response = PullService::new(store, 10)
            .pull(&ghost, &PullRequest::default())
            .await
            .unwrap();
        assert!(response.rows.is_empty());
    }
}
