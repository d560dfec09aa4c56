//! Authoritative store: the server's libSQL database and membership lookups

mod migrations;
pub mod rows;

use std::sync::Arc;

use deskline_core::models::{Memberships, Organization, OrganizationId, Role, Table};
use deskline_core::util::now_millis;
use libsql::{Builder, Connection, Database as LibSqlDatabase};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

use crate::config::BootstrapOrganization;
use crate::error::AppError;
use rows::{query_optional, StoredRow};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] libsql::Error),
    #[error("json column: {0}")]
    Json(#[from] serde_json::Error),
    #[error("undecodable column: {0}")]
    Decode(String),
}

impl From<StoreError> for AppError {
    fn from(error: StoreError) -> Self {
        Self::internal(error.to_string())
    }
}

/// Open database plus its single connection
pub struct Database {
    _db: LibSqlDatabase,
    conn: Connection,
    last_stamp: i64,
}

impl Database {
    async fn open(path: &str) -> StoreResult<Self> {
        let db = Builder::new_local(path).build().await?;
        let conn = db.connect()?;

        // WAL is unavailable for in-memory databases
        conn.execute("PRAGMA journal_mode = WAL;", ()).await.ok();
        conn.execute("PRAGMA synchronous = NORMAL;", ()).await.ok();
        conn.execute("PRAGMA foreign_keys = ON;", ()).await?;
        migrations::run(&conn).await?;
        let last_stamp = newest_stamp(&conn).await?;

        Ok(Self {
            _db: db,
            conn,
            last_stamp,
        })
    }

    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Timestamp for the next write: wall-clock millis, but always above
    /// every stamp handed out before. Pulls compare watermarks with a strict
    /// `>`, so two writes must never share a stamp across the lock.
    pub fn next_stamp(&mut self) -> i64 {
        self.last_stamp = now_millis().max(self.last_stamp.saturating_add(1));
        self.last_stamp
    }
}

/// Highest `updated_at` across every synced table
async fn newest_stamp(conn: &Connection) -> StoreResult<i64> {
    let sql = format!(
        "SELECT COALESCE(MAX(stamp), 0) FROM ({})",
        Table::ALL
            .iter()
            .map(|table| format!("SELECT MAX(updated_at) AS stamp FROM {table}"))
            .collect::<Vec<_>>()
            .join(" UNION ALL ")
    );
    let mut rows = conn.query(&sql, ()).await?;
    match rows.next().await? {
        Some(row) => Ok(row.get::<i64>(0)?),
        None => Ok(0),
    }
}

/// Shared handle to the authoritative store.
///
/// Holding the lock makes an operation's authorization read and its write
/// one atomic unit.
#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Database>>,
}

impl Store {
    /// Open (and migrate) the store at `path`; `:memory:` opens a private
    /// in-memory database.
    pub async fn open(path: &str) -> StoreResult<Self> {
        let db = Database::open(path).await?;
        tracing::info!(path, "Opened authoritative store");
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> StoreResult<Self> {
        Self::open(":memory:").await
    }

    pub async fn lock(&self) -> MutexGuard<'_, Database> {
        self.db.lock().await
    }

    /// Organization roles of `user_id`; deleted organizations are excluded
    pub async fn memberships_for(&self, user_id: &str) -> StoreResult<Memberships> {
        let db = self.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT m.organization_id, m.role
                 FROM organization_members m
                 JOIN organizations o ON o.id = m.organization_id
                 WHERE m.user_id = ?1 AND o.deleted_at IS NULL",
                [user_id],
            )
            .await?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            let organization_id: OrganizationId = rows::parse_id(&row, 0)?;
            let role: Role = row
                .get::<String>(1)?
                .parse()
                .map_err(StoreError::Decode)?;
            entries.push((organization_id, role));
        }
        Ok(Memberships::new(entries))
    }

    /// Create an organization with `admin_user_id` as its first admin
    pub async fn create_organization(
        &self,
        name: &str,
        admin_user_id: &str,
    ) -> StoreResult<Organization> {
        let id = OrganizationId::new();

        let mut db = self.lock().await;
        let now = db.next_stamp();
        let tx = db.connection().transaction().await?;
        let organization = query_optional::<Organization>(
            &tx,
            &format!(
                "INSERT INTO organizations (id, name, created_at, updated_at, deleted_at)
                 VALUES (?1, ?2, ?3, ?3, NULL)
                 RETURNING {}",
                Organization::COLUMNS
            ),
            libsql::params![id.to_string(), name.trim(), now],
        )
        .await?
        .ok_or_else(|| StoreError::Decode("organization insert returned no row".to_string()))?;
        tx.execute(
            "INSERT INTO organization_members (organization_id, user_id, role) VALUES (?1, ?2, ?3)",
            libsql::params![id.to_string(), admin_user_id, Role::Admin.as_str()],
        )
        .await?;
        tx.commit().await?;

        tracing::info!(organization = %id, "Created organization");
        Ok(organization)
    }

    /// Grant or change a user's role in an organization
    #[cfg(test)]
    pub async fn set_member(
        &self,
        organization_id: OrganizationId,
        user_id: &str,
        role: Role,
    ) -> StoreResult<()> {
        let db = self.lock().await;
        db.connection()
            .execute(
                "INSERT INTO organization_members (organization_id, user_id, role)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(organization_id, user_id) DO UPDATE SET role = excluded.role",
                libsql::params![organization_id.to_string(), user_id, role.as_str()],
            )
            .await?;
        Ok(())
    }

    /// Create the configured organization unless its admin already belongs
    /// to one. Returns the new organization, if any.
    pub async fn bootstrap(
        &self,
        bootstrap: &BootstrapOrganization,
    ) -> StoreResult<Option<Organization>> {
        let existing = self.memberships_for(&bootstrap.admin_user_id).await?;
        if !existing.is_empty() {
            tracing::debug!(
                organizations = existing.len(),
                "Bootstrap admin already has memberships"
            );
            return Ok(None);
        }
        self.create_organization(&bootstrap.name, &bootstrap.admin_user_id)
            .await
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(flavor = "multi_thread")]
    async fn creator_becomes_admin() {
        let store = Store::open_in_memory().await.unwrap();
        let org = store.create_organization("  Acme Support ", "alice").await.unwrap();

        assert_eq!(org.name, "Acme Support");
        assert_eq!(org.created_at, org.updated_at);
        let memberships = store.memberships_for("alice").await.unwrap();
        assert_eq!(memberships.role_in(&org.id), Some(Role::Admin));
        assert!(store.memberships_for("bob").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn set_member_upserts_role() {
        let store = Store::open_in_memory().await.unwrap();
        let org = store.create_organization("Acme", "alice").await.unwrap();

        store.set_member(org.id, "bob", Role::Customer).await.unwrap();
        store.set_member(org.id, "bob", Role::Member).await.unwrap();

        let memberships = store.memberships_for("bob").await.unwrap();
        assert_eq!(memberships.len(), 1);
        assert_eq!(memberships.role_in(&org.id), Some(Role::Member));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bootstrap_runs_once_per_admin() {
        let store = Store::open_in_memory().await.unwrap();
        let bootstrap = BootstrapOrganization {
            name: "Acme".to_string(),
            admin_user_id: "alice".to_string(),
        };

        assert!(store.bootstrap(&bootstrap).await.unwrap().is_some());
        assert!(store.bootstrap(&bootstrap).await.unwrap().is_none());
        assert_eq!(store.memberships_for("alice").await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stamps_stay_ahead_of_stored_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("server.db");
        let path = path.to_string_lossy().to_string();

        let store = Store::open(&path).await.unwrap();
        let future = now_millis() + 60_000;
        {
            let db = store.lock().await;
            db.connection()
                .execute(
                    "INSERT INTO organizations (id, name, created_at, updated_at, deleted_at)
                     VALUES (?1, 'Imported', ?2, ?2, NULL)",
                    libsql::params![OrganizationId::new().to_string(), future],
                )
                .await
                .unwrap();
        }
        drop(store);

        let store = Store::open(&path).await.unwrap();
        let mut db = store.lock().await;
        let first = db.next_stamp();
        let second = db.next_stamp();
        assert_eq!(first, future + 1);
        assert_eq!(second, future + 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn organizations_created_together_get_distinct_stamps() {
        let store = Store::open_in_memory().await.unwrap();
        let acme = store.create_organization("Acme", "alice").await.unwrap();
        let globex = store.create_organization("Globex", "alice").await.unwrap();

        assert!(globex.updated_at > acme.updated_at);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn file_store_keeps_schema_across_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("server.db");
        let path = path.to_string_lossy().to_string();

        let store = Store::open(&path).await.unwrap();
        store.create_organization("Acme", "alice").await.unwrap();
        drop(store);

        let store = Store::open(&path).await.unwrap();
        assert_eq!(store.memberships_for("alice").await.unwrap().len(), 1);
    }
}
