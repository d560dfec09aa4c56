//! Authoritative store migrations

use libsql::Connection;

use super::StoreResult;

/// Current schema version
const CURRENT_VERSION: i32 = 1;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> StoreResult<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        apply(conn, 1, &V1_SCHEMA).await?;
    }

    Ok(())
}

async fn get_version(conn: &Connection) -> StoreResult<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Version 1: every synchronized table plus server-only memberships.
///
/// `updated_at` indexes back incremental pull; the partial unique index keeps
/// one live enum value per (ticket, tag key).
const V1_SCHEMA: [&str; 17] = [
    "CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    )",
    "CREATE TABLE IF NOT EXISTS organizations (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        deleted_at INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS organization_members (
        organization_id TEXT NOT NULL REFERENCES organizations(id),
        user_id TEXT NOT NULL,
        role TEXT NOT NULL CHECK (role IN ('admin', 'member', 'customer')),
        PRIMARY KEY (organization_id, user_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_organization_members_user
        ON organization_members(user_id)",
    "CREATE TABLE IF NOT EXISTS tickets (
        id TEXT PRIMARY KEY,
        organization_id TEXT NOT NULL REFERENCES organizations(id),
        title TEXT NOT NULL,
        body TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL CHECK (status IN ('open', 'pending', 'closed')),
        created_by TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        deleted_at INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_tickets_pull ON tickets(organization_id, updated_at)",
    "CREATE TABLE IF NOT EXISTS tag_keys (
        id TEXT PRIMARY KEY,
        organization_id TEXT NOT NULL REFERENCES organizations(id),
        name TEXT NOT NULL,
        kind TEXT NOT NULL CHECK (kind IN ('text', 'enum')),
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        deleted_at INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_tag_keys_pull ON tag_keys(organization_id, updated_at)",
    "CREATE TABLE IF NOT EXISTS tag_enum_options (
        id TEXT PRIMARY KEY,
        tag_key_id TEXT NOT NULL REFERENCES tag_keys(id),
        label TEXT NOT NULL,
        position INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        deleted_at INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_tag_enum_options_key ON tag_enum_options(tag_key_id, updated_at)",
    "CREATE TABLE IF NOT EXISTS ticket_tag_enum_values (
        id TEXT PRIMARY KEY,
        ticket_id TEXT NOT NULL REFERENCES tickets(id),
        tag_key_id TEXT NOT NULL REFERENCES tag_keys(id),
        enum_option_id TEXT NOT NULL REFERENCES tag_enum_options(id),
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        deleted_at INTEGER
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_ticket_tag_enum_values_live
        ON ticket_tag_enum_values(ticket_id, tag_key_id) WHERE deleted_at IS NULL",
    "CREATE INDEX IF NOT EXISTS idx_ticket_tag_enum_values_pull
        ON ticket_tag_enum_values(ticket_id, updated_at)",
    "CREATE INDEX IF NOT EXISTS idx_ticket_tag_enum_values_option
        ON ticket_tag_enum_values(enum_option_id)",
    "CREATE TABLE IF NOT EXISTS macro_chains (
        id TEXT PRIMARY KEY,
        organization_id TEXT NOT NULL REFERENCES organizations(id),
        name TEXT NOT NULL,
        actions TEXT NOT NULL DEFAULT '[]',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        deleted_at INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_macro_chains_pull ON macro_chains(organization_id, updated_at)",
    "INSERT INTO schema_version (version) VALUES (1)",
];

/// Run one migration's statements inside a transaction
async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> StoreResult<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated server store to version {version} (target {CURRENT_VERSION})");
    Ok(())
}
