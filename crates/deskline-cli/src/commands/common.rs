use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use deskline_core::config::ClientConfig;
use deskline_core::models::{Organization, OrganizationId, Ticket};
use deskline_core::sync::{ChangeSource, HttpSyncTransport, SseChangeSource, SyncTransport};
use deskline_core::{ReplicaService, Session, SyncRow};
use serde::Serialize;

use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct TicketListItem {
    pub id: String,
    pub organization_id: String,
    pub title: String,
    pub status: String,
    pub created_by: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub relative_time: String,
    pub deleted: bool,
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>, config: &ClientConfig) -> PathBuf {
    cli_db_path
        .or_else(|| config.db_path.clone())
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("deskline")
        .join("deskline.db")
}

pub async fn open_replica(path: &Path) -> Result<ReplicaService, CliError> {
    Ok(ReplicaService::open_path(path.to_path_buf()).await?)
}

pub fn normalize_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyId)
    } else {
        Ok(trimmed.to_string())
    }
}

pub fn normalize_title(words: &[String]) -> Result<String, CliError> {
    let title = words.join(" ").trim().to_string();
    if title.is_empty() {
        Err(CliError::EmptyTitle)
    } else {
        Ok(title)
    }
}

/// Identity for local writes.
///
/// A replica that has never been bound to a user adopts `explicit`. Writing
/// under a different identity than the replica's is refused, since the next
/// sync would discard those writes.
pub async fn resolve_writer(
    replica: &ReplicaService,
    explicit: Option<&str>,
) -> Result<String, CliError> {
    let stored = replica.user_id().await?;
    match (stored, explicit.map(str::trim).filter(|user| !user.is_empty())) {
        (Some(stored), None) => Ok(stored),
        (Some(stored), Some(user)) if stored == user => Ok(stored),
        (Some(_), Some(user)) => Err(CliError::IdentityMismatch(user.to_string())),
        (None, Some(user)) => {
            replica.set_user_id(user).await?;
            Ok(user.to_string())
        }
        (None, None) => Err(CliError::UnknownUser),
    }
}

/// Identity for talking to the server. Switching users is allowed here; the
/// session rebuilds the replica.
pub async fn resolve_session_user(
    replica: &ReplicaService,
    explicit: Option<&str>,
) -> Result<String, CliError> {
    if let Some(user) = explicit.map(str::trim).filter(|user| !user.is_empty()) {
        return Ok(user.to_string());
    }
    replica.user_id().await?.ok_or(CliError::UnknownUser)
}

/// Find a live row by full id or unique id prefix.
pub async fn resolve_row<T: SyncRow>(
    replica: &ReplicaService,
    query: &str,
    kind: &'static str,
) -> Result<T, CliError> {
    let query = normalize_identifier(query)?;
    let not_found = || CliError::NotFound {
        kind,
        query: query.clone(),
    };

    let matching: Vec<T> = replica
        .list::<T>(false)
        .await?
        .into_iter()
        .filter(|row| row.row_id().to_string().starts_with(&query))
        .collect();

    match matching.len() {
        0 => Err(not_found()),
        1 => matching.into_iter().next().ok_or_else(not_found),
        _ => {
            let exact = matching
                .iter()
                .find(|row| row.row_id().to_string() == query)
                .cloned();
            if let Some(row) = exact {
                return Ok(row);
            }
            let options = matching
                .iter()
                .take(3)
                .map(|row| short_id(&row.row_id().to_string()))
                .collect::<Vec<_>>()
                .join(", ");
            Err(CliError::AmbiguousId(format!(
                "ID prefix '{query}' is ambiguous; matches: {options}"
            )))
        }
    }
}

/// Organization for a new row: the explicit one, or the only one the
/// replica knows about.
pub async fn resolve_organization(
    replica: &ReplicaService,
    explicit: Option<&str>,
) -> Result<OrganizationId, CliError> {
    if let Some(query) = explicit {
        let organization: Organization = resolve_row(replica, query, "organization").await?;
        return Ok(organization.id);
    }

    let organizations = replica.list::<Organization>(false).await?;
    match organizations.as_slice() {
        [only] => Ok(only.id),
        [] => Err(CliError::Organization(
            "No organizations in the replica yet. Run `deskline pull` first.".to_string(),
        )),
        _ => Err(CliError::Organization(format!(
            "The replica holds {} organizations; pass --org <ORG_ID>",
            organizations.len()
        ))),
    }
}

pub fn require_sync(config: &ClientConfig) -> Result<(String, String), CliError> {
    match (config.api_url.as_deref(), config.access_token.as_deref()) {
        (Some(url), Some(token)) => Ok((url.to_string(), token.to_string())),
        _ => Err(CliError::SyncNotConfigured),
    }
}

pub fn http_transport(config: &ClientConfig) -> Result<Arc<dyn SyncTransport>, CliError> {
    let (url, token) = require_sync(config)?;
    Ok(Arc::new(HttpSyncTransport::new(url, token)?))
}

/// Sign in against the configured server, optionally following realtime.
pub async fn connect(
    config: &ClientConfig,
    replica: ReplicaService,
    user_id: &str,
    realtime: bool,
) -> Result<Session, CliError> {
    let transport = http_transport(config)?;
    let changes: Option<Arc<dyn ChangeSource>> = if realtime {
        let (url, token) = require_sync(config)?;
        Some(Arc::new(SseChangeSource::new(url, token)?))
    } else {
        None
    };

    Ok(Session::sign_in(replica, user_id, transport, changes, config.engine_config()).await?)
}

pub fn short_id(id: &str) -> String {
    id.chars().take(13).collect()
}

pub fn format_ticket_lines(tickets: &[Ticket]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    tickets
        .iter()
        .map(|ticket| {
            let short_id = short_id(&ticket.id.to_string());
            let title = preview(&ticket.title, 40);
            let status = ticket.status.as_str();
            let relative_time = format_relative_time(ticket.updated_at, now_ms);
            if ticket.is_deleted() {
                format!("{short_id:<13}  {status:<8}  {title:<40}  {relative_time:<10}  (deleted)")
            } else {
                format!("{short_id:<13}  {status:<8}  {title:<40}  {relative_time}")
            }
        })
        .collect()
}

pub fn ticket_to_list_item(ticket: &Ticket) -> TicketListItem {
    let now_ms = Utc::now().timestamp_millis();
    TicketListItem {
        id: ticket.id.to_string(),
        organization_id: ticket.organization_id.to_string(),
        title: ticket.title.clone(),
        status: ticket.status.to_string(),
        created_by: ticket.created_by.clone(),
        created_at: ticket.created_at,
        updated_at: ticket.updated_at,
        relative_time: format_relative_time(ticket.updated_at, now_ms),
        deleted: ticket.is_deleted(),
    }
}

pub fn preview(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = collapsed.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}
