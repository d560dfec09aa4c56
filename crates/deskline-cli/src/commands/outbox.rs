use std::path::Path;

use chrono::{Duration, Utc};
use deskline_core::models::StaleDiscard;
use serde::Serialize;

use crate::commands::common::{format_timestamp, open_replica};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct StaleDiscardItem {
    pub table: String,
    pub row_id: String,
    pub local_updated_at: i64,
    pub incoming_updated_at: i64,
    pub discarded_at: i64,
    pub discarded_at_iso: String,
}

pub async fn run_outbox_status(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let replica = open_replica(db_path).await?;
    let pending = replica.pending_count().await?;
    let user = replica.user_id().await?;

    if as_json {
        let status = serde_json::json!({ "pending": pending, "user_id": user });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("{pending} operation(s) pending");
        if let Some(user) = user {
            println!("replica user: {user}");
        }
    }
    Ok(())
}

pub async fn run_outbox_discards(
    limit: usize,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let replica = open_replica(db_path).await?;
    let discards = replica.list_stale_discards(limit).await?;

    if as_json {
        let json_items = discards
            .iter()
            .map(stale_discard_to_item)
            .collect::<Vec<StaleDiscardItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if discards.is_empty() {
        println!("No stale rows discarded.");
        return Ok(());
    }

    for line in format_stale_discard_lines(&discards) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_outbox_prune(older_than_days: u32, db_path: &Path) -> Result<(), CliError> {
    let replica = open_replica(db_path).await?;
    let cutoff = Utc::now() - Duration::days(i64::from(older_than_days));
    let removed = replica.prune_synced(cutoff.timestamp_millis()).await?;
    println!("Removed {removed} delivered record(s)");
    Ok(())
}

pub fn stale_discard_to_item(discard: &StaleDiscard) -> StaleDiscardItem {
    StaleDiscardItem {
        table: discard.table_name.clone(),
        row_id: discard.row_id.clone(),
        local_updated_at: discard.local_updated_at,
        incoming_updated_at: discard.incoming_updated_at,
        discarded_at: discard.discarded_at,
        discarded_at_iso: format_timestamp(discard.discarded_at),
    }
}

pub fn format_stale_discard_lines(discards: &[StaleDiscard]) -> Vec<String> {
    discards
        .iter()
        .map(|discard| {
            format!(
                "{}  {} row={} local={} incoming={}",
                format_timestamp(discard.discarded_at),
                discard.table_name,
                discard.row_id,
                discard.local_updated_at,
                discard.incoming_updated_at,
            )
        })
        .collect()
}
