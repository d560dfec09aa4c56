use std::path::Path;

use deskline_core::config::ClientConfig;
use deskline_core::models::Table;
use deskline_core::sync::{PullReport, PullService, RoundOutcome};

use crate::commands::common::{connect, http_transport, open_replica, resolve_session_user};
use crate::error::CliError;

pub async fn run_sync(
    config: &ClientConfig,
    user: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let replica = open_replica(db_path).await?;
    let user_id = resolve_session_user(&replica, user).await?;
    let session = connect(config, replica, &user_id, false).await?;

    let outcome = session.engine().sync_now().await;
    let pending = session.replica().pending_count().await;
    session.sign_out().await;

    println!("{}", describe_outcome(outcome?));
    println!("{} operation(s) still pending", pending?);
    Ok(())
}

pub async fn run_pull(
    config: &ClientConfig,
    full: bool,
    user: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let replica = open_replica(db_path).await?;
    let user_id = resolve_session_user(&replica, user).await?;
    let pull = PullService::new(replica.clone(), http_transport(config)?);

    let switching = replica.user_id().await?.as_deref() != Some(user_id.as_str());
    let report = if full || switching {
        let dropped = replica.pending_count().await?;
        if dropped > 0 {
            tracing::warn!(dropped, "Discarding unsynced outbox before full pull");
        }
        replica.set_user_id(&user_id).await?;
        pull.full_resync().await?
    } else {
        pull.catch_up(&Table::ALL).await?
    };

    println!("{}", describe_pull(&report));
    Ok(())
}

pub fn describe_outcome(outcome: RoundOutcome) -> String {
    match outcome {
        RoundOutcome::Idle => "Nothing to sync".to_string(),
        RoundOutcome::Deferred { retry_in } | RoundOutcome::Failed { retry_in } => format!(
            "Server unreachable; will retry in {}s",
            retry_in.as_secs().max(1)
        ),
        RoundOutcome::Delivered { operations, rows } => {
            format!("Delivered {operations} operation(s); {rows} row(s) updated")
        }
    }
}

pub fn describe_pull(report: &PullReport) -> String {
    let watermarks = report
        .watermarks
        .iter()
        .map(|(table, watermark)| format!("{table}={watermark}"))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "Pulled {} row(s) in {} page(s); watermarks: {watermarks}",
        report.rows, report.pages
    )
}
