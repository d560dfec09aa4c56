use std::path::Path;
use std::time::Duration;

use deskline_core::config::ClientConfig;
use deskline_core::SyncState;

use crate::commands::common::{connect, open_replica, resolve_session_user};
use crate::error::CliError;

const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Keep a session open with realtime attached, reporting progress until
/// Ctrl-C or the optional deadline.
pub async fn run_watch(
    config: &ClientConfig,
    seconds: Option<u64>,
    user: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let replica = open_replica(db_path).await?;
    let user_id = resolve_session_user(&replica, user).await?;
    let session = connect(config, replica, &user_id, true).await?;

    let mut state = session.engine().subscribe_state();
    let mut ticker = tokio::time::interval(REPORT_INTERVAL);
    let deadline = async move {
        match seconds {
            Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let mut last_applied = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            () = &mut deadline => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                println!("sync: {}", state_label(current));
            }
            _ = ticker.tick() => {
                let applied = session.realtime().map_or(0, |realtime| realtime.events_applied());
                let connected = session.realtime().is_some_and(|realtime| realtime.is_connected());
                if applied != last_applied {
                    println!("realtime: {applied} change(s) applied");
                    last_applied = applied;
                } else if !connected {
                    println!("realtime: reconnecting");
                }
            }
        }
    }

    session.sign_out().await;
    println!("Stopped watching");
    Ok(())
}

pub const fn state_label(state: SyncState) -> &'static str {
    match state {
        SyncState::Offline => "offline",
        SyncState::Syncing => "syncing",
        SyncState::Synced => "synced",
        SyncState::Error => "error",
    }
}
