use std::io;

use deskline_core::config::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] deskline_core::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Ticket title cannot be empty")]
    EmptyTitle,
    #[error("ID cannot be empty")]
    EmptyId,
    #[error("Nothing to change; pass --title, --body or --status")]
    EmptyEdit,
    #[error("No {kind} found for id/prefix: {query}")]
    NotFound { kind: &'static str, query: String },
    #[error("{0}")]
    AmbiguousId(String),
    #[error("{0}")]
    Organization(String),
    #[error("No user is associated with this replica. Pass --user <USER_ID>.")]
    UnknownUser,
    #[error(
        "This replica belongs to another user. Run `deskline --user {0} pull` to switch identities first."
    )]
    IdentityMismatch(String),
    #[error(
        "Sync is not configured. Set DESKLINE_API_URL and DESKLINE_ACCESS_TOKEN to talk to a server."
    )]
    SyncNotConfigured,
}
