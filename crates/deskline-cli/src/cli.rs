use std::path::PathBuf;

use clap::{Parser, Subcommand};
use deskline_core::models::{TagKind, TicketStatus};

#[derive(Parser)]
#[command(name = "deskline")]
#[command(about = "Work with a Deskline ticket replica from the command line")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local replica file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// User id the replica belongs to (remembered after first use)
    #[arg(long, global = true, value_name = "USER_ID")]
    pub user: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create, edit or delete tickets
    Ticket {
        #[command(subcommand)]
        command: TicketCommands,
    },
    /// Define tags and set them on tickets
    Tag {
        #[command(subcommand)]
        command: TagCommands,
    },
    /// List tickets in the local replica
    List {
        /// Only tickets of this organization
        #[arg(long, value_name = "ORG_ID")]
        org: Option<String>,
        /// Only tickets in this status
        #[arg(long)]
        status: Option<TicketStatus>,
        /// Include tombstoned tickets
        #[arg(long)]
        deleted: bool,
        /// Number of tickets to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Deliver pending operations to the server
    Sync,
    /// Pull changed rows from the server
    Pull {
        /// Drop the replica and outbox, then pull everything again
        #[arg(long)]
        full: bool,
    },
    /// Inspect the local outbox
    Outbox {
        #[command(subcommand)]
        command: OutboxCommands,
    },
    /// Follow the realtime change channel
    Watch {
        /// Stop after this many seconds (runs until Ctrl-C when omitted)
        #[arg(long, value_name = "SECS")]
        seconds: Option<u64>,
    },
}

#[derive(Subcommand)]
pub enum TicketCommands {
    /// Create a ticket
    #[command(alias = "new")]
    Create {
        /// Ticket title
        title: Vec<String>,
        /// Organization id (optional when the replica holds one organization)
        #[arg(long, value_name = "ORG_ID")]
        org: Option<String>,
        /// Ticket body
        #[arg(long, default_value = "")]
        body: String,
    },
    /// Change fields of an existing ticket
    Edit {
        /// Ticket ID or unique ID prefix
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        body: Option<String>,
        #[arg(long)]
        status: Option<TicketStatus>,
    },
    /// Delete a ticket
    Delete {
        /// Ticket ID or unique ID prefix
        id: String,
    },
}

#[derive(Subcommand)]
pub enum TagCommands {
    /// Create a tag key
    Key {
        /// Tag key name
        name: String,
        /// Organization id (optional when the replica holds one organization)
        #[arg(long, value_name = "ORG_ID")]
        org: Option<String>,
        #[arg(long, default_value = "enum")]
        kind: TagKind,
    },
    /// Add an option to an enum tag key
    #[command(name = "option")]
    AddOption {
        /// Tag key ID or unique ID prefix
        key: String,
        /// Option label
        label: String,
        /// Sort position among the key's options
        #[arg(long, default_value = "0")]
        position: i64,
    },
    /// Select an option of a tag key on a ticket
    Set {
        /// Ticket ID or unique ID prefix
        ticket: String,
        /// Tag enum option ID or unique ID prefix
        option: String,
    },
}

#[derive(Subcommand)]
pub enum OutboxCommands {
    /// Show how many operations are waiting for delivery
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List incoming rows discarded because the replica held a newer copy
    Discards {
        /// Number of discards to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove delivered records older than the given age
    Prune {
        #[arg(long, default_value = "7", value_name = "DAYS")]
        older_than_days: u32,
    },
}
