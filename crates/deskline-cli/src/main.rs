//! Deskline CLI - work with the local ticket replica from a terminal
//!
//! Writes land in the replica and its outbox immediately; `sync`, `pull` and
//! `watch` talk to the server when one is configured.

mod cli;
mod commands;
mod error;

use clap::Parser;
use deskline_core::config::ClientConfig;

use crate::cli::{Cli, Commands, OutboxCommands, TagCommands, TicketCommands};
use crate::commands::common::resolve_db_path;
use crate::commands::list::{run_list, TicketFilter};
use crate::commands::outbox::{run_outbox_discards, run_outbox_prune, run_outbox_status};
use crate::commands::sync::{run_pull, run_sync};
use crate::commands::tag::{run_tag_key, run_tag_option, run_tag_set};
use crate::commands::ticket::{run_ticket_create, run_ticket_delete, run_ticket_edit, TicketEdit};
use crate::commands::watch::run_watch;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "deskline=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ClientConfig::from_env()?;
    let db_path = resolve_db_path(cli.db_path, &config);
    let user = cli.user.as_deref();

    match cli.command {
        Commands::Ticket { command } => match command {
            TicketCommands::Create { title, org, body } => {
                run_ticket_create(&title, org.as_deref(), &body, user, &db_path).await?;
            }
            TicketCommands::Edit {
                id,
                title,
                body,
                status,
            } => {
                let edit = TicketEdit {
                    title,
                    body,
                    status,
                };
                run_ticket_edit(&id, edit, user, &db_path).await?;
            }
            TicketCommands::Delete { id } => run_ticket_delete(&id, user, &db_path).await?,
        },
        Commands::Tag { command } => match command {
            TagCommands::Key { name, org, kind } => {
                run_tag_key(&name, org.as_deref(), kind, user, &db_path).await?;
            }
            TagCommands::AddOption {
                key,
                label,
                position,
            } => run_tag_option(&key, &label, position, user, &db_path).await?,
            TagCommands::Set { ticket, option } => {
                run_tag_set(&ticket, &option, user, &db_path).await?;
            }
        },
        Commands::List {
            org,
            status,
            deleted,
            limit,
            json,
        } => {
            let filter = TicketFilter {
                organization: org.as_deref(),
                status,
                include_deleted: deleted,
                limit,
            };
            run_list(filter, json, &db_path).await?;
        }
        Commands::Sync => run_sync(&config, user, &db_path).await?,
        Commands::Pull { full } => run_pull(&config, full, user, &db_path).await?,
        Commands::Outbox { command } => match command {
            OutboxCommands::Status { json } => run_outbox_status(json, &db_path).await?,
            OutboxCommands::Discards { limit, json } => {
                run_outbox_discards(limit, json, &db_path).await?;
            }
            OutboxCommands::Prune { older_than_days } => {
                run_outbox_prune(older_than_days, &db_path).await?;
            }
        },
        Commands::Watch { seconds } => run_watch(&config, seconds, user, &db_path).await?,
    }

    Ok(())
}
