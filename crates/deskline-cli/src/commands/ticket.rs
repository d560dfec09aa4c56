use std::path::Path;

use deskline_core::models::{Ticket, TicketId, TicketStatus};
use deskline_core::protocol::UpdateTicket;
use deskline_core::{Mutations, ReplicaService};

use crate::commands::common::{
    normalize_title, open_replica, resolve_organization, resolve_row, resolve_writer,
};
use crate::error::CliError;

pub struct TicketEdit {
    pub title: Option<String>,
    pub body: Option<String>,
    pub status: Option<TicketStatus>,
}

pub async fn run_ticket_create(
    title: &[String],
    org: Option<&str>,
    body: &str,
    user: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let replica = open_replica(db_path).await?;
    let id = create_ticket(&replica, user, org, title, body).await?;
    println!("{id}");
    Ok(())
}

pub async fn run_ticket_edit(
    id: &str,
    edit: TicketEdit,
    user: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let replica = open_replica(db_path).await?;
    let id = edit_ticket(&replica, user, id, edit).await?;
    println!("{id}");
    Ok(())
}

pub async fn run_ticket_delete(
    id: &str,
    user: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let replica = open_replica(db_path).await?;
    let id = delete_ticket(&replica, user, id).await?;
    println!("{id}");
    Ok(())
}

pub async fn create_ticket(
    replica: &ReplicaService,
    user: Option<&str>,
    org: Option<&str>,
    title: &[String],
    body: &str,
) -> Result<TicketId, CliError> {
    let title = normalize_title(title)?;
    let actor = resolve_writer(replica, user).await?;
    let organization_id = resolve_organization(replica, org).await?;

    let mutations = Mutations::new(replica.clone(), actor);
    Ok(mutations
        .create_ticket(organization_id, &title, body.trim())
        .await?)
}

pub async fn edit_ticket(
    replica: &ReplicaService,
    user: Option<&str>,
    query: &str,
    edit: TicketEdit,
) -> Result<TicketId, CliError> {
    let title = edit.title.map(|title| title.trim().to_string());
    if title.as_deref() == Some("") {
        return Err(CliError::EmptyTitle);
    }
    if title.is_none() && edit.body.is_none() && edit.status.is_none() {
        return Err(CliError::EmptyEdit);
    }

    let actor = resolve_writer(replica, user).await?;
    let ticket: Ticket = resolve_row(replica, query, "ticket").await?;

    Mutations::new(replica.clone(), actor)
        .update_ticket(UpdateTicket {
            id: ticket.id,
            title,
            body: edit.body,
            status: edit.status,
        })
        .await?;
    Ok(ticket.id)
}

pub async fn delete_ticket(
    replica: &ReplicaService,
    user: Option<&str>,
    query: &str,
) -> Result<TicketId, CliError> {
    let actor = resolve_writer(replica, user).await?;
    let ticket: Ticket = resolve_row(replica, query, "ticket").await?;

    Mutations::new(replica.clone(), actor)
        .delete_ticket(ticket.id)
        .await?;
    Ok(ticket.id)
}
