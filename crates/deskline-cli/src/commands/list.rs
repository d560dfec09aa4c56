use std::path::Path;

use deskline_core::models::{Organization, Ticket, TicketStatus};
use deskline_core::ReplicaService;

use crate::commands::common::{
    format_ticket_lines, open_replica, resolve_row, ticket_to_list_item, TicketListItem,
};
use crate::error::CliError;

#[derive(Debug, Clone, Default)]
pub struct TicketFilter<'a> {
    pub organization: Option<&'a str>,
    pub status: Option<TicketStatus>,
    pub include_deleted: bool,
    pub limit: usize,
}

pub async fn run_list(
    filter: TicketFilter<'_>,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let replica = open_replica(db_path).await?;
    let tickets = list_tickets(&replica, &filter).await?;

    if as_json {
        let json_items = tickets
            .iter()
            .map(ticket_to_list_item)
            .collect::<Vec<TicketListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
    } else if tickets.is_empty() {
        println!("No tickets.");
    } else {
        for line in format_ticket_lines(&tickets) {
            println!("{line}");
        }
    }

    Ok(())
}

/// Tickets matching `filter`, most recently changed first.
pub async fn list_tickets(
    replica: &ReplicaService,
    filter: &TicketFilter<'_>,
) -> Result<Vec<Ticket>, CliError> {
    let organization_id = match filter.organization {
        Some(query) => {
            let organization: Organization =
                resolve_row(replica, query, "organization").await?;
            Some(organization.id)
        }
        None => None,
    };

    let mut tickets: Vec<Ticket> = replica
        .list::<Ticket>(filter.include_deleted)
        .await?
        .into_iter()
        .filter(|ticket| organization_id.is_none_or(|id| ticket.organization_id == id))
        .filter(|ticket| filter.status.is_none_or(|status| ticket.status == status))
        .collect();

    tickets.sort_by(|left, right| right.updated_at.cmp(&left.updated_at));
    tickets.truncate(filter.limit);
    Ok(tickets)
}
