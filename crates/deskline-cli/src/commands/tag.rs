use std::path::Path;

use deskline_core::models::{
    TagEnumOption, TagEnumOptionId, TagKey, TagKeyId, TagKind, Ticket, TicketTagEnumValue,
    TicketTagEnumValueId,
};
use deskline_core::{Mutations, ReplicaService};

use crate::commands::common::{open_replica, resolve_organization, resolve_row, resolve_writer};
use crate::error::CliError;

pub async fn run_tag_key(
    name: &str,
    org: Option<&str>,
    kind: TagKind,
    user: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let replica = open_replica(db_path).await?;
    let id = create_key(&replica, user, org, name, kind).await?;
    println!("{id}");
    Ok(())
}

pub async fn run_tag_option(
    key: &str,
    label: &str,
    position: i64,
    user: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let replica = open_replica(db_path).await?;
    let id = create_option(&replica, user, key, label, position).await?;
    println!("{id}");
    Ok(())
}

pub async fn run_tag_set(
    ticket: &str,
    option: &str,
    user: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let replica = open_replica(db_path).await?;
    let id = set_value(&replica, user, ticket, option).await?;
    println!("{id}");
    Ok(())
}

pub async fn create_key(
    replica: &ReplicaService,
    user: Option<&str>,
    org: Option<&str>,
    name: &str,
    kind: TagKind,
) -> Result<TagKeyId, CliError> {
    let actor = resolve_writer(replica, user).await?;
    let organization_id = resolve_organization(replica, org).await?;

    Ok(Mutations::new(replica.clone(), actor)
        .create_tag_key(organization_id, name.trim(), kind)
        .await?)
}

pub async fn create_option(
    replica: &ReplicaService,
    user: Option<&str>,
    key: &str,
    label: &str,
    position: i64,
) -> Result<TagEnumOptionId, CliError> {
    let actor = resolve_writer(replica, user).await?;
    let key: TagKey = resolve_row(replica, key, "tag key").await?;

    Ok(Mutations::new(replica.clone(), actor)
        .create_tag_enum_option(key.id, label.trim(), position)
        .await?)
}

/// Select `option` on `ticket`, replacing the live value the ticket already
/// has for the option's key.
pub async fn set_value(
    replica: &ReplicaService,
    user: Option<&str>,
    ticket: &str,
    option: &str,
) -> Result<TicketTagEnumValueId, CliError> {
    let actor = resolve_writer(replica, user).await?;
    let ticket: Ticket = resolve_row(replica, ticket, "ticket").await?;
    let option: TagEnumOption = resolve_row(replica, option, "tag option").await?;
    let mutations = Mutations::new(replica.clone(), actor);

    let current = replica
        .list::<TicketTagEnumValue>(false)
        .await?
        .into_iter()
        .find(|value| value.ticket_id == ticket.id && value.tag_key_id == option.tag_key_id);

    if let Some(current) = current {
        if current.enum_option_id != option.id {
            mutations
                .change_ticket_enum_value(current.id, option.id)
                .await?;
        }
        return Ok(current.id);
    }

    Ok(mutations
        .set_ticket_enum_value(ticket.id, option.tag_key_id, option.id)
        .await?)
}
