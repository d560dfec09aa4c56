//! Convenience constructors for local writes.
//!
//! Each helper builds an operation with a fresh client-side id where needed,
//! applies it to the replica, enqueues it, and nudges the sync engine.

use std::sync::Arc;

use tokio::sync::Notify;

use super::ReplicaService;
use crate::models::{
    MacroChainId, MutationRecord, OrganizationId, TagEnumOptionId, TagKeyId, TagKind, TicketId,
    TicketStatus, TicketTagEnumValueId,
};
use crate::protocol::{
    CreateMacroChain, CreateTagEnumOption, CreateTagKey, CreateTicket, CreateTicketTagEnumValue,
    DeleteRow, Operation, UpdateMacroChain, UpdateOrganization, UpdateTagEnumOption, UpdateTagKey,
    UpdateTicket, UpdateTicketTagEnumValue,
};
use crate::Result;

/// Local write API for one signed-in user
#[derive(Clone)]
pub struct Mutations {
    replica: ReplicaService,
    actor: String,
    sync_trigger: Option<Arc<Notify>>,
}

impl Mutations {
    pub fn new(replica: ReplicaService, actor: impl Into<String>) -> Self {
        Self {
            replica,
            actor: actor.into(),
            sync_trigger: None,
        }
    }

    /// Wake the sync engine after every enqueue
    #[must_use]
    pub fn with_sync_trigger(mut self, trigger: Arc<Notify>) -> Self {
        self.sync_trigger = Some(trigger);
        self
    }

    /// Apply and enqueue an arbitrary operation
    pub async fn issue(&self, operation: Operation) -> Result<MutationRecord> {
        let record = self.replica.apply_local(operation, &self.actor).await?;
        if let Some(trigger) = &self.sync_trigger {
            trigger.notify_one();
        }
        Ok(record)
    }

    pub async fn rename_organization(&self, id: OrganizationId, name: &str) -> Result<()> {
        self.issue(Operation::UpdateOrganization(UpdateOrganization {
            id,
            name: name.to_string(),
        }))
        .await?;
        Ok(())
    }

    pub async fn create_ticket(
        &self,
        organization_id: OrganizationId,
        title: &str,
        body: &str,
    ) -> Result<TicketId> {
        let id = TicketId::new();
        self.issue(Operation::CreateTicket(CreateTicket {
            id,
            organization_id,
            title: title.to_string(),
            body: body.to_string(),
            status: TicketStatus::Open,
        }))
        .await?;
        Ok(id)
    }

    pub async fn update_ticket(&self, update: UpdateTicket) -> Result<()> {
        self.issue(Operation::UpdateTicket(update)).await?;
        Ok(())
    }

    pub async fn delete_ticket(&self, id: TicketId) -> Result<()> {
        self.issue(Operation::DeleteTicket(DeleteRow { id })).await?;
        Ok(())
    }

    pub async fn create_tag_key(
        &self,
        organization_id: OrganizationId,
        name: &str,
        kind: TagKind,
    ) -> Result<TagKeyId> {
        let id = TagKeyId::new();
        self.issue(Operation::CreateTagKey(CreateTagKey {
            id,
            organization_id,
            name: name.to_string(),
            kind,
        }))
        .await?;
        Ok(id)
    }

    pub async fn rename_tag_key(&self, id: TagKeyId, name: &str) -> Result<()> {
        self.issue(Operation::UpdateTagKey(UpdateTagKey {
            id,
            name: name.to_string(),
        }))
        .await?;
        Ok(())
    }

    pub async fn delete_tag_key(&self, id: TagKeyId) -> Result<()> {
        self.issue(Operation::DeleteTagKey(DeleteRow { id })).await?;
        Ok(())
    }

    pub async fn create_tag_enum_option(
        &self,
        tag_key_id: TagKeyId,
        label: &str,
        position: i64,
    ) -> Result<TagEnumOptionId> {
        let id = TagEnumOptionId::new();
        self.issue(Operation::CreateTagEnumOption(CreateTagEnumOption {
            id,
            tag_key_id,
            label: label.to_string(),
            position,
        }))
        .await?;
        Ok(id)
    }

    pub async fn update_tag_enum_option(&self, update: UpdateTagEnumOption) -> Result<()> {
        self.issue(Operation::UpdateTagEnumOption(update)).await?;
        Ok(())
    }

    pub async fn delete_tag_enum_option(&self, id: TagEnumOptionId) -> Result<()> {
        self.issue(Operation::DeleteTagEnumOption(DeleteRow { id }))
            .await?;
        Ok(())
    }

    pub async fn set_ticket_enum_value(
        &self,
        ticket_id: TicketId,
        tag_key_id: TagKeyId,
        enum_option_id: TagEnumOptionId,
    ) -> Result<TicketTagEnumValueId> {
        let id = TicketTagEnumValueId::new();
        self.issue(Operation::CreateTicketTagEnumValue(
            CreateTicketTagEnumValue {
                id,
                ticket_id,
                tag_key_id,
                enum_option_id,
            },
        ))
        .await?;
        Ok(id)
    }

    pub async fn change_ticket_enum_value(
        &self,
        id: TicketTagEnumValueId,
        enum_option_id: TagEnumOptionId,
    ) -> Result<()> {
        self.issue(Operation::UpdateTicketTagEnumValue(
            UpdateTicketTagEnumValue { id, enum_option_id },
        ))
        .await?;
        Ok(())
    }

    pub async fn clear_ticket_enum_value(&self, id: TicketTagEnumValueId) -> Result<()> {
        self.issue(Operation::DeleteTicketTagEnumValue(DeleteRow { id }))
            .await?;
        Ok(())
    }

    pub async fn create_macro_chain(
        &self,
        organization_id: OrganizationId,
        name: &str,
        actions: Vec<String>,
    ) -> Result<MacroChainId> {
        let id = MacroChainId::new();
        self.issue(Operation::CreateMacroChain(CreateMacroChain {
            id,
            organization_id,
            name: name.to_string(),
            actions,
        }))
        .await?;
        Ok(id)
    }

    pub async fn update_macro_chain(&self, update: UpdateMacroChain) -> Result<()> {
        self.issue(Operation::UpdateMacroChain(update)).await?;
        Ok(())
    }

    pub async fn delete_macro_chain(&self, id: MacroChainId) -> Result<()> {
        self.issue(Operation::DeleteMacroChain(DeleteRow { id }))
            .await?;
        Ok(())
    }
}
