//! Wire protocol shared by the client outbox and the sync server

mod messages;
mod operation;

pub use messages::{
    ChangeEvent, PullRequest, PullResponse, SyncRequest, SyncResponse, TableRows, SYNC_BATCH_LIMIT,
};
pub use operation::{
    CreateMacroChain, CreateTagEnumOption, CreateTagKey, CreateTicket, CreateTicketTagEnumValue,
    DeleteRow, Operation, UpdateMacroChain, UpdateOrganization, UpdateTagEnumOption, UpdateTagKey,
    UpdateTicket, UpdateTicketTagEnumValue, ValidationError, MAX_BODY_CHARS, MAX_MACRO_ACTIONS,
    MAX_NAME_CHARS,
};
