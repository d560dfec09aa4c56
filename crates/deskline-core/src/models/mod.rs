//! Data models for Deskline

mod ids;
mod macro_chain;
mod mutation;
mod organization;
mod role;
mod row;
mod stale_discard;
mod tag;
mod ticket;

pub use ids::{
    MacroChainId, OrganizationId, TagEnumOptionId, TagKeyId, TicketId, TicketTagEnumValueId,
};
pub use macro_chain::MacroChain;
pub use mutation::MutationRecord;
pub use organization::Organization;
pub use role::{Memberships, Role};
pub use row::{AnyRow, RowHeader, SyncRow, Table};
pub use stale_discard::StaleDiscard;
pub use tag::{TagEnumOption, TagKey, TagKind, TicketTagEnumValue};
pub use ticket::{Ticket, TicketStatus};
