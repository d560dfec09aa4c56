pub mod common;
pub mod list;
pub mod outbox;
pub mod sync;
pub mod tag;
pub mod ticket;
pub mod watch;
