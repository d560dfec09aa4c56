//! Local replica database layer

mod connection;
mod migrations;
mod outbox_repository;
mod replica_repository;

pub use connection::Database;
pub use outbox_repository::{LibSqlOutboxRepository, OutboxRepository};
pub use replica_repository::{LibSqlReplicaRepository, ReplicaRepository, RowOrigin};
