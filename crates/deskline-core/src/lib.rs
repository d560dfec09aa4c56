//! deskline-core - Core library for Deskline
//!
//! This crate contains the shared data model and operation protocol, plus the
//! client half of the sync engine: the local replica, the mutation outbox,
//! outbox delivery, incremental pull and the realtime change channel. The
//! server and CLI both build on it.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod protocol;
pub mod services;
pub mod session;
pub mod state;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{AnyRow, SyncRow, Table};
pub use protocol::Operation;
pub use services::{Mutations, ReplicaService};
pub use session::Session;
pub use state::SyncState;
