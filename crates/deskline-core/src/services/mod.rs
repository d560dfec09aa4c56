//! Client services layered over the local replica

mod mutations;
mod optimistic;
mod replica;

pub use mutations::Mutations;
pub use replica::ReplicaService;
