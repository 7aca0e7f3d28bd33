//! Storage node: local blob store plus the peer data plane

pub mod server;
pub mod store;

pub use server::{NodeServer, RunningNode};
pub use store::FileStore;
