//! Server queue documents and the operations players perform on them

pub mod service;
pub mod store;

pub use service::{JoinOutcome, QueueService};
pub use store::{ChangeKind, InMemoryQueueStore, QueueChange, QueueStore};
