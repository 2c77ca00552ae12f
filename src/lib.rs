//! Huddle - team matchmaking for voice-chat servers
//!
//! Players queue for 2v2, 3v3 and 4v4 from a voice lobby. Queues are split into
//! skill brackets, full teams are formed per bracket, and short-handed teams wait
//! for a late joiner before being promoted to the next team size. Commands and
//! events travel over AMQP.

pub mod amqp;
pub mod bracket;
pub mod config;
pub mod error;
pub mod matchmaking;
pub mod metrics;
pub mod platform;
pub mod queue;
pub mod service;
pub mod types;
pub mod utils;

// Re-export commonly used types and traits
pub use error::{MatchmakingError, Result};
pub use types::*;

// Re-export key components
pub use amqp::publisher::EventPublisher;
pub use bracket::{BracketClassifier, BracketConfig};
pub use matchmaking::{MatchmakingEngine, PassCoordinator, PassReport};
pub use queue::{InMemoryQueueStore, QueueService, QueueStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
