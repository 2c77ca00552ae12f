//! AMQP integration for the matchmaking service
//!
//! Commands arrive on a durable queue bound to the command exchange. Queue events,
//! team announcements and platform requests are published to topic exchanges.

pub mod connection;
pub mod handlers;
pub mod messages;
pub mod publisher;

// Re-export commonly used types
pub use connection::{AmqpConfig, AmqpConnection};
pub use handlers::{CommandConsumer, MessageHandler};
pub use messages::*;
pub use publisher::{AmqpEventPublisher, EventPublisher, MockEventPublisher, PublisherConfig};
