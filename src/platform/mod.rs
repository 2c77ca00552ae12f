//! Voice platform collaborators
//!
//! The matchmaker never talks to the chat platform directly. Team channels, member
//! moves and guild membership are reached through the traits defined here, with an
//! AMQP-backed gateway for production and an in-process mock for tests.

pub mod gateway;
pub mod mock;
pub mod presence;

use crate::error::Result;
use crate::types::{ChannelRef, Team};
use async_trait::async_trait;

pub use gateway::EventVoiceGateway;
pub use mock::MockVoicePlatform;
pub use presence::{PresenceRegistry, VoiceTransition};

/// Result of asking the platform to move a member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Moved,
    /// The member is not in any voice channel, so was left alone
    NotConnected,
}

/// Creates and removes voice channels for teams
#[async_trait]
pub trait ChannelProvisioner: Send + Sync {
    /// Create a voice channel sized to the team under the given category
    async fn create_team_channel(
        &self,
        server_id: &str,
        category_id: &str,
        team: &Team,
    ) -> Result<ChannelRef>;

    /// Delete a channel previously created for a team
    async fn delete_channel(&self, server_id: &str, channel_id: &str) -> Result<()>;
}

/// Moves connected members into a team channel
#[async_trait]
pub trait MemberMover: Send + Sync {
    async fn move_member(
        &self,
        server_id: &str,
        channel: &ChannelRef,
        user_id: &str,
    ) -> Result<MoveOutcome>;
}

/// Answers whether a user is still part of a server
#[async_trait]
pub trait MemberDirectory: Send + Sync {
    async fn is_member(&self, server_id: &str, user_id: &str) -> Result<bool>;
}
