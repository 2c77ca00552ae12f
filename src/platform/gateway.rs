//! Voice platform access over AMQP
//!
//! The platform bot owns the actual chat-platform connection. This gateway turns
//! channel and move operations into [`PlatformRequest`] events and tracks the
//! expected result in the presence registry.

use crate::amqp::publisher::EventPublisher;
use crate::error::Result;
use crate::platform::{ChannelProvisioner, MemberMover, MoveOutcome, PresenceRegistry};
use crate::types::{ChannelRef, PlatformRequest, Team};
use crate::utils;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

pub struct EventVoiceGateway {
    publisher: Arc<dyn EventPublisher>,
    presence: Arc<PresenceRegistry>,
}

impl EventVoiceGateway {
    pub fn new(publisher: Arc<dyn EventPublisher>, presence: Arc<PresenceRegistry>) -> Self {
        Self {
            publisher,
            presence,
        }
    }
}

#[async_trait]
impl ChannelProvisioner for EventVoiceGateway {
    async fn create_team_channel(
        &self,
        server_id: &str,
        category_id: &str,
        team: &Team,
    ) -> Result<ChannelRef> {
        let channel = ChannelRef {
            id: utils::generate_channel_id(),
            name: team.channel_name(),
            user_limit: team.size(),
        };

        self.publisher
            .publish_platform_request(PlatformRequest::CreateTeamChannel {
                server_id: server_id.to_string(),
                category_id: category_id.to_string(),
                channel: channel.clone(),
                members: team.players.iter().map(|p| p.user_id.clone()).collect(),
            })
            .await?;

        self.presence.register_team_channel(server_id, &channel.id)?;
        info!(
            "Requested channel {} ({}) for team {} in server {}",
            channel.name, channel.id, team.id, server_id
        );
        Ok(channel)
    }

    async fn delete_channel(&self, server_id: &str, channel_id: &str) -> Result<()> {
        self.publisher
            .publish_platform_request(PlatformRequest::DeleteChannel {
                server_id: server_id.to_string(),
                channel_id: channel_id.to_string(),
            })
            .await?;

        self.presence.forget_team_channel(server_id, channel_id)?;
        info!("Requested deletion of channel {} in server {}", channel_id, server_id);
        Ok(())
    }
}

#[async_trait]
impl MemberMover for EventVoiceGateway {
    async fn move_member(
        &self,
        server_id: &str,
        channel: &ChannelRef,
        user_id: &str,
    ) -> Result<MoveOutcome> {
        if !self.presence.is_connected(server_id, user_id)? {
            debug!("{} is not in voice, not moving", user_id);
            return Ok(MoveOutcome::NotConnected);
        }

        self.publisher
            .publish_platform_request(PlatformRequest::MoveMember {
                server_id: server_id.to_string(),
                channel_id: channel.id.clone(),
                user_id: user_id.to_string(),
            })
            .await?;

        self.presence.record_move(server_id, user_id, &channel.id)?;
        Ok(MoveOutcome::Moved)
    }
}
