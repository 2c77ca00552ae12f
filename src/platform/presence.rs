//! Guild membership and voice presence tracking
//!
//! The platform bot reports voice-state and membership changes over AMQP. This
//! registry keeps the latest picture so the matchmaker can check availability and
//! the gateway can tell connected members from disconnected ones.
//!
//! Users are presumed to be members until the platform reports them gone.

use crate::error::{MatchmakingError, Result};
use crate::platform::MemberDirectory;
use crate::types::{ServerId, UserId, VoiceStateUpdate};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tracing::debug;

/// What a voice-state update meant for the queues and team channels
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoiceTransition {
    /// The user left voice entirely
    pub disconnected: bool,
    /// A team channel the user left that now has nobody in it
    pub vacated_team_channel: Option<String>,
}

#[derive(Debug, Default)]
struct PresenceState {
    /// Users the platform reported as having left the server
    departed: HashMap<ServerId, HashSet<UserId>>,
    /// Connected users; `None` when connected to a channel not yet reported
    voice: HashMap<ServerId, HashMap<UserId, Option<String>>>,
    team_channels: HashMap<ServerId, HashSet<String>>,
}

impl PresenceState {
    fn occupancy(&self, server_id: &str, channel_id: &str) -> usize {
        self.voice
            .get(server_id)
            .map(|users| {
                users
                    .values()
                    .filter(|c| c.as_deref() == Some(channel_id))
                    .count()
            })
            .unwrap_or(0)
    }

    fn rejoin(&mut self, server_id: &str, user_id: &str) {
        if let Some(departed) = self.departed.get_mut(server_id) {
            departed.remove(user_id);
        }
    }
}

/// Latest known membership and voice state per server
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    state: RwLock<PresenceState>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, PresenceState>> {
        self.state.read().map_err(|_| {
            MatchmakingError::InternalError {
                message: "Failed to acquire presence read lock".to_string(),
            }
            .into()
        })
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, PresenceState>> {
        self.state.write().map_err(|_| {
            MatchmakingError::InternalError {
                message: "Failed to acquire presence write lock".to_string(),
            }
            .into()
        })
    }

    /// Record a user joining or leaving a server
    pub fn set_member(&self, server_id: &str, user_id: &str, present: bool) -> Result<()> {
        let mut state = self.write()?;
        if present {
            state.rejoin(server_id, user_id);
        } else {
            state
                .departed
                .entry(server_id.to_string())
                .or_default()
                .insert(user_id.to_string());
            if let Some(voice) = state.voice.get_mut(server_id) {
                voice.remove(user_id);
            }
        }
        Ok(())
    }

    /// Record a user the join request reports as connected to voice.
    ///
    /// A channel already known from a voice-state update is kept.
    pub fn mark_connected(&self, server_id: &str, user_id: &str) -> Result<()> {
        let mut state = self.write()?;
        state.rejoin(server_id, user_id);
        state
            .voice
            .entry(server_id.to_string())
            .or_default()
            .entry(user_id.to_string())
            .or_insert(None);
        Ok(())
    }

    /// Apply a voice-state change and report what it means for the service
    pub fn apply_voice_update(&self, update: &VoiceStateUpdate) -> Result<VoiceTransition> {
        let mut state = self.write()?;
        let server_id = update.server_id.as_str();

        // Anyone with a voice state is a member of the server
        state.rejoin(server_id, &update.user_id);

        let voice = state.voice.entry(server_id.to_string()).or_default();
        let previous = match &update.channel_id {
            Some(channel_id) => voice.insert(update.user_id.clone(), Some(channel_id.clone())),
            None => voice.remove(&update.user_id),
        }
        .flatten()
        .or_else(|| update.previous_channel_id.clone());

        let left_channel = previous.filter(|old| update.channel_id.as_deref() != Some(old));

        let vacated_team_channel = left_channel.filter(|channel_id| {
            let is_team_channel = state
                .team_channels
                .get(server_id)
                .is_some_and(|channels| channels.contains(channel_id));
            is_team_channel && state.occupancy(server_id, channel_id) == 0
        });

        let transition = VoiceTransition {
            disconnected: update.channel_id.is_none(),
            vacated_team_channel,
        };
        debug!(
            "Voice update for {} in {}: {:?}",
            update.user_id, server_id, transition
        );
        Ok(transition)
    }

    /// Voice channel the user is known to be in, if any
    pub fn voice_channel_of(&self, server_id: &str, user_id: &str) -> Result<Option<String>> {
        let state = self.read()?;
        Ok(state
            .voice
            .get(server_id)
            .and_then(|users| users.get(user_id))
            .cloned()
            .flatten())
    }

    pub fn is_connected(&self, server_id: &str, user_id: &str) -> Result<bool> {
        let state = self.read()?;
        Ok(state
            .voice
            .get(server_id)
            .is_some_and(|users| users.contains_key(user_id)))
    }

    /// Record that a member was moved into a channel
    pub fn record_move(&self, server_id: &str, user_id: &str, channel_id: &str) -> Result<()> {
        let mut state = self.write()?;
        state
            .voice
            .entry(server_id.to_string())
            .or_default()
            .insert(user_id.to_string(), Some(channel_id.to_string()));
        Ok(())
    }

    pub fn register_team_channel(&self, server_id: &str, channel_id: &str) -> Result<()> {
        let mut state = self.write()?;
        state
            .team_channels
            .entry(server_id.to_string())
            .or_default()
            .insert(channel_id.to_string());
        Ok(())
    }

    pub fn forget_team_channel(&self, server_id: &str, channel_id: &str) -> Result<()> {
        let mut state = self.write()?;
        if let Some(channels) = state.team_channels.get_mut(server_id) {
            channels.remove(channel_id);
        }
        Ok(())
    }

    pub fn team_channel_count(&self) -> Result<usize> {
        let state = self.read()?;
        Ok(state.team_channels.values().map(HashSet::len).sum())
    }
}

#[async_trait]
impl MemberDirectory for PresenceRegistry {
    async fn is_member(&self, server_id: &str, user_id: &str) -> Result<bool> {
        let state = self.read()?;
        Ok(!state
            .departed
            .get(server_id)
            .is_some_and(|departed| departed.contains(user_id)))
    }
}
