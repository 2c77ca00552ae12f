//! In-process voice platform for tests and dry runs

use crate::error::{MatchmakingError, Result};
use crate::platform::{ChannelProvisioner, MemberDirectory, MemberMover, MoveOutcome};
use crate::types::{ChannelRef, ServerId, Team, UserId};
use crate::utils;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Mock platform with scriptable membership, voice connections and failures
#[derive(Debug, Default)]
pub struct MockVoicePlatform {
    members: Mutex<HashMap<ServerId, HashSet<UserId>>>,
    connected: Mutex<HashSet<UserId>>,
    failing_moves: Mutex<HashSet<UserId>>,
    fail_channel_creation: AtomicBool,
    created_channels: Mutex<Vec<(ServerId, ChannelRef)>>,
    moves: Mutex<Vec<(UserId, String)>>,
    deleted_channels: Mutex<Vec<String>>,
}

impl MockVoicePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add users as members of a server, connected to voice
    pub fn add_connected_members(&self, server_id: &str, user_ids: &[&str]) {
        for user_id in user_ids {
            self.add_member(server_id, user_id);
            self.connect(user_id);
        }
    }

    pub fn add_member(&self, server_id: &str, user_id: &str) {
        if let Ok(mut members) = self.members.lock() {
            members
                .entry(server_id.to_string())
                .or_default()
                .insert(user_id.to_string());
        }
    }

    /// Simulate a user leaving the server
    pub fn remove_member(&self, server_id: &str, user_id: &str) {
        if let Ok(mut members) = self.members.lock() {
            if let Some(server_members) = members.get_mut(server_id) {
                server_members.remove(user_id);
            }
        }
        self.disconnect(user_id);
    }

    pub fn connect(&self, user_id: &str) {
        if let Ok(mut connected) = self.connected.lock() {
            connected.insert(user_id.to_string());
        }
    }

    pub fn disconnect(&self, user_id: &str) {
        if let Ok(mut connected) = self.connected.lock() {
            connected.remove(user_id);
        }
    }

    pub fn set_channel_creation_failure(&self, fail: bool) {
        self.fail_channel_creation.store(fail, Ordering::SeqCst);
    }

    /// Make every move of this user fail
    pub fn fail_moves_for(&self, user_id: &str) {
        if let Ok(mut failing) = self.failing_moves.lock() {
            failing.insert(user_id.to_string());
        }
    }

    pub fn created_channels(&self) -> Vec<(ServerId, ChannelRef)> {
        self.created_channels
            .lock()
            .map(|channels| channels.clone())
            .unwrap_or_default()
    }

    /// Moves performed as (user, channel id)
    pub fn moves(&self) -> Vec<(UserId, String)> {
        self.moves
            .lock()
            .map(|moves| moves.clone())
            .unwrap_or_default()
    }

    pub fn deleted_channels(&self) -> Vec<String> {
        self.deleted_channels
            .lock()
            .map(|deleted| deleted.clone())
            .unwrap_or_default()
    }
}

fn lock_error(what: &str) -> MatchmakingError {
    MatchmakingError::InternalError {
        message: format!("Failed to acquire mock platform {} lock", what),
    }
}

#[async_trait]
impl ChannelProvisioner for MockVoicePlatform {
    async fn create_team_channel(
        &self,
        server_id: &str,
        _category_id: &str,
        team: &Team,
    ) -> Result<ChannelRef> {
        if self.fail_channel_creation.load(Ordering::SeqCst) {
            return Err(MatchmakingError::ChannelProvisioningFailed {
                message: format!("mock refused channel for team {}", team.id),
            }
            .into());
        }

        let channel = ChannelRef {
            id: utils::generate_channel_id(),
            name: team.channel_name(),
            user_limit: team.size(),
        };
        self.created_channels
            .lock()
            .map_err(|_| lock_error("channels"))?
            .push((server_id.to_string(), channel.clone()));
        Ok(channel)
    }

    async fn delete_channel(&self, _server_id: &str, channel_id: &str) -> Result<()> {
        self.deleted_channels
            .lock()
            .map_err(|_| lock_error("deleted channels"))?
            .push(channel_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl MemberMover for MockVoicePlatform {
    async fn move_member(
        &self,
        _server_id: &str,
        channel: &ChannelRef,
        user_id: &str,
    ) -> Result<MoveOutcome> {
        let failing = self
            .failing_moves
            .lock()
            .map_err(|_| lock_error("failing moves"))?
            .contains(user_id);
        if failing {
            return Err(MatchmakingError::InternalError {
                message: format!("mock move failed for {}", user_id),
            }
            .into());
        }

        let connected = self
            .connected
            .lock()
            .map_err(|_| lock_error("connected"))?
            .contains(user_id);
        if !connected {
            return Ok(MoveOutcome::NotConnected);
        }

        self.moves
            .lock()
            .map_err(|_| lock_error("moves"))?
            .push((user_id.to_string(), channel.id.clone()));
        Ok(MoveOutcome::Moved)
    }
}

#[async_trait]
impl MemberDirectory for MockVoicePlatform {
    async fn is_member(&self, server_id: &str, user_id: &str) -> Result<bool> {
        let members = self.members.lock().map_err(|_| lock_error("members"))?;
        Ok(members
            .get(server_id)
            .is_some_and(|server_members| server_members.contains(user_id)))
    }
}
