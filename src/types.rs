//! Common types used throughout the matchmaking service

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::MatchmakingError;

/// Unique identifier for platform users
pub type UserId = String;

/// Unique identifier for servers (guilds)
pub type ServerId = String;

/// Unique identifier for matched teams
pub type TeamId = Uuid;

/// Team size a player can queue for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Mode {
    #[serde(rename = "2")]
    Twos,
    #[serde(rename = "3")]
    Threes,
    #[serde(rename = "4")]
    Fours,
}

impl Mode {
    /// All modes, smallest team first
    pub const ALL: [Mode; 3] = [Mode::Twos, Mode::Threes, Mode::Fours];

    pub fn team_size(self) -> usize {
        match self {
            Mode::Twos => 2,
            Mode::Threes => 3,
            Mode::Fours => 4,
        }
    }

    pub fn from_team_size(size: usize) -> Option<Mode> {
        match size {
            2 => Some(Mode::Twos),
            3 => Some(Mode::Threes),
            4 => Some(Mode::Fours),
            _ => None,
        }
    }

    /// The mode a team of this size is promoted into, if any
    pub fn next(self) -> Option<Mode> {
        Mode::from_team_size(self.team_size() + 1)
    }

    pub fn is_largest(self) -> bool {
        self.next().is_none()
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let size = self.team_size();
        write!(f, "{}v{}", size, size)
    }
}

impl FromStr for Mode {
    type Err = MatchmakingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "2" | "2v2" | "twos" => Ok(Mode::Twos),
            "3" | "3v3" | "threes" => Ok(Mode::Threes),
            "4" | "4v4" | "fours" => Ok(Mode::Fours),
            other => Err(MatchmakingError::InvalidQueueRequest {
                reason: format!("unknown mode '{}'", other),
            }),
        }
    }
}

/// Discrete skill tier used to keep teams at comparable skill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Bracket {
    Low,
    Mid,
    High,
}

impl Bracket {
    pub const ALL: [Bracket; 3] = [Bracket::Low, Bracket::Mid, Bracket::High];

    pub fn level(self) -> u8 {
        match self {
            Bracket::Low => 1,
            Bracket::Mid => 2,
            Bracket::High => 3,
        }
    }
}

impl From<Bracket> for u8 {
    fn from(bracket: Bracket) -> Self {
        bracket.level()
    }
}

impl TryFrom<u8> for Bracket {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            1 => Ok(Bracket::Low),
            2 => Ok(Bracket::Mid),
            3 => Ok(Bracket::High),
            other => Err(format!("bracket must be 1, 2 or 3, got {}", other)),
        }
    }
}

impl std::fmt::Display for Bracket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.level())
    }
}

/// Stats resolved by the upstream lookup when a player joins
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlayerStats {
    pub skill_score: f64,
    pub experience: u32,
}

impl PlayerStats {
    pub fn new(skill_score: f64, experience: u32) -> Self {
        Self {
            skill_score,
            experience,
        }
    }

    /// Reject unresolved lookups before they reach the cache or a queue
    pub fn validate(&self, user_id: &str) -> Result<(), MatchmakingError> {
        if !self.skill_score.is_finite() || self.skill_score <= 0.0 {
            return Err(MatchmakingError::InvalidPlayerStats {
                user_id: user_id.to_string(),
                reason: format!("skill score {} is not a positive number", self.skill_score),
            });
        }
        if self.experience == 0 {
            return Err(MatchmakingError::InvalidPlayerStats {
                user_id: user_id.to_string(),
                reason: "experience metric must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// A player waiting in one mode's queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub user_id: UserId,
    pub skill_score: f64,
    pub experience: u32,
    /// Last computed bracket. Only a cache, never read for matching decisions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bracket: Option<Bracket>,
    pub timestamp: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(user_id: impl Into<UserId>, stats: PlayerStats, timestamp: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            skill_score: stats.skill_score,
            experience: stats.experience,
            bracket: None,
            timestamp,
        }
    }

    pub fn stats(&self) -> PlayerStats {
        PlayerStats::new(self.skill_score, self.experience)
    }
}

/// The three per-mode queues of a server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModeQueues {
    #[serde(rename = "2", default)]
    pub twos: Vec<QueueEntry>,
    #[serde(rename = "3", default)]
    pub threes: Vec<QueueEntry>,
    #[serde(rename = "4", default)]
    pub fours: Vec<QueueEntry>,
}

impl ModeQueues {
    pub fn get(&self, mode: Mode) -> &Vec<QueueEntry> {
        match mode {
            Mode::Twos => &self.twos,
            Mode::Threes => &self.threes,
            Mode::Fours => &self.fours,
        }
    }

    pub fn get_mut(&mut self, mode: Mode) -> &mut Vec<QueueEntry> {
        match mode {
            Mode::Twos => &mut self.twos,
            Mode::Threes => &mut self.threes,
            Mode::Fours => &mut self.fours,
        }
    }

    pub fn contains(&self, mode: Mode, user_id: &str) -> bool {
        self.get(mode).iter().any(|entry| entry.user_id == user_id)
    }

    /// Modes the user currently has a slot in
    pub fn modes_containing(&self, user_id: &str) -> Vec<Mode> {
        Mode::ALL
            .into_iter()
            .filter(|mode| self.contains(*mode, user_id))
            .collect()
    }

    pub fn is_queued(&self, user_id: &str) -> bool {
        !self.modes_containing(user_id).is_empty()
    }

    /// Remove every slot the user holds, returning the modes it was removed from
    pub fn remove_user(&mut self, user_id: &str) -> Vec<Mode> {
        let mut removed = Vec::new();
        for mode in Mode::ALL {
            let queue = self.get_mut(mode);
            let before = queue.len();
            queue.retain(|entry| entry.user_id != user_id);
            if queue.len() != before {
                removed.push(mode);
            }
        }
        removed
    }

    /// Remove every slot held by any of the given users, returning how many slots went
    pub fn remove_users(&mut self, user_ids: &HashSet<UserId>) -> usize {
        let mut removed = 0;
        for mode in Mode::ALL {
            let queue = self.get_mut(mode);
            let before = queue.len();
            queue.retain(|entry| !user_ids.contains(&entry.user_id));
            removed += before - queue.len();
        }
        removed
    }

    pub fn len(&self, mode: Mode) -> usize {
        self.get(mode).len()
    }

    pub fn total_entries(&self) -> usize {
        Mode::ALL.into_iter().map(|mode| self.len(mode)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_entries() == 0
    }

    pub fn clear(&mut self) {
        for mode in Mode::ALL {
            self.get_mut(mode).clear();
        }
    }
}

/// Per-user mode opt-ins. A user without a record is eligible for every mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModePreferences(HashMap<UserId, BTreeSet<Mode>>);

impl ModePreferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn modes_for(&self, user_id: &str) -> BTreeSet<Mode> {
        self.0
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| Mode::ALL.into_iter().collect())
    }

    pub fn allows(&self, user_id: &str, mode: Mode) -> bool {
        self.0
            .get(user_id)
            .map_or(true, |modes| modes.contains(&mode))
    }

    /// True when every listed user has opted into `mode`
    pub fn all_allow<'a>(&self, user_ids: impl IntoIterator<Item = &'a str>, mode: Mode) -> bool {
        user_ids.into_iter().all(|user_id| self.allows(user_id, mode))
    }

    pub fn set(&mut self, user_id: impl Into<UserId>, modes: BTreeSet<Mode>) {
        self.0.insert(user_id.into(), modes);
    }

    /// Flip one mode in the user's set, starting from the default when no record exists
    pub fn toggle(&mut self, user_id: &str, mode: Mode) -> BTreeSet<Mode> {
        let mut modes = self.modes_for(user_id);
        if !modes.remove(&mode) {
            modes.insert(mode);
        }
        self.0.insert(user_id.to_string(), modes.clone());
        modes
    }

    pub fn has_record(&self, user_id: &str) -> bool {
        self.0.contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Everything the service stores for one server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerQueueState {
    pub server_id: ServerId,
    pub server_name: String,
    /// Voice category team channels are created under
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub preferences: ModePreferences,
    #[serde(default)]
    pub used_stats: HashMap<UserId, PlayerStats>,
    #[serde(default)]
    pub queues: ModeQueues,
}

impl ServerQueueState {
    pub fn new(server_id: impl Into<ServerId>, server_name: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            server_name: server_name.into(),
            category: None,
            preferences: ModePreferences::new(),
            used_stats: HashMap::new(),
            queues: ModeQueues::default(),
        }
    }

    /// Configured category, treating an empty id as unset
    pub fn category_id(&self) -> Option<&str> {
        self.category
            .as_deref()
            .map(str::trim)
            .filter(|category| !category.is_empty())
    }
}

/// Handle to a voice channel created for a team
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRef {
    pub id: String,
    pub name: String,
    pub user_limit: usize,
}

/// A finalized team
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
    pub id: TeamId,
    pub server_id: ServerId,
    pub mode: Mode,
    pub bracket: Bracket,
    pub players: Vec<QueueEntry>,
    pub matched_at: DateTime<Utc>,
    /// Set when the team was formed in a smaller mode and promoted
    #[serde(default)]
    pub promoted_from: Option<Mode>,
    #[serde(default)]
    pub channel: Option<ChannelRef>,
}

impl Team {
    pub fn user_ids(&self) -> Vec<&str> {
        self.players
            .iter()
            .map(|player| player.user_id.as_str())
            .collect()
    }

    pub fn size(&self) -> usize {
        self.players.len()
    }

    pub fn is_promoted(&self) -> bool {
        self.promoted_from.is_some()
    }

    /// Name used for the team's voice channel
    pub fn channel_name(&self) -> String {
        format!("Team-{}", self.user_ids().join("-"))
    }
}

/// Reason why a player left the queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaveReason {
    /// Pressed join again while queued
    Toggled,
    UserLeft,
    VoiceDisconnected,
    QueuesCleared,
}

/// AMQP Message Types
/// Request to join (or, when already queued, leave) the server's queues
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinQueueRequest {
    pub server_id: ServerId,
    pub server_name: String,
    pub user_id: UserId,
    /// Whether the user is currently connected to a voice channel
    pub in_voice: bool,
    /// Stats from the upstream lookup; may be omitted when cached
    #[serde(default)]
    pub stats: Option<PlayerStats>,
    pub timestamp: DateTime<Utc>,
}

/// Request to leave every queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveQueueRequest {
    pub server_id: ServerId,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
}

/// Request to flip one mode in a user's preferences
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferenceToggleRequest {
    pub server_id: ServerId,
    pub user_id: UserId,
    pub mode: Mode,
    pub timestamp: DateTime<Utc>,
}

/// Request to configure the category team channels are created under
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetCategoryRequest {
    pub server_id: ServerId,
    pub server_name: String,
    pub category_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Voice state change reported by the platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceStateUpdate {
    pub server_id: ServerId,
    pub user_id: UserId,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub previous_channel_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Guild membership change reported by the platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipUpdate {
    pub server_id: ServerId,
    pub user_id: UserId,
    pub present: bool,
    pub timestamp: DateTime<Utc>,
}

/// Event emitted when a player enters one or more queues
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerQueued {
    pub server_id: ServerId,
    pub user_id: UserId,
    pub modes: Vec<Mode>,
    pub bracket: Bracket,
    pub timestamp: DateTime<Utc>,
}

/// Event emitted when a player leaves the queues
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerLeftQueue {
    pub server_id: ServerId,
    pub user_id: UserId,
    pub modes: Vec<Mode>,
    pub reason: LeaveReason,
    pub timestamp: DateTime<Utc>,
}

/// Event emitted once a team is finalized and its members were moved
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamMatched {
    pub server_id: ServerId,
    pub team: Team,
    /// Members that were not connected to voice and so were not moved
    pub unmoved: Vec<UserId>,
    pub timestamp: DateTime<Utc>,
}

/// Side effects the platform bot carries out on behalf of the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum PlatformRequest {
    CreateTeamChannel {
        server_id: ServerId,
        category_id: String,
        channel: ChannelRef,
        members: Vec<UserId>,
    },
    MoveMember {
        server_id: ServerId,
        channel_id: String,
        user_id: UserId,
    },
    DeleteChannel {
        server_id: ServerId,
        channel_id: String,
    },
}

/// Union type for all AMQP messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AmqpMessage {
    JoinQueue(JoinQueueRequest),
    LeaveQueue(LeaveQueueRequest),
    TogglePreference(PreferenceToggleRequest),
    SetCategory(SetCategoryRequest),
    VoiceState(VoiceStateUpdate),
    Membership(MembershipUpdate),
    PlayerQueued(PlayerQueued),
    PlayerLeftQueue(PlayerLeftQueue),
    TeamMatched(TeamMatched),
    Platform(PlatformRequest),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(user_id: &str) -> QueueEntry {
        QueueEntry::new(user_id, PlayerStats::new(4.0, 150), Utc::now())
    }

    #[test]
    fn test_mode_ordering_and_promotion_target() {
        assert_eq!(Mode::Twos.next(), Some(Mode::Threes));
        assert_eq!(Mode::Threes.next(), Some(Mode::Fours));
        assert_eq!(Mode::Fours.next(), None);
        assert!(Mode::Fours > Mode::Twos);
        assert_eq!(Mode::Threes.to_string(), "3v3");
        assert_eq!("4".parse::<Mode>().unwrap(), Mode::Fours);
        assert!("5".parse::<Mode>().is_err());
    }

    #[test]
    fn test_mode_serializes_as_team_size() {
        assert_eq!(serde_json::to_string(&Mode::Twos).unwrap(), "\"2\"");
        let queues = ModeQueues::default();
        let json = serde_json::to_value(&queues).unwrap();
        assert!(json.get("2").is_some());
        assert!(json.get("4").is_some());
    }

    #[test]
    fn test_bracket_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&Bracket::Mid).unwrap(), "2");
        let bracket: Bracket = serde_json::from_str("3").unwrap();
        assert_eq!(bracket, Bracket::High);
        assert!(serde_json::from_str::<Bracket>("4").is_err());
    }

    #[test]
    fn test_stats_validation() {
        assert!(PlayerStats::new(2.5, 10).validate("u").is_ok());
        assert!(PlayerStats::new(0.0, 10).validate("u").is_err());
        assert!(PlayerStats::new(-1.0, 10).validate("u").is_err());
        assert!(PlayerStats::new(f64::NAN, 10).validate("u").is_err());
        assert!(PlayerStats::new(f64::INFINITY, 10).validate("u").is_err());
        assert!(PlayerStats::new(2.5, 0).validate("u").is_err());
    }

    #[test]
    fn test_remove_user_sweeps_every_mode() {
        let mut queues = ModeQueues::default();
        queues.twos.push(entry("a"));
        queues.threes.push(entry("a"));
        queues.threes.push(entry("b"));
        queues.fours.push(entry("a"));

        let removed = queues.remove_user("a");
        assert_eq!(removed, vec![Mode::Twos, Mode::Threes, Mode::Fours]);
        assert!(!queues.is_queued("a"));
        assert_eq!(queues.total_entries(), 1);
        assert!(queues.remove_user("a").is_empty());
    }

    #[test]
    fn test_remove_users_counts_slots() {
        let mut queues = ModeQueues::default();
        queues.twos.extend([entry("a"), entry("b"), entry("c")]);
        queues.fours.extend([entry("b"), entry("d")]);

        let targets: HashSet<UserId> = ["a".to_string(), "b".to_string()].into_iter().collect();
        assert_eq!(queues.remove_users(&targets), 3);
        assert_eq!(queues.len(Mode::Twos), 1);
        assert_eq!(queues.len(Mode::Fours), 1);
    }

    #[test]
    fn test_preferences_default_to_all_modes() {
        let mut prefs = ModePreferences::new();
        assert!(prefs.allows("new-user", Mode::Threes));
        assert_eq!(prefs.modes_for("new-user").len(), 3);

        let modes = prefs.toggle("new-user", Mode::Threes);
        assert!(!modes.contains(&Mode::Threes));
        assert!(!prefs.allows("new-user", Mode::Threes));
        assert!(prefs.allows("new-user", Mode::Twos));

        let modes = prefs.toggle("new-user", Mode::Threes);
        assert!(modes.contains(&Mode::Threes));
        assert!(prefs.all_allow(["new-user", "other"], Mode::Threes));
    }

    #[test]
    fn test_category_id_ignores_blank() {
        let mut state = ServerQueueState::new("s1", "Server");
        assert_eq!(state.category_id(), None);
        state.category = Some("  ".to_string());
        assert_eq!(state.category_id(), None);
        state.category = Some("cat-1".to_string());
        assert_eq!(state.category_id(), Some("cat-1"));
    }

    #[test]
    fn test_team_channel_name() {
        let team = Team {
            id: Uuid::new_v4(),
            server_id: "s1".to_string(),
            mode: Mode::Twos,
            bracket: Bracket::Low,
            players: vec![entry("a"), entry("b")],
            matched_at: Utc::now(),
            promoted_from: None,
            channel: None,
        };
        assert_eq!(team.channel_name(), "Team-a-b");
        assert_eq!(team.size(), 2);
        assert!(!team.is_promoted());
    }

    #[test]
    fn test_message_tagging() {
        let message = AmqpMessage::LeaveQueue(LeaveQueueRequest {
            server_id: "s1".to_string(),
            user_id: "u1".to_string(),
            timestamp: Utc::now(),
        });
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "LeaveQueue");
        assert_eq!(json["user_id"], "u1");
    }
}
