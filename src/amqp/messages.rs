//! AMQP message definitions and serialization

use crate::error::{MatchmakingError, Result};
use crate::types::*;
use serde_json;

/// Queue the service consumes user and platform commands from
pub const COMMAND_QUEUE: &str = "huddle.commands";
/// Exchange commands are published to (bound to [`COMMAND_QUEUE`] with `command.#`)
pub const COMMAND_EXCHANGE: &str = "huddle.command_exchange";
pub const QUEUE_EVENTS_EXCHANGE: &str = "huddle.queue_events";
pub const TEAM_EVENTS_EXCHANGE: &str = "huddle.team_events";
pub const PLATFORM_REQUESTS_EXCHANGE: &str = "huddle.platform_requests";

/// Routing keys for events
pub const PLAYER_QUEUED_ROUTING_KEY: &str = "player.queued";
pub const PLAYER_LEFT_ROUTING_KEY: &str = "player.left";
pub const TEAM_MATCHED_ROUTING_KEY: &str = "team.matched";
pub const CREATE_CHANNEL_ROUTING_KEY: &str = "platform.create_channel";
pub const MOVE_MEMBER_ROUTING_KEY: &str = "platform.move_member";
pub const DELETE_CHANNEL_ROUTING_KEY: &str = "platform.delete_channel";

/// Message envelope with metadata
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MessageEnvelope<T> {
    pub payload: T,
    pub correlation_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub routing_key: String,
}

impl<T> MessageEnvelope<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    /// Create a new message envelope
    pub fn new(payload: T, routing_key: String) -> Self {
        Self {
            payload,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            routing_key,
        }
    }

    /// Create an envelope with a caller-chosen correlation id, used to dedupe retries
    pub fn with_correlation_id(payload: T, routing_key: String, correlation_id: String) -> Self {
        Self {
            payload,
            correlation_id,
            timestamp: chrono::Utc::now(),
            routing_key,
        }
    }

    /// Serialize the envelope to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            MatchmakingError::InternalError {
                message: format!("Failed to serialize message: {}", e),
            }
            .into()
        })
    }

    /// Deserialize envelope from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            MatchmakingError::InvalidQueueRequest {
                reason: format!("Failed to deserialize message: {}", e),
            }
            .into()
        })
    }
}

/// Message serialization and validation utilities
pub struct MessageUtils;

impl MessageUtils {
    /// Serialize a command to bytes after validating it
    pub fn serialize_command(command: &AmqpMessage) -> Result<Vec<u8>> {
        Self::validate_command(command)?;
        serde_json::to_vec(command).map_err(|e| {
            MatchmakingError::InternalError {
                message: format!("Failed to serialize command: {}", e),
            }
            .into()
        })
    }

    /// Deserialize a command from bytes.
    ///
    /// Accepts either a bare message or one wrapped in a [`MessageEnvelope`].
    pub fn deserialize_command(bytes: &[u8]) -> Result<AmqpMessage> {
        let command = match serde_json::from_slice::<AmqpMessage>(bytes) {
            Ok(command) => command,
            Err(bare_error) => MessageEnvelope::<AmqpMessage>::from_bytes(bytes)
                .map(|envelope| envelope.payload)
                .map_err(|_| MatchmakingError::InvalidQueueRequest {
                    reason: format!("Failed to deserialize command: {}", bare_error),
                })?,
        };

        Self::validate_command(&command)?;
        Ok(command)
    }

    /// Validate an inbound command
    pub fn validate_command(command: &AmqpMessage) -> Result<()> {
        let (server_id, user_id) = match command {
            AmqpMessage::JoinQueue(request) => (&request.server_id, Some(&request.user_id)),
            AmqpMessage::LeaveQueue(request) => (&request.server_id, Some(&request.user_id)),
            AmqpMessage::TogglePreference(request) => {
                (&request.server_id, Some(&request.user_id))
            }
            AmqpMessage::VoiceState(update) => (&update.server_id, Some(&update.user_id)),
            AmqpMessage::Membership(update) => (&update.server_id, Some(&update.user_id)),
            AmqpMessage::SetCategory(request) => {
                if request.category_id.trim().is_empty() {
                    return Err(MatchmakingError::InvalidQueueRequest {
                        reason: "Category ID cannot be empty".to_string(),
                    }
                    .into());
                }
                (&request.server_id, None)
            }
            other => {
                return Err(MatchmakingError::InvalidQueueRequest {
                    reason: format!(
                        "{} is an outbound event, not a command",
                        Self::get_routing_key(other)
                    ),
                }
                .into());
            }
        };

        if server_id.is_empty() {
            return Err(MatchmakingError::InvalidQueueRequest {
                reason: "Server ID cannot be empty".to_string(),
            }
            .into());
        }

        if user_id.is_some_and(|user_id| user_id.is_empty()) {
            return Err(MatchmakingError::InvalidQueueRequest {
                reason: "User ID cannot be empty".to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// Serialize any AMQP message to bytes
    pub fn serialize_message<T: serde::Serialize>(message: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(message).map_err(|e| {
            MatchmakingError::InternalError {
                message: format!("Failed to serialize message: {}", e),
            }
            .into()
        })
    }

    /// Routing key for a platform request
    pub fn platform_routing_key(request: &PlatformRequest) -> &'static str {
        match request {
            PlatformRequest::CreateTeamChannel { .. } => CREATE_CHANNEL_ROUTING_KEY,
            PlatformRequest::MoveMember { .. } => MOVE_MEMBER_ROUTING_KEY,
            PlatformRequest::DeleteChannel { .. } => DELETE_CHANNEL_ROUTING_KEY,
        }
    }

    /// Get routing key for a message type
    pub fn get_routing_key(message: &AmqpMessage) -> &'static str {
        match message {
            AmqpMessage::JoinQueue(_) => "command.join",
            AmqpMessage::LeaveQueue(_) => "command.leave",
            AmqpMessage::TogglePreference(_) => "command.preference",
            AmqpMessage::SetCategory(_) => "command.category",
            AmqpMessage::VoiceState(_) => "command.voice_state",
            AmqpMessage::Membership(_) => "command.membership",
            AmqpMessage::PlayerQueued(_) => PLAYER_QUEUED_ROUTING_KEY,
            AmqpMessage::PlayerLeftQueue(_) => PLAYER_LEFT_ROUTING_KEY,
            AmqpMessage::TeamMatched(_) => TEAM_MATCHED_ROUTING_KEY,
            AmqpMessage::Platform(request) => Self::platform_routing_key(request),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_join_request() -> AmqpMessage {
        AmqpMessage::JoinQueue(JoinQueueRequest {
            server_id: "server-1".to_string(),
            server_name: "Test Server".to_string(),
            user_id: "user-1".to_string(),
            in_voice: true,
            stats: Some(PlayerStats::new(4.2, 180)),
            timestamp: chrono::Utc::now(),
        })
    }

    #[test]
    fn test_message_envelope_creation() {
        let envelope = MessageEnvelope::new(create_test_join_request(), "command.join".to_string());

        assert_eq!(envelope.routing_key, "command.join");
        assert!(!envelope.correlation_id.is_empty());
    }

    #[test]
    fn test_command_validation() {
        assert!(MessageUtils::validate_command(&create_test_join_request()).is_ok());

        let empty_user = AmqpMessage::LeaveQueue(LeaveQueueRequest {
            server_id: "server-1".to_string(),
            user_id: String::new(),
            timestamp: chrono::Utc::now(),
        });
        assert!(MessageUtils::validate_command(&empty_user).is_err());

        let blank_category = AmqpMessage::SetCategory(SetCategoryRequest {
            server_id: "server-1".to_string(),
            server_name: "Test Server".to_string(),
            category_id: "  ".to_string(),
            timestamp: chrono::Utc::now(),
        });
        assert!(MessageUtils::validate_command(&blank_category).is_err());

        let event = AmqpMessage::Platform(PlatformRequest::DeleteChannel {
            server_id: "server-1".to_string(),
            channel_id: "c1".to_string(),
        });
        assert!(MessageUtils::validate_command(&event).is_err());
    }

    #[test]
    fn test_deserialize_bare_and_enveloped_commands() {
        let command = create_test_join_request();
        let bare = MessageUtils::serialize_command(&command).unwrap();
        assert!(matches!(
            MessageUtils::deserialize_command(&bare).unwrap(),
            AmqpMessage::JoinQueue(_)
        ));

        let enveloped = MessageEnvelope::new(command, "command.join".to_string())
            .to_bytes()
            .unwrap();
        assert!(matches!(
            MessageUtils::deserialize_command(&enveloped).unwrap(),
            AmqpMessage::JoinQueue(_)
        ));

        assert!(MessageUtils::deserialize_command(b"{\"type\":\"Nope\"}").is_err());
    }

    #[test]
    fn test_routing_key_generation() {
        assert_eq!(
            MessageUtils::get_routing_key(&create_test_join_request()),
            "command.join"
        );

        let move_request = AmqpMessage::Platform(PlatformRequest::MoveMember {
            server_id: "server-1".to_string(),
            channel_id: "c1".to_string(),
            user_id: "user-1".to_string(),
        });
        assert_eq!(
            MessageUtils::get_routing_key(&move_request),
            MOVE_MEMBER_ROUTING_KEY
        );
    }
}
