//! Error types for the matchmaking service
//!
//! This module defines all error types using anyhow for consistent error handling
//! throughout the application.

/// Result type alias for convenience
pub type Result<T> = anyhow::Result<T>;

/// Custom error types for specific matchmaking scenarios
#[derive(Debug, thiserror::Error)]
pub enum MatchmakingError {
    #[error("AMQP connection failed: {message}")]
    AmqpConnectionFailed { message: String },

    #[error("Event publish failed: {message}")]
    PublishFailed { message: String },

    #[error("Invalid queue request: {reason}")]
    InvalidQueueRequest { reason: String },

    #[error("Invalid player stats for {user_id}: {reason}")]
    InvalidPlayerStats { user_id: String, reason: String },

    #[error("Server not found: {server_id}")]
    ServerNotFound { server_id: String },

    #[error("Player not found: {user_id}")]
    PlayerNotFound { user_id: String },

    #[error("Player {user_id} is not connected to a voice channel")]
    NotInVoiceChannel { user_id: String },

    #[error("Preference change denied for {user_id}: {reason}")]
    PreferenceChangeDenied { user_id: String, reason: String },

    #[error("Channel provisioning failed: {message}")]
    ChannelProvisioningFailed { message: String },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Internal service error: {message}")]
    InternalError { message: String },
}

impl MatchmakingError {
    /// Errors that abort a whole matchmaking pass rather than a single bracket.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            MatchmakingError::ConfigurationError { .. } | MatchmakingError::ServerNotFound { .. }
        )
    }

    /// Transient failures worth redelivering the command for
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MatchmakingError::AmqpConnectionFailed { .. }
                | MatchmakingError::PublishFailed { .. }
                | MatchmakingError::InternalError { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let missing = MatchmakingError::ServerNotFound {
            server_id: "s1".to_string(),
        };
        assert!(missing.is_configuration_error());
        assert!(!missing.is_retryable());

        let internal = MatchmakingError::InternalError {
            message: "lock".to_string(),
        };
        assert!(internal.is_retryable());
        assert!(!internal.is_configuration_error());

        let denied = MatchmakingError::PreferenceChangeDenied {
            user_id: "u".to_string(),
            reason: "queued".to_string(),
        };
        assert!(!denied.is_retryable());
        assert_eq!(
            denied.to_string(),
            "Preference change denied for u: queued"
        );
    }
}
