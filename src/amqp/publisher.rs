//! AMQP event publisher for outbound events

use crate::amqp::messages::{
    MessageEnvelope, MessageUtils, PLATFORM_REQUESTS_EXCHANGE, PLAYER_LEFT_ROUTING_KEY,
    PLAYER_QUEUED_ROUTING_KEY, QUEUE_EVENTS_EXCHANGE, TEAM_EVENTS_EXCHANGE,
    TEAM_MATCHED_ROUTING_KEY,
};
use crate::error::{MatchmakingError, Result};
use crate::types::*;
use amqprs::{
    channel::{BasicPublishArguments, Channel, ExchangeDeclareArguments},
    BasicProperties,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Trait for publishing matchmaking events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a PlayerQueued event
    async fn publish_player_queued(&self, event: PlayerQueued) -> Result<()>;

    /// Publish a PlayerLeftQueue event
    async fn publish_player_left_queue(&self, event: PlayerLeftQueue) -> Result<()>;

    /// Publish a TeamMatched event
    async fn publish_team_matched(&self, event: TeamMatched) -> Result<()>;

    /// Ask the platform bot to carry out a channel or member operation
    async fn publish_platform_request(&self, request: PlatformRequest) -> Result<()>;
}

/// Configuration for event publishing
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub enable_deduplication: bool,
    /// Dedup cache is cleared once it grows past this many ids
    pub max_cached_ids: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 500,
            enable_deduplication: true,
            max_cached_ids: 10_000,
        }
    }
}

/// AMQP-based event publisher implementation
pub struct AmqpEventPublisher {
    channel: Channel,
    config: PublisherConfig,
    published_messages: Mutex<HashSet<String>>,
}

impl AmqpEventPublisher {
    /// Create a new event publisher
    pub async fn new(channel: Channel, config: PublisherConfig) -> Result<Self> {
        let publisher = Self {
            channel,
            config,
            published_messages: Mutex::new(HashSet::new()),
        };

        publisher.setup_exchanges().await?;

        Ok(publisher)
    }

    /// Set up AMQP exchanges for events
    async fn setup_exchanges(&self) -> Result<()> {
        for exchange in [
            QUEUE_EVENTS_EXCHANGE,
            TEAM_EVENTS_EXCHANGE,
            PLATFORM_REQUESTS_EXCHANGE,
        ] {
            let args = ExchangeDeclareArguments::new(exchange, "topic");
            self.channel.exchange_declare(args).await.map_err(|e| {
                MatchmakingError::AmqpConnectionFailed {
                    message: format!("Failed to declare exchange {}: {}", exchange, e),
                }
            })?;
        }

        info!("Successfully set up AMQP exchanges");
        Ok(())
    }

    fn already_published(&self, correlation_id: &str) -> Result<bool> {
        let published_messages =
            self.published_messages
                .lock()
                .map_err(|_| MatchmakingError::InternalError {
                    message: "Failed to acquire published messages lock".to_string(),
                })?;
        Ok(published_messages.contains(correlation_id))
    }

    fn remember_published(&self, correlation_id: &str) -> Result<()> {
        let mut published_messages =
            self.published_messages
                .lock()
                .map_err(|_| MatchmakingError::InternalError {
                    message: "Failed to acquire published messages lock".to_string(),
                })?;
        if published_messages.len() >= self.config.max_cached_ids {
            published_messages.clear();
        }
        published_messages.insert(correlation_id.to_string());
        Ok(())
    }

    /// Publish to an exchange with retry and exponential backoff
    async fn publish_to_exchange<T>(
        &self,
        exchange: &str,
        envelope: &MessageEnvelope<T>,
    ) -> Result<()>
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
    {
        if self.config.enable_deduplication && self.already_published(&envelope.correlation_id)? {
            debug!(
                "Message {} already published, skipping",
                envelope.correlation_id
            );
            return Ok(());
        }

        let mut retry_count = 0;
        let mut delay = Duration::from_millis(self.config.retry_delay_ms);

        loop {
            match self.try_publish(exchange, envelope).await {
                Ok(_) => {
                    if self.config.enable_deduplication {
                        self.remember_published(&envelope.correlation_id)?;
                    }

                    debug!(
                        "Published message {} to exchange {} ({})",
                        envelope.correlation_id, exchange, envelope.routing_key
                    );
                    return Ok(());
                }
                Err(e) => {
                    retry_count += 1;
                    if retry_count > self.config.max_retries {
                        error!(
                            "Failed to publish message {} after {} retries: {}",
                            envelope.correlation_id, self.config.max_retries, e
                        );
                        return Err(MatchmakingError::PublishFailed {
                            message: e.to_string(),
                        }
                        .into());
                    }

                    warn!(
                        "Publish attempt {} failed for message {}: {}. Retrying in {:?}",
                        retry_count, envelope.correlation_id, e, delay
                    );

                    sleep(delay).await;
                    delay = Duration::from_millis((delay.as_millis() as u64 * 2).min(5000));
                }
            }
        }
    }

    /// Single publish attempt
    async fn try_publish<T>(&self, exchange: &str, envelope: &MessageEnvelope<T>) -> Result<()>
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
    {
        let payload = envelope.to_bytes()?;

        let args = BasicPublishArguments::new(exchange, &envelope.routing_key);
        let mut properties = BasicProperties::default();
        properties
            .with_message_id(&envelope.correlation_id)
            .with_timestamp(envelope.timestamp.timestamp() as u64)
            .with_content_type("application/json");

        self.channel
            .basic_publish(properties, payload, args)
            .await
            .map_err(|e| MatchmakingError::AmqpConnectionFailed {
                message: format!("Failed to publish message: {}", e),
            })?;

        Ok(())
    }

    /// Get number of cached message IDs (for monitoring)
    pub fn cached_message_count(&self) -> usize {
        self.published_messages
            .lock()
            .map(|cache| cache.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventPublisher for AmqpEventPublisher {
    async fn publish_player_queued(&self, event: PlayerQueued) -> Result<()> {
        let envelope = MessageEnvelope::new(event, PLAYER_QUEUED_ROUTING_KEY.to_string());
        self.publish_to_exchange(QUEUE_EVENTS_EXCHANGE, &envelope)
            .await
    }

    async fn publish_player_left_queue(&self, event: PlayerLeftQueue) -> Result<()> {
        let envelope = MessageEnvelope::new(event, PLAYER_LEFT_ROUTING_KEY.to_string());
        self.publish_to_exchange(QUEUE_EVENTS_EXCHANGE, &envelope)
            .await
    }

    async fn publish_team_matched(&self, event: TeamMatched) -> Result<()> {
        // Keyed by team so a retried settle never announces a team twice
        let correlation_id = format!("team-{}", event.team.id);
        let envelope = MessageEnvelope::with_correlation_id(
            event,
            TEAM_MATCHED_ROUTING_KEY.to_string(),
            correlation_id,
        );
        self.publish_to_exchange(TEAM_EVENTS_EXCHANGE, &envelope)
            .await
    }

    async fn publish_platform_request(&self, request: PlatformRequest) -> Result<()> {
        let routing_key = MessageUtils::platform_routing_key(&request).to_string();
        let envelope = MessageEnvelope::new(request, routing_key);
        self.publish_to_exchange(PLATFORM_REQUESTS_EXCHANGE, &envelope)
            .await
    }
}

/// Mock event publisher that records everything it is given
#[derive(Debug, Default)]
pub struct MockEventPublisher {
    published_events: Mutex<Vec<AmqpMessage>>,
}

impl MockEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, message: AmqpMessage) {
        if let Ok(mut events) = self.published_events.lock() {
            events.push(message);
        }
    }

    /// All published messages in publish order
    pub fn get_published_events(&self) -> Vec<AmqpMessage> {
        self.published_events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Teams announced so far
    pub fn matched_teams(&self) -> Vec<Team> {
        self.get_published_events()
            .into_iter()
            .filter_map(|message| match message {
                AmqpMessage::TeamMatched(event) => Some(event.team),
                _ => None,
            })
            .collect()
    }

    /// Platform requests issued so far
    pub fn platform_requests(&self) -> Vec<PlatformRequest> {
        self.get_published_events()
            .into_iter()
            .filter_map(|message| match message {
                AmqpMessage::Platform(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    /// Count messages whose routing key matches
    pub fn count_events(&self, routing_key: &str) -> usize {
        self.get_published_events()
            .iter()
            .filter(|message| MessageUtils::get_routing_key(message) == routing_key)
            .count()
    }

    pub fn clear_events(&self) {
        if let Ok(mut events) = self.published_events.lock() {
            events.clear();
        }
    }
}

#[async_trait]
impl EventPublisher for MockEventPublisher {
    async fn publish_player_queued(&self, event: PlayerQueued) -> Result<()> {
        self.record(AmqpMessage::PlayerQueued(event));
        Ok(())
    }

    async fn publish_player_left_queue(&self, event: PlayerLeftQueue) -> Result<()> {
        self.record(AmqpMessage::PlayerLeftQueue(event));
        Ok(())
    }

    async fn publish_team_matched(&self, event: TeamMatched) -> Result<()> {
        self.record(AmqpMessage::TeamMatched(event));
        Ok(())
    }

    async fn publish_platform_request(&self, request: PlatformRequest) -> Result<()> {
        self.record(AmqpMessage::Platform(request));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils;

    #[test]
    fn test_publisher_config_default() {
        let config = PublisherConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay_ms, 500);
        assert!(config.enable_deduplication);
    }

    #[tokio::test]
    async fn test_mock_publisher_records_in_order() {
        let publisher = MockEventPublisher::new();
        publisher
            .publish_player_queued(PlayerQueued {
                server_id: "s1".to_string(),
                user_id: "u1".to_string(),
                modes: vec![Mode::Twos],
                bracket: Bracket::Low,
                timestamp: utils::current_timestamp(),
            })
            .await
            .unwrap();
        publisher
            .publish_platform_request(PlatformRequest::DeleteChannel {
                server_id: "s1".to_string(),
                channel_id: "c1".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(publisher.get_published_events().len(), 2);
        assert_eq!(publisher.count_events(PLAYER_QUEUED_ROUTING_KEY), 1);
        assert_eq!(publisher.platform_requests().len(), 1);
        assert!(publisher.matched_teams().is_empty());

        publisher.clear_events();
        assert!(publisher.get_published_events().is_empty());
    }
}
