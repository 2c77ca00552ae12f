//! AMQP message handlers for processing queue commands
//!
//! This module provides the command consumer for the matchmaking service,
//! including acknowledgement, redelivery of transient failures and dead lettering.

use crate::amqp::messages::MessageUtils;
use crate::error::{MatchmakingError, Result};
use crate::types::AmqpMessage;
use amqprs::{
    channel::{
        BasicAckArguments, BasicCancelArguments, BasicConsumeArguments, BasicRejectArguments,
        Channel,
    },
    consumer::AsyncConsumer,
    BasicProperties, Deliver,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Trait defining the interface for handling inbound commands
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle a validated command
    async fn handle_command(&self, command: AmqpMessage) -> Result<()>;

    /// Handle processing errors
    async fn handle_error(&self, error: MatchmakingError, message_data: &[u8]);
}

/// What to do with a delivery that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed, or rejected for a reason redelivery would not fix
    Ack,
    /// Put back on the queue for another attempt
    Requeue,
    /// Reject without requeue so the broker dead-letters it
    DeadLetter,
}

/// Tracks redelivery attempts per message
#[derive(Debug)]
pub struct DeadLetterHandler {
    retry_attempts: HashMap<String, u32>,
    max_retries: u32,
}

impl DeadLetterHandler {
    pub fn new(max_retries: u32) -> Self {
        Self {
            retry_attempts: HashMap::new(),
            max_retries,
        }
    }

    /// Record a transient failure and decide between requeue and dead letter
    pub fn handle_failed_message(&mut self, message_id: &str, error: &MatchmakingError) -> Disposition {
        let retry_count = self
            .retry_attempts
            .entry(message_id.to_string())
            .or_insert(0);
        *retry_count += 1;

        if *retry_count <= self.max_retries {
            warn!(
                "Message {} failed (attempt {}), will retry: {}",
                message_id, retry_count, error
            );
            return Disposition::Requeue;
        }

        error!(
            "Message {} exceeded max retries ({}), dead lettering: {}",
            message_id, self.max_retries, error
        );
        self.retry_attempts.remove(message_id);
        Disposition::DeadLetter
    }

    /// Forget a message once it was processed
    pub fn clear(&mut self, message_id: &str) {
        self.retry_attempts.remove(message_id);
    }

    pub fn pending(&self) -> usize {
        self.retry_attempts.len()
    }
}

/// Classify the result of handling one delivery
pub fn disposition_for(
    result: &Result<()>,
    message_id: &str,
    dead_letters: &mut DeadLetterHandler,
) -> Disposition {
    match result {
        Ok(()) => {
            dead_letters.clear(message_id);
            Disposition::Ack
        }
        Err(e) => match e.downcast_ref::<MatchmakingError>() {
            Some(err) if err.is_retryable() => dead_letters.handle_failed_message(message_id, err),
            Some(_) => {
                dead_letters.clear(message_id);
                Disposition::Ack
            }
            None => dead_letters.handle_failed_message(
                message_id,
                &MatchmakingError::InternalError {
                    message: e.to_string(),
                },
            ),
        },
    }
}

/// Consumer for the command queue
pub struct CommandConsumer {
    handler: Arc<dyn MessageHandler>,
    channel: Channel,
    consumer_tag: String,
    max_retries: u32,
}

impl CommandConsumer {
    /// Create a new command consumer
    pub fn new(handler: Arc<dyn MessageHandler>, channel: Channel, max_retries: u32) -> Self {
        let consumer_tag = format!("huddle-consumer-{}", uuid::Uuid::new_v4());

        Self {
            handler,
            channel,
            consumer_tag,
            max_retries,
        }
    }

    /// Start consuming messages from the queue
    pub async fn start_consuming(&self, queue_name: &str) -> Result<()> {
        let args = BasicConsumeArguments::new(queue_name, &self.consumer_tag);

        self.channel
            .basic_consume(
                QueueConsumer::new(self.handler.clone(), self.max_retries),
                args,
            )
            .await
            .map_err(|e| MatchmakingError::AmqpConnectionFailed {
                message: format!("Failed to start consuming: {}", e),
            })?;

        info!("Started consuming commands from queue: {}", queue_name);
        Ok(())
    }

    /// Stop consuming messages
    pub async fn stop_consuming(&self) -> Result<()> {
        let args = BasicCancelArguments::new(&self.consumer_tag);

        self.channel.basic_cancel(args).await.map_err(|e| {
            MatchmakingError::AmqpConnectionFailed {
                message: format!("Failed to stop consuming: {}", e),
            }
        })?;

        info!("Stopped consuming commands");
        Ok(())
    }
}

/// Internal consumer implementation
struct QueueConsumer {
    handler: Arc<dyn MessageHandler>,
    dead_letters: DeadLetterHandler,
}

impl QueueConsumer {
    fn new(handler: Arc<dyn MessageHandler>, max_retries: u32) -> Self {
        Self {
            handler,
            dead_letters: DeadLetterHandler::new(max_retries),
        }
    }

    /// Decode and dispatch one delivery
    async fn process_message(&mut self, message_id: &str, content: &[u8]) -> Disposition {
        let command = match MessageUtils::deserialize_command(content) {
            Ok(command) => command,
            Err(e) => {
                warn!("Dead lettering malformed command {}: {}", message_id, e);
                self.handler
                    .handle_error(
                        MatchmakingError::InvalidQueueRequest {
                            reason: e.to_string(),
                        },
                        content,
                    )
                    .await;
                return Disposition::DeadLetter;
            }
        };

        debug!(
            "Command {} parsed - routing_key: '{}'",
            message_id,
            MessageUtils::get_routing_key(&command)
        );
        let result = self.handler.handle_command(command).await;
        if let Err(e) = &result {
            warn!("Command {} failed: {}", message_id, e);
            self.handler
                .handle_error(
                    MatchmakingError::InternalError {
                        message: e.to_string(),
                    },
                    content,
                )
                .await;
        }
        disposition_for(&result, message_id, &mut self.dead_letters)
    }
}

#[async_trait]
impl AsyncConsumer for QueueConsumer {
    async fn consume(
        &mut self,
        channel: &Channel,
        deliver: Deliver,
        basic_properties: BasicProperties,
        content: Vec<u8>,
    ) {
        let delivery_tag = deliver.delivery_tag();
        let message_id = basic_properties
            .message_id()
            .cloned()
            .unwrap_or_else(|| format!("delivery-{}", delivery_tag));
        let start_time = std::time::Instant::now();

        let disposition = self.process_message(&message_id, &content).await;
        debug!(
            "Command {} settled as {:?} after {:.2}ms",
            message_id,
            disposition,
            start_time.elapsed().as_secs_f64() * 1000.0
        );

        let outcome = match disposition {
            Disposition::Ack => {
                channel
                    .basic_ack(BasicAckArguments::new(delivery_tag, false))
                    .await
            }
            Disposition::Requeue => {
                channel
                    .basic_reject(BasicRejectArguments::new(delivery_tag, true))
                    .await
            }
            Disposition::DeadLetter => {
                channel
                    .basic_reject(BasicRejectArguments::new(delivery_tag, false))
                    .await
            }
        };
        if let Err(e) = outcome {
            error!(
                "Failed to settle delivery {} ({:?}): {}",
                delivery_tag, disposition, e
            );
        }
    }
}

/// Mock message handler for testing
pub struct MockMessageHandler {
    pub received_commands: Arc<tokio::sync::Mutex<Vec<AmqpMessage>>>,
}

impl Default for MockMessageHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMessageHandler {
    pub fn new() -> Self {
        Self {
            received_commands: Arc::new(tokio::sync::Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl MessageHandler for MockMessageHandler {
    async fn handle_command(&self, command: AmqpMessage) -> Result<()> {
        let mut commands = self.received_commands.lock().await;
        commands.push(command);
        Ok(())
    }

    async fn handle_error(&self, error: MatchmakingError, _message_data: &[u8]) {
        warn!("Mock handler received error: {}", error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LeaveQueueRequest;

    fn leave_command() -> AmqpMessage {
        AmqpMessage::LeaveQueue(LeaveQueueRequest {
            server_id: "s1".to_string(),
            user_id: "u1".to_string(),
            timestamp: crate::utils::current_timestamp(),
        })
    }

    #[tokio::test]
    async fn test_mock_handler() {
        let handler = MockMessageHandler::new();
        handler.handle_command(leave_command()).await.unwrap();

        let received = handler.received_commands.lock().await;
        assert_eq!(received.len(), 1);
        assert!(matches!(received[0], AmqpMessage::LeaveQueue(_)));
    }

    #[test]
    fn test_business_rejections_are_acked() {
        let mut dead_letters = DeadLetterHandler::new(2);
        let result: Result<()> = Err(MatchmakingError::NotInVoiceChannel {
            user_id: "u1".to_string(),
        }
        .into());
        assert_eq!(
            disposition_for(&result, "m1", &mut dead_letters),
            Disposition::Ack
        );
        assert_eq!(dead_letters.pending(), 0);
    }

    #[test]
    fn test_transient_failures_retry_then_dead_letter() {
        let mut dead_letters = DeadLetterHandler::new(2);
        let failing = || -> Result<()> {
            Err(MatchmakingError::InternalError {
                message: "store unavailable".to_string(),
            }
            .into())
        };

        assert_eq!(
            disposition_for(&failing(), "m1", &mut dead_letters),
            Disposition::Requeue
        );
        assert_eq!(
            disposition_for(&failing(), "m1", &mut dead_letters),
            Disposition::Requeue
        );
        assert_eq!(
            disposition_for(&failing(), "m1", &mut dead_letters),
            Disposition::DeadLetter
        );
        assert_eq!(dead_letters.pending(), 0);
    }

    #[test]
    fn test_success_clears_retry_state() {
        let mut dead_letters = DeadLetterHandler::new(3);
        let failed: Result<()> = Err(anyhow::anyhow!("decode failure"));
        assert_eq!(
            disposition_for(&failed, "m1", &mut dead_letters),
            Disposition::Requeue
        );
        assert_eq!(dead_letters.pending(), 1);
        assert_eq!(
            disposition_for(&Ok(()), "m1", &mut dead_letters),
            Disposition::Ack
        );
        assert_eq!(dead_letters.pending(), 0);
    }
}
