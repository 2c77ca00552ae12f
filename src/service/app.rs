//! Main application state and service coordination
//!
//! [`ServiceCore`] owns the shared components and routes inbound commands.
//! [`AppState`] adds the runtime around it: the AMQP consumer, the health server
//! and the background tasks that trigger matchmaking passes.

use crate::amqp::connection::{AmqpConfig, AmqpConnection};
use crate::amqp::handlers::{CommandConsumer, MessageHandler};
use crate::amqp::messages::MessageUtils;
use crate::amqp::publisher::{AmqpEventPublisher, EventPublisher, MockEventPublisher, PublisherConfig};
use crate::config::AppConfig;
use crate::error::{MatchmakingError, Result as MatchmakingResult};
use crate::matchmaking::{MatchmakingEngine, PassCoordinator, TriggerOutcome};
use crate::metrics::health::HealthServerConfig;
use crate::metrics::{HealthServer, MetricsCollector, MetricsService};
use crate::platform::{EventVoiceGateway, PresenceRegistry};
use crate::queue::{ChangeKind, InMemoryQueueStore, JoinOutcome, QueueService, QueueStore};
use crate::service::health::HealthCheck;
use crate::types::{AmqpMessage, LeaveQueueRequest, ServerId};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

/// Service-level errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("AMQP connection error: {message}")]
    AmqpConnection { message: String },

    #[error("Service initialization error: {message}")]
    Initialization { message: String },

    #[error("Background task error: {message}")]
    BackgroundTask { message: String },
}

/// Shared service components
pub struct ServiceCore {
    config: AppConfig,
    store: Arc<dyn QueueStore>,
    presence: Arc<PresenceRegistry>,
    gateway: Arc<EventVoiceGateway>,
    engine: Arc<MatchmakingEngine>,
    coordinator: Arc<PassCoordinator>,
    queue_service: Arc<QueueService>,
    metrics: Arc<MetricsCollector>,
    amqp_connection: Option<Arc<AmqpConnection>>,
    is_running: RwLock<bool>,
    started_at: Instant,
}

impl ServiceCore {
    /// Wire every component around the given publisher
    pub fn new(
        config: AppConfig,
        publisher: Arc<dyn EventPublisher>,
        amqp_connection: Option<Arc<AmqpConnection>>,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self, ServiceError> {
        let store: Arc<dyn QueueStore> = Arc::new(InMemoryQueueStore::default());
        let presence = Arc::new(PresenceRegistry::new());
        let gateway = Arc::new(EventVoiceGateway::new(publisher.clone(), presence.clone()));

        let engine = Arc::new(
            MatchmakingEngine::with_metrics(
                store.clone(),
                presence.clone(),
                gateway.clone(),
                gateway.clone(),
                publisher.clone(),
                config.engine_config(),
                metrics.clone(),
            )
            .map_err(|e| ServiceError::Initialization {
                message: format!("Failed to initialize matchmaking engine: {}", e),
            })?,
        );
        let coordinator = Arc::new(PassCoordinator::new(engine.clone()));
        let queue_service = Arc::new(QueueService::new(
            store.clone(),
            engine.classifier().clone(),
            publisher,
            metrics.clone(),
        ));

        Ok(Self {
            config,
            store,
            presence,
            gateway,
            engine,
            coordinator,
            queue_service,
            metrics,
            amqp_connection,
            is_running: RwLock::new(false),
            started_at: Instant::now(),
        })
    }

    /// Components backed by a recording publisher and no broker
    pub fn dry_run(config: AppConfig) -> Result<Self, ServiceError> {
        let metrics = Arc::new(MetricsCollector::new().map_err(|e| {
            ServiceError::Initialization {
                message: format!("Failed to create metrics collector: {}", e),
            }
        })?);
        Self::new(config, Arc::new(MockEventPublisher::new()), None, metrics)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub fn presence(&self) -> &Arc<PresenceRegistry> {
        &self.presence
    }

    pub fn engine(&self) -> &Arc<MatchmakingEngine> {
        &self.engine
    }

    pub fn coordinator(&self) -> &Arc<PassCoordinator> {
        &self.coordinator
    }

    pub fn queue_service(&self) -> &Arc<QueueService> {
        &self.queue_service
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    pub fn amqp_connection(&self) -> Option<&Arc<AmqpConnection>> {
        self.amqp_connection.as_ref()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub async fn set_running(&self, running: bool) {
        *self.is_running.write().await = running;
    }

    /// Ask for a pass unless store changes already trigger one
    fn request_pass(&self, server_id: &str) {
        if self.config.matchmaking.trigger_on_store_changes {
            return;
        }
        if let Err(e) = self.coordinator.trigger(server_id) {
            error!("Failed to trigger pass for server {}: {}", server_id, e);
        }
    }

    /// Route one inbound command
    pub async fn handle_command(&self, command: AmqpMessage) -> MatchmakingResult<()> {
        match command {
            AmqpMessage::JoinQueue(request) => {
                let server_id = request.server_id.clone();
                if request.in_voice {
                    self.presence.mark_connected(&server_id, &request.user_id)?;
                }
                if let JoinOutcome::Joined { .. } = self.queue_service.join(request).await? {
                    self.request_pass(&server_id);
                }
                Ok(())
            }
            AmqpMessage::LeaveQueue(request) => {
                self.queue_service.leave(request).await?;
                Ok(())
            }
            AmqpMessage::TogglePreference(request) => {
                self.queue_service.toggle_preference(request).await?;
                Ok(())
            }
            AmqpMessage::SetCategory(request) => {
                let server_id = request.server_id.clone();
                self.queue_service.set_category(request).await?;
                self.request_pass(&server_id);
                Ok(())
            }
            AmqpMessage::VoiceState(update) => {
                let transition = self.presence.apply_voice_update(&update)?;
                if transition.disconnected {
                    self.queue_service
                        .handle_voice_disconnect(&update.server_id, &update.user_id)
                        .await?;
                }
                if let Some(channel_id) = transition.vacated_team_channel {
                    self.delete_team_channel(&update.server_id, &channel_id).await;
                }
                Ok(())
            }
            AmqpMessage::Membership(update) => {
                self.presence
                    .set_member(&update.server_id, &update.user_id, update.present)?;
                if !update.present {
                    self.queue_service
                        .leave(LeaveQueueRequest {
                            server_id: update.server_id,
                            user_id: update.user_id,
                            timestamp: update.timestamp,
                        })
                        .await?;
                }
                Ok(())
            }
            other => Err(MatchmakingError::InvalidQueueRequest {
                reason: format!(
                    "{} is not accepted on the command queue",
                    MessageUtils::get_routing_key(&other)
                ),
            }
            .into()),
        }
    }

    async fn delete_team_channel(&self, server_id: &str, channel_id: &str) {
        use crate::platform::ChannelProvisioner;

        match self.gateway.delete_channel(server_id, channel_id).await {
            Ok(()) => {
                self.metrics.record_channel_deleted();
                info!("Deleted empty team channel {} in server {}", channel_id, server_id);
            }
            Err(e) => warn!(
                "Failed to delete empty team channel {} in server {}: {}",
                channel_id, server_id, e
            ),
        }
    }

    /// Trigger a pass for every known server
    pub async fn sweep(&self) -> MatchmakingResult<usize> {
        let servers: Vec<ServerId> = self.store.list_servers().await?;
        Ok(self.coordinator.trigger_all(&servers))
    }

    /// Wait until no pass is in flight, up to `timeout`
    pub async fn drain_passes(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.coordinator.in_flight() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        true
    }
}

/// Production message handler that routes commands into the service core
struct ProductionMessageHandler {
    core: Arc<ServiceCore>,
}

impl ProductionMessageHandler {
    fn new(core: Arc<ServiceCore>) -> Self {
        Self { core }
    }
}

#[async_trait]
impl MessageHandler for ProductionMessageHandler {
    async fn handle_command(&self, command: AmqpMessage) -> MatchmakingResult<()> {
        let start_time = std::time::Instant::now();
        let kind = MessageUtils::get_routing_key(&command);
        let metrics = self.core.metrics();

        let result = self.core.handle_command(command).await;
        let elapsed = start_time.elapsed();
        metrics.record_command(kind, elapsed);

        match &result {
            Ok(()) => debug!(
                "Command {} handled in {:.2}ms",
                kind,
                elapsed.as_secs_f64() * 1000.0
            ),
            Err(e) => {
                let rejected = e
                    .downcast_ref::<MatchmakingError>()
                    .is_some_and(|err| !err.is_retryable());
                if rejected {
                    info!("Command {} rejected: {}", kind, e);
                } else {
                    error!("Command {} failed: {}", kind, e);
                }
            }
        }
        result
    }

    async fn handle_error(&self, error: MatchmakingError, message_data: &[u8]) {
        self.core
            .metrics()
            .service()
            .amqp_errors_total
            .with_label_values(&["command"])
            .inc();

        if !message_data.is_empty() {
            let preview_len = std::cmp::min(100, message_data.len());
            let preview = String::from_utf8_lossy(&message_data[..preview_len]);
            debug!("Failed command ({}): {:?}", error, preview);
        }
    }
}

/// Main application state containing all service components
pub struct AppState {
    core: Arc<ServiceCore>,

    /// Metrics service for monitoring and health checks
    metrics_service: Arc<MetricsService>,

    /// Background task handles
    background_tasks: Vec<JoinHandle<()>>,

    /// AMQP consumer for commands
    command_consumer: Option<CommandConsumer>,
}

impl AppState {
    /// Initialize the application with all dependencies
    pub async fn new(config: AppConfig) -> Result<Self, ServiceError> {
        info!("Initializing huddle matchmaking service");
        info!(
            "Configuration: service={}, amqp_url={}",
            config.service.name, config.amqp.url
        );

        let amqp_connection = Self::initialize_amqp(&config).await?;
        let metrics_collector = Self::initialize_metrics_collector()?;

        let channel = amqp_connection
            .open_channel()
            .await
            .map_err(|e| ServiceError::Initialization {
                message: format!("Failed to open publisher channel: {}", e),
            })?;
        let publisher_config = PublisherConfig {
            max_retries: config.amqp.max_retry_attempts,
            retry_delay_ms: config.amqp.retry_delay_ms,
            ..PublisherConfig::default()
        };
        let publisher = Arc::new(
            AmqpEventPublisher::new(channel, publisher_config)
                .await
                .map_err(|e| ServiceError::Initialization {
                    message: format!("Failed to initialize event publisher: {}", e),
                })?,
        );

        let core = Arc::new(ServiceCore::new(
            config,
            publisher,
            Some(amqp_connection),
            metrics_collector,
        )?);
        Ok(Self::with_core(core))
    }

    /// Initialize without a broker; events are recorded in memory
    pub fn dry_run(config: AppConfig) -> Result<Self, ServiceError> {
        let core = Arc::new(ServiceCore::dry_run(config)?);
        Ok(Self::with_core(core))
    }

    fn with_core(core: Arc<ServiceCore>) -> Self {
        let metrics_service = Self::initialize_metrics_service(&core);
        Self {
            core,
            metrics_service,
            background_tasks: Vec::new(),
            command_consumer: None,
        }
    }

    /// Start all background services and message consumption
    pub async fn start(&mut self) -> Result<(), ServiceError> {
        info!("Starting huddle matchmaking service");

        self.core.set_running(true).await;
        self.start_metrics_service().await;
        self.start_amqp_consumption().await?;
        self.start_background_tasks();

        info!("Huddle matchmaking service started");
        Ok(())
    }

    /// Perform graceful shutdown
    pub async fn shutdown(&mut self) -> Result<(), ServiceError> {
        info!("Starting graceful shutdown of huddle service");

        self.core.set_running(false).await;

        if let Some(consumer) = &self.command_consumer {
            if let Err(e) = consumer.stop_consuming().await {
                warn!("Failed to stop AMQP consumer: {}", e);
            } else {
                info!("AMQP command consumption stopped");
            }
        }

        self.stop_background_tasks().await;

        let timeout = self.core.config().shutdown_timeout();
        if !self.core.drain_passes(timeout).await {
            warn!(
                "{} passes still running after {:?}",
                self.core.coordinator().in_flight(),
                timeout
            );
        }

        if self.core.config().service.clear_queues_on_shutdown {
            match self.core.queue_service().clear_all_queues().await {
                Ok(cleared) => info!("Cleared {} queued players on shutdown", cleared),
                Err(e) => warn!("Failed to clear queues on shutdown: {}", e),
            }
        }

        if let Err(e) = self.metrics_service.stop().await {
            warn!("Failed to stop metrics service: {}", e);
        }

        let final_stats = self
            .core
            .engine()
            .get_stats()
            .map_err(|e| ServiceError::BackgroundTask {
                message: format!("Failed to get final stats: {}", e),
            })?;
        info!("Final matchmaking statistics: {:?}", final_stats);
        info!("Huddle service shutdown completed");

        Ok(())
    }

    pub fn core(&self) -> Arc<ServiceCore> {
        self.core.clone()
    }

    pub fn config(&self) -> &AppConfig {
        self.core.config()
    }

    pub async fn is_running(&self) -> bool {
        self.core.is_running().await
    }

    pub fn metrics_service(&self) -> Arc<MetricsService> {
        self.metrics_service.clone()
    }

    fn initialize_metrics_collector() -> Result<Arc<MetricsCollector>, ServiceError> {
        MetricsCollector::new()
            .map(Arc::new)
            .map_err(|e| ServiceError::Initialization {
                message: format!("Failed to create metrics collector: {}", e),
            })
    }

    fn initialize_metrics_service(core: &Arc<ServiceCore>) -> Arc<MetricsService> {
        let service = &core.config().service;
        let collector = core.metrics();

        let health_server = Arc::new(
            HealthServer::new(
                HealthServerConfig {
                    port: service.health_port,
                    host: "0.0.0.0".to_string(),
                },
                collector.clone(),
            )
            .with_core(core.clone()),
        );

        let metrics_server = service
            .metrics_port
            .filter(|port| *port != service.health_port)
            .map(|port| {
                Arc::new(HealthServer::new(
                    HealthServerConfig {
                        port,
                        host: "0.0.0.0".to_string(),
                    },
                    collector.clone(),
                ))
            });

        Arc::new(MetricsService::new(collector, health_server).with_metrics_server(metrics_server))
    }

    async fn start_metrics_service(&mut self) {
        let metrics_service = self.metrics_service.clone();
        let port = self.core.config().service.health_port;

        let metrics_handle = tokio::spawn(async move {
            if let Err(e) = metrics_service.start().await {
                error!("Metrics service failed: {}", e);
            } else {
                info!("Metrics service task completed");
            }
        });
        self.background_tasks.push(metrics_handle);

        // Give the server a moment to bind
        tokio::time::sleep(Duration::from_millis(100)).await;
        info!("Health endpoints started on port {}", port);
    }

    /// Connect to the broker named by the configured URL
    async fn initialize_amqp(config: &AppConfig) -> Result<Arc<AmqpConnection>, ServiceError> {
        info!("Connecting to AMQP broker: {}", config.amqp.url);

        let amqp_config = AmqpConfig::from_url(&config.amqp.url)
            .map_err(|e| ServiceError::Configuration {
                message: format!("Failed to parse AMQP URL: {}", e),
            })?
            .with_retries(config.amqp.max_retry_attempts, config.amqp.retry_delay_ms);
        let amqp_config = AmqpConfig {
            connection_timeout_ms: config.amqp_connection_timeout().as_millis() as u64,
            ..amqp_config
        };

        let connection =
            AmqpConnection::new(amqp_config)
                .await
                .map_err(|e| ServiceError::AmqpConnection {
                    message: format!("Failed to connect to AMQP: {}", e),
                })?;

        Ok(Arc::new(connection))
    }

    async fn start_amqp_consumption(&mut self) -> Result<(), ServiceError> {
        let connection = match self.core.amqp_connection() {
            Some(connection) => connection.clone(),
            None => {
                info!("No AMQP connection, skipping command consumption");
                return Ok(());
            }
        };
        let amqp = &self.core.config().amqp;

        let channel = connection
            .open_channel()
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to open consumer channel: {}", e),
            })?;
        connection
            .declare_command_queue(&channel, &amqp.command_queue, &amqp.command_exchange)
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to declare command queue: {}", e),
            })?;

        let handler = Arc::new(ProductionMessageHandler::new(self.core.clone()));
        let consumer = CommandConsumer::new(handler, channel, amqp.max_retry_attempts);
        consumer
            .start_consuming(&amqp.command_queue)
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to start consuming commands: {}", e),
            })?;

        info!(
            "Listening for commands on queue '{}'",
            self.core.config().amqp.command_queue
        );
        self.command_consumer = Some(consumer);
        Ok(())
    }

    fn start_background_tasks(&mut self) {
        if self.core.config().matchmaking.trigger_on_store_changes {
            self.background_tasks
                .push(tokio::spawn(run_change_listener(self.core.clone())));
        }
        self.background_tasks
            .push(tokio::spawn(run_sweep(self.core.clone())));
        self.background_tasks
            .push(tokio::spawn(run_health_metrics(self.core.clone())));

        info!(
            "{} background tasks started",
            self.background_tasks.len()
        );
    }

    async fn stop_background_tasks(&mut self) {
        let task_count = self.background_tasks.len();
        if task_count == 0 {
            return;
        }

        info!("Stopping {} background tasks...", task_count);
        for task in self.background_tasks.drain(..) {
            task.abort();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Start a pass whenever a user write changes a server document.
///
/// Writes made by the matchmaker itself are ignored so a pass does not retrigger
/// itself.
pub async fn run_change_listener(core: Arc<ServiceCore>) {
    let mut changes = BroadcastStream::new(core.store().subscribe());
    info!("Queue change listener started");

    while let Some(change) = changes.next().await {
        match change {
            Ok(change) if change.kind == ChangeKind::Document => {
                match core.coordinator().trigger(&change.server_id) {
                    Ok(TriggerOutcome::Started(_)) => {
                        debug!("Pass started for server {}", change.server_id)
                    }
                    Ok(TriggerOutcome::Coalesced) => {}
                    Err(e) => error!(
                        "Failed to trigger pass for server {}: {}",
                        change.server_id, e
                    ),
                }
            }
            Ok(_) => {}
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                warn!("Change listener lagged by {} events, sweeping all servers", missed);
                if let Err(e) = core.sweep().await {
                    error!("Sweep after lag failed: {}", e);
                }
            }
        }
    }

    info!("Queue change listener stopped");
}

async fn run_sweep(core: Arc<ServiceCore>) {
    let mut interval = tokio::time::interval(core.config().sweep_interval());
    // The first tick completes immediately
    interval.tick().await;

    while core.is_running().await {
        interval.tick().await;
        match core.sweep().await {
            Ok(started) => debug!("Sweep started {} passes", started),
            Err(e) => warn!("Sweep failed: {}", e),
        }
    }
}

async fn run_health_metrics(core: Arc<ServiceCore>) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    let metrics = core.metrics();

    while core.is_running().await {
        interval.tick().await;

        metrics
            .service()
            .uptime_seconds
            .set(core.uptime().as_secs() as i64);

        match HealthCheck::check(core.clone()).await {
            Ok(health) => {
                metrics.update_health_status(health.status.as_gauge());
                for check in &health.checks {
                    metrics.update_component_health(
                        &check.name,
                        check.status != crate::service::health::HealthStatus::Unhealthy,
                    );
                }
            }
            Err(e) => warn!("Health metrics update failed: {}", e),
        }
    }
}
