//! Metrics and monitoring for the huddle matchmaking service
//!
//! This module provides metrics collection, health monitoring,
//! and performance tracking for the matchmaking service.

pub mod collector;
pub mod health;

pub use collector::{
    MatchmakingMetrics, MetricsCollector, PerformanceMetrics, PlatformMetrics, QueueMetrics,
    ServiceMetrics,
};
pub use health::HealthServer;

use std::sync::Arc;
use tracing::info;

/// Unified metrics service that combines all monitoring capabilities
#[derive(Clone)]
pub struct MetricsService {
    collector: Arc<MetricsCollector>,
    health_server: Arc<HealthServer>,
    /// Separate scrape endpoint when a dedicated metrics port is configured
    metrics_server: Option<Arc<HealthServer>>,
}

impl MetricsService {
    /// Create a new metrics service
    pub fn new(collector: Arc<MetricsCollector>, health_server: Arc<HealthServer>) -> Self {
        Self {
            collector,
            health_server,
            metrics_server: None,
        }
    }

    pub fn with_metrics_server(mut self, metrics_server: Option<Arc<HealthServer>>) -> Self {
        self.metrics_server = metrics_server;
        self
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    pub fn health_server(&self) -> Arc<HealthServer> {
        self.health_server.clone()
    }

    /// Serve the health endpoints, and the metrics endpoint if it has its own port
    pub async fn start(&self) -> anyhow::Result<()> {
        match &self.metrics_server {
            Some(metrics_server) => {
                info!("Serving metrics separately on port {}", metrics_server.port());
                tokio::try_join!(self.health_server.start(), metrics_server.start())?;
                Ok(())
            }
            None => self.health_server.start().await,
        }
    }

    /// Stop the metrics service
    pub async fn stop(&self) -> anyhow::Result<()> {
        if let Some(metrics_server) = &self.metrics_server {
            metrics_server.stop().await?;
        }
        self.health_server.stop().await
    }
}
