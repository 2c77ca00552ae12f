//! Health checks and monitoring
//!
//! This module provides health check functionality for the huddle service,
//! including readiness and liveness probes.

use crate::service::app::ServiceCore;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

/// Health check status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Gauge value (0=unhealthy, 1=degraded, 2=healthy)
    pub fn as_gauge(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 2,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 0,
        }
    }

    fn worst(self, other: &HealthStatus) -> HealthStatus {
        match (&self, other) {
            (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
            (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Overall service status
    pub status: HealthStatus,
    /// Service name
    pub service: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Detailed component checks
    pub checks: Vec<ComponentCheck>,
    /// Service statistics
    pub stats: ServiceStats,
}

/// Individual component health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentCheck {
    pub name: String,
    pub status: HealthStatus,
    /// Optional error message if not healthy
    pub message: Option<String>,
    /// Check duration in milliseconds
    pub duration_ms: u64,
}

/// Service statistics for health reporting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStats {
    /// Servers with a queue document
    pub servers: usize,
    /// Queue slots across all servers and modes
    pub queued_slots: usize,
    /// Servers with a pass in flight
    pub passes_in_flight: usize,
    pub passes_completed: u64,
    pub teams_matched: u64,
    pub players_matched: u64,
    pub uptime_seconds: u64,
}

impl HealthCheck {
    /// Perform a comprehensive health check of the service
    pub async fn check(core: Arc<ServiceCore>) -> Result<Self> {
        let mut checks = Vec::new();

        checks.push(Self::check_service_running(&core).await);
        checks.push(Self::check_queue_store(&core).await);
        checks.push(Self::check_matchmaker(&core));
        checks.push(Self::check_amqp_health(&core));

        let status = checks
            .iter()
            .fold(HealthStatus::Healthy, |acc, check| acc.worst(&check.status));
        let stats = Self::gather_service_stats(&core).await;

        Ok(HealthCheck {
            status,
            service: core.config().service.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now(),
            checks,
            stats,
        })
    }

    /// Simple liveness check - just verify service is running
    pub async fn liveness_check(core: Arc<ServiceCore>) -> Result<HealthStatus> {
        if core.is_running().await {
            Ok(HealthStatus::Healthy)
        } else {
            Ok(HealthStatus::Unhealthy)
        }
    }

    /// Readiness check - verify service can handle commands
    pub async fn readiness_check(core: Arc<ServiceCore>) -> Result<HealthStatus> {
        if !core.is_running().await {
            return Ok(HealthStatus::Unhealthy);
        }

        let store = Self::check_queue_store(&core).await.status;
        let amqp = Self::check_amqp_health(&core).status;
        Ok(store.worst(&amqp))
    }

    async fn check_service_running(core: &ServiceCore) -> ComponentCheck {
        let start = std::time::Instant::now();

        let (status, message) = if core.is_running().await {
            (HealthStatus::Healthy, None)
        } else {
            (
                HealthStatus::Unhealthy,
                Some("Service is not running".to_string()),
            )
        };

        ComponentCheck {
            name: "service_running".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn check_queue_store(core: &ServiceCore) -> ComponentCheck {
        let start = std::time::Instant::now();

        let (status, message) = match core.store().list_servers().await {
            Ok(_) => (HealthStatus::Healthy, None),
            Err(e) => {
                error!("Queue store health check failed: {}", e);
                (
                    HealthStatus::Unhealthy,
                    Some(format!("Queue store unavailable: {}", e)),
                )
            }
        };

        ComponentCheck {
            name: "queue_store".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    fn check_matchmaker(core: &ServiceCore) -> ComponentCheck {
        let start = std::time::Instant::now();

        let (status, message) = match core.engine().get_stats() {
            Ok(stats) if stats.failed_brackets > 0 => (
                HealthStatus::Degraded,
                Some(format!("{} bracket tasks have failed", stats.failed_brackets)),
            ),
            Ok(_) => (HealthStatus::Healthy, None),
            Err(e) => (
                HealthStatus::Unhealthy,
                Some(format!("Engine stats unavailable: {}", e)),
            ),
        };

        ComponentCheck {
            name: "matchmaker".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    fn check_amqp_health(core: &ServiceCore) -> ComponentCheck {
        let start = std::time::Instant::now();

        let (status, message) = match core.amqp_connection() {
            Some(connection) if connection.is_alive() => (HealthStatus::Healthy, None),
            Some(_) => (
                HealthStatus::Unhealthy,
                Some("AMQP connection is closed".to_string()),
            ),
            None => (
                HealthStatus::Degraded,
                Some("Running without a broker (dry run)".to_string()),
            ),
        };

        ComponentCheck {
            name: "amqp_connection".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// Gather current service statistics
    async fn gather_service_stats(core: &ServiceCore) -> ServiceStats {
        let mut stats = ServiceStats {
            passes_in_flight: core.coordinator().in_flight(),
            uptime_seconds: core.uptime().as_secs(),
            ..ServiceStats::default()
        };

        if let Ok(engine_stats) = core.engine().get_stats() {
            stats.passes_completed = engine_stats.passes_completed;
            stats.teams_matched = engine_stats.teams_matched;
            stats.players_matched = engine_stats.players_matched;
        }

        match core.store().list_servers().await {
            Ok(servers) => {
                stats.servers = servers.len();
                for server_id in servers {
                    if let Ok(Some(state)) = core.store().load_queue(&server_id).await {
                        stats.queued_slots += state.queues.total_entries();
                    }
                }
            }
            Err(e) => debug!("Failed to list servers for health stats: {}", e),
        }

        stats
    }
}

impl HealthCheck {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize health check: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_status_combination() {
        assert_eq!(
            HealthStatus::Healthy.worst(&HealthStatus::Degraded),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthStatus::Degraded.worst(&HealthStatus::Unhealthy),
            HealthStatus::Unhealthy
        );
        assert_eq!(HealthStatus::Healthy.as_gauge(), 2);
    }

    #[tokio::test]
    async fn test_dry_run_core_is_degraded_but_ready() {
        let core = Arc::new(ServiceCore::dry_run(AppConfig::default()).unwrap());
        assert_eq!(
            HealthCheck::liveness_check(core.clone()).await.unwrap(),
            HealthStatus::Unhealthy
        );

        core.set_running(true).await;
        let health = HealthCheck::check(core.clone()).await.unwrap();
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.checks.len(), 4);
        assert_eq!(health.stats.servers, 0);
        assert_eq!(
            HealthCheck::readiness_check(core).await.unwrap(),
            HealthStatus::Degraded
        );
        assert!(health.to_json().unwrap().contains("amqp_connection"));
    }
}
