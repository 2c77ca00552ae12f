//! Metrics collection using Prometheus
//!
//! This module provides metrics collection for the huddle matchmaking service
//! using Prometheus metrics.

use crate::types::{LeaveReason, Mode, ModeQueues};
use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Main metrics collector for the matchmaking service
#[derive(Clone)]
pub struct MetricsCollector {
    /// Prometheus registry
    registry: Arc<Registry>,

    /// Service-level metrics
    service_metrics: ServiceMetrics,

    /// Queue membership metrics
    queue_metrics: QueueMetrics,

    /// Matchmaking pass metrics
    matchmaking_metrics: MatchmakingMetrics,

    /// Voice platform side-effect metrics
    platform_metrics: PlatformMetrics,

    /// Performance metrics
    performance_metrics: PerformanceMetrics,
}

/// Service-level metrics
#[derive(Clone)]
pub struct ServiceMetrics {
    /// Service uptime in seconds
    pub uptime_seconds: IntGauge,

    /// Total AMQP messages processed
    pub amqp_messages_total: IntCounterVec,

    /// AMQP message processing errors
    pub amqp_errors_total: IntCounterVec,

    /// Health check status (0=unhealthy, 1=degraded, 2=healthy)
    pub health_status: IntGauge,

    /// Component health status
    pub component_health: IntGaugeVec,
}

/// Queue membership metrics
#[derive(Clone)]
pub struct QueueMetrics {
    /// Queue slots created, by mode
    pub players_queued_total: IntCounterVec,

    /// Players leaving the queues, by reason
    pub players_left_total: IntCounterVec,

    /// Players currently waiting, by mode
    pub players_waiting: IntGaugeVec,

    /// Join attempts refused, by reason
    pub joins_rejected_total: IntCounterVec,

    /// Preference toggles applied
    pub preference_changes_total: IntCounter,
}

/// Matchmaking pass metrics
#[derive(Clone)]
pub struct MatchmakingMetrics {
    /// Passes run, by outcome
    pub passes_total: IntCounterVec,

    /// Teams finalized, by mode and whether they were promoted
    pub teams_matched_total: IntCounterVec,

    /// Promotions, by the mode the candidate team came from
    pub promotions_total: IntCounterVec,

    /// Candidate groups dropped because a member vanished during the wait
    pub abandoned_groups_total: IntCounterVec,

    /// Bracket tasks that failed, by mode
    pub bracket_failures_total: IntCounterVec,

    /// Passes coalesced into an already running one
    pub coalesced_triggers_total: IntCounter,

    /// Pass duration, including promotion waits
    pub pass_duration_seconds: Histogram,

    /// Promotion wait actually sampled
    pub promotion_wait_seconds: Histogram,
}

/// Voice platform side-effect metrics
#[derive(Clone)]
pub struct PlatformMetrics {
    /// Team channels requested, by status
    pub channels_created_total: IntCounterVec,

    /// Member move attempts, by outcome
    pub member_moves_total: IntCounterVec,

    /// Empty team channels removed
    pub channels_deleted_total: IntCounter,
}

/// Performance metrics
#[derive(Clone)]
pub struct PerformanceMetrics {
    /// Inbound command processing time
    pub command_processing_duration: HistogramVec,

    /// AMQP operation durations
    pub amqp_operation_duration: HistogramVec,
}

impl MetricsCollector {
    /// Create a new metrics collector with default registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        Self::with_registry(registry)
    }

    /// Create a new metrics collector with custom registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let service_metrics = ServiceMetrics::new(&registry)?;
        let queue_metrics = QueueMetrics::new(&registry)?;
        let matchmaking_metrics = MatchmakingMetrics::new(&registry)?;
        let platform_metrics = PlatformMetrics::new(&registry)?;
        let performance_metrics = PerformanceMetrics::new(&registry)?;

        Ok(Self {
            registry,
            service_metrics,
            queue_metrics,
            matchmaking_metrics,
            platform_metrics,
            performance_metrics,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn service(&self) -> &ServiceMetrics {
        &self.service_metrics
    }

    pub fn queue(&self) -> &QueueMetrics {
        &self.queue_metrics
    }

    pub fn matchmaking(&self) -> &MatchmakingMetrics {
        &self.matchmaking_metrics
    }

    pub fn platform(&self) -> &PlatformMetrics {
        &self.platform_metrics
    }

    pub fn performance(&self) -> &PerformanceMetrics {
        &self.performance_metrics
    }

    /// Record a player entering one or more mode queues
    pub fn record_player_queued(&self, modes: &[Mode]) {
        for mode in modes {
            self.queue_metrics
                .players_queued_total
                .with_label_values(&[mode_label(*mode)])
                .inc();
        }
    }

    /// Record a player leaving the queues
    pub fn record_player_left(&self, reason: LeaveReason) {
        self.queue_metrics
            .players_left_total
            .with_label_values(&[leave_reason_label(reason)])
            .inc();
    }

    /// Record a refused join
    pub fn record_join_rejected(&self, reason: &str) {
        self.queue_metrics
            .joins_rejected_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn record_preference_change(&self) {
        self.queue_metrics.preference_changes_total.inc();
    }

    /// Set the waiting gauges from a server's queues
    pub fn update_queue_sizes(&self, queues: &ModeQueues) {
        for mode in Mode::ALL {
            self.queue_metrics
                .players_waiting
                .with_label_values(&[mode_label(mode)])
                .set(queues.len(mode) as i64);
        }
    }

    /// Record a completed (or aborted) matchmaking pass
    pub fn record_pass(&self, outcome: &str, duration: Duration) {
        self.matchmaking_metrics
            .passes_total
            .with_label_values(&[outcome])
            .inc();
        self.matchmaking_metrics
            .pass_duration_seconds
            .observe(duration.as_secs_f64());
    }

    /// Record a finalized team
    pub fn record_team_matched(&self, mode: Mode, promoted_from: Option<Mode>) {
        let promoted = if promoted_from.is_some() { "true" } else { "false" };
        self.matchmaking_metrics
            .teams_matched_total
            .with_label_values(&[mode_label(mode), promoted])
            .inc();

        if let Some(from) = promoted_from {
            self.matchmaking_metrics
                .promotions_total
                .with_label_values(&[mode_label(from)])
                .inc();
        }
    }

    pub fn record_abandoned_group(&self, mode: Mode) {
        self.matchmaking_metrics
            .abandoned_groups_total
            .with_label_values(&[mode_label(mode)])
            .inc();
    }

    pub fn record_bracket_failure(&self, mode: Mode) {
        self.matchmaking_metrics
            .bracket_failures_total
            .with_label_values(&[mode_label(mode)])
            .inc();
    }

    pub fn record_coalesced_trigger(&self) {
        self.matchmaking_metrics.coalesced_triggers_total.inc();
    }

    pub fn record_promotion_wait(&self, wait: Duration) {
        self.matchmaking_metrics
            .promotion_wait_seconds
            .observe(wait.as_secs_f64());
    }

    /// Record a team channel request
    pub fn record_channel_created(&self, success: bool) {
        let status = if success { "success" } else { "failed" };
        self.platform_metrics
            .channels_created_total
            .with_label_values(&[status])
            .inc();
    }

    /// Record a member move attempt ("moved", "not_connected" or "failed")
    pub fn record_member_move(&self, outcome: &str) {
        self.platform_metrics
            .member_moves_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn record_channel_deleted(&self) {
        self.platform_metrics.channels_deleted_total.inc();
    }

    /// Record an inbound command being processed
    pub fn record_command(&self, command: &str, duration: Duration) {
        self.performance_metrics
            .command_processing_duration
            .with_label_values(&[command])
            .observe(duration.as_secs_f64());
    }

    /// Record AMQP operation
    pub fn record_amqp_operation(&self, operation: &str, success: bool, duration: Duration) {
        let status = if success { "success" } else { "error" };

        self.service_metrics
            .amqp_messages_total
            .with_label_values(&[operation, status])
            .inc();

        if !success {
            self.service_metrics
                .amqp_errors_total
                .with_label_values(&[operation])
                .inc();
        }

        self.performance_metrics
            .amqp_operation_duration
            .with_label_values(&[operation, status])
            .observe(duration.as_secs_f64());
    }

    /// Update health status
    pub fn update_health_status(&self, status: u8) {
        self.service_metrics.health_status.set(status as i64);
    }

    /// Update component health
    pub fn update_component_health(&self, component: &str, healthy: bool) {
        let status = if healthy { 1 } else { 0 };
        self.service_metrics
            .component_health
            .with_label_values(&[component])
            .set(status);
    }

    /// Create a timer for measuring operation duration
    pub fn start_timer(&self) -> MetricsTimer {
        MetricsTimer::new()
    }
}

fn mode_label(mode: Mode) -> &'static str {
    match mode {
        Mode::Twos => "2v2",
        Mode::Threes => "3v3",
        Mode::Fours => "4v4",
    }
}

fn leave_reason_label(reason: LeaveReason) -> &'static str {
    match reason {
        LeaveReason::Toggled => "toggled",
        LeaveReason::UserLeft => "user_left",
        LeaveReason::VoiceDisconnected => "voice_disconnected",
        LeaveReason::QueuesCleared => "queues_cleared",
    }
}

/// Timer for measuring operation durations
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get the elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return the duration
    pub fn stop(self) -> Duration {
        self.elapsed()
    }
}

impl ServiceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let uptime_seconds = IntGauge::new("huddle_uptime_seconds", "Service uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let amqp_messages_total = IntCounterVec::new(
            Opts::new("huddle_amqp_messages_total", "Total AMQP messages processed"),
            &["operation", "status"],
        )?;
        registry.register(Box::new(amqp_messages_total.clone()))?;

        let amqp_errors_total = IntCounterVec::new(
            Opts::new("huddle_amqp_errors_total", "Total AMQP errors"),
            &["operation"],
        )?;
        registry.register(Box::new(amqp_errors_total.clone()))?;

        let health_status = IntGauge::new(
            "huddle_health_status",
            "Health status (0=unhealthy, 1=degraded, 2=healthy)",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        let component_health = IntGaugeVec::new(
            Opts::new("huddle_component_health", "Component health status"),
            &["component"],
        )?;
        registry.register(Box::new(component_health.clone()))?;

        Ok(Self {
            uptime_seconds,
            amqp_messages_total,
            amqp_errors_total,
            health_status,
            component_health,
        })
    }
}

impl QueueMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let players_queued_total = IntCounterVec::new(
            Opts::new("huddle_players_queued_total", "Queue slots created"),
            &["mode"],
        )?;
        registry.register(Box::new(players_queued_total.clone()))?;

        let players_left_total = IntCounterVec::new(
            Opts::new("huddle_players_left_total", "Players leaving the queues"),
            &["reason"],
        )?;
        registry.register(Box::new(players_left_total.clone()))?;

        let players_waiting = IntGaugeVec::new(
            Opts::new("huddle_players_waiting", "Players currently waiting"),
            &["mode"],
        )?;
        registry.register(Box::new(players_waiting.clone()))?;

        let joins_rejected_total = IntCounterVec::new(
            Opts::new("huddle_joins_rejected_total", "Join attempts refused"),
            &["reason"],
        )?;
        registry.register(Box::new(joins_rejected_total.clone()))?;

        let preference_changes_total = IntCounter::new(
            "huddle_preference_changes_total",
            "Mode preference toggles applied",
        )?;
        registry.register(Box::new(preference_changes_total.clone()))?;

        Ok(Self {
            players_queued_total,
            players_left_total,
            players_waiting,
            joins_rejected_total,
            preference_changes_total,
        })
    }
}

impl MatchmakingMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let passes_total = IntCounterVec::new(
            Opts::new("huddle_matchmaking_passes_total", "Matchmaking passes run"),
            &["outcome"],
        )?;
        registry.register(Box::new(passes_total.clone()))?;

        let teams_matched_total = IntCounterVec::new(
            Opts::new("huddle_teams_matched_total", "Teams finalized"),
            &["mode", "promoted"],
        )?;
        registry.register(Box::new(teams_matched_total.clone()))?;

        let promotions_total = IntCounterVec::new(
            Opts::new("huddle_promotions_total", "Teams promoted to a larger mode"),
            &["from_mode"],
        )?;
        registry.register(Box::new(promotions_total.clone()))?;

        let abandoned_groups_total = IntCounterVec::new(
            Opts::new(
                "huddle_abandoned_groups_total",
                "Candidate groups dropped during the promotion wait",
            ),
            &["mode"],
        )?;
        registry.register(Box::new(abandoned_groups_total.clone()))?;

        let bracket_failures_total = IntCounterVec::new(
            Opts::new("huddle_bracket_failures_total", "Bracket tasks that failed"),
            &["mode"],
        )?;
        registry.register(Box::new(bracket_failures_total.clone()))?;

        let coalesced_triggers_total = IntCounter::new(
            "huddle_coalesced_triggers_total",
            "Triggers folded into a running pass",
        )?;
        registry.register(Box::new(coalesced_triggers_total.clone()))?;

        let pass_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "huddle_pass_duration_seconds",
                "Matchmaking pass duration including promotion waits",
            )
            .buckets(vec![0.01, 0.1, 1.0, 5.0, 10.0, 15.0, 20.0, 30.0, 60.0]),
        )?;
        registry.register(Box::new(pass_duration_seconds.clone()))?;

        let promotion_wait_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "huddle_promotion_wait_seconds",
                "Sampled promotion window length",
            )
            .buckets(vec![5.0, 10.0, 12.0, 14.0, 16.0, 18.0, 20.0, 30.0]),
        )?;
        registry.register(Box::new(promotion_wait_seconds.clone()))?;

        Ok(Self {
            passes_total,
            teams_matched_total,
            promotions_total,
            abandoned_groups_total,
            bracket_failures_total,
            coalesced_triggers_total,
            pass_duration_seconds,
            promotion_wait_seconds,
        })
    }
}

impl PlatformMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let channels_created_total = IntCounterVec::new(
            Opts::new("huddle_channels_created_total", "Team channels requested"),
            &["status"],
        )?;
        registry.register(Box::new(channels_created_total.clone()))?;

        let member_moves_total = IntCounterVec::new(
            Opts::new("huddle_member_moves_total", "Member move attempts"),
            &["outcome"],
        )?;
        registry.register(Box::new(member_moves_total.clone()))?;

        let channels_deleted_total = IntCounter::new(
            "huddle_channels_deleted_total",
            "Empty team channels removed",
        )?;
        registry.register(Box::new(channels_deleted_total.clone()))?;

        Ok(Self {
            channels_created_total,
            member_moves_total,
            channels_deleted_total,
        })
    }
}

impl PerformanceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let command_processing_duration = HistogramVec::new(
            HistogramOpts::new(
                "huddle_command_processing_duration_seconds",
                "Inbound command processing time",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["command"],
        )?;
        registry.register(Box::new(command_processing_duration.clone()))?;

        let amqp_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "huddle_amqp_operation_duration_seconds",
                "AMQP operation duration",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["operation", "status"],
        )?;
        registry.register(Box::new(amqp_operation_duration.clone()))?;

        Ok(Self {
            command_processing_duration,
            amqp_operation_duration,
        })
    }
}
