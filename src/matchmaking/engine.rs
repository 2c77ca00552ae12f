//! Matchmaking orchestration
//!
//! One pass over one server's queues:
//! 1. 4v4 teams are formed instantly from every bracket, oldest players first.
//! 2. 3v3 and 2v2 brackets each run the promotion scheduler. All of those bracket
//!    tasks are joined on the current task and interleave at their waits.
//! 3. Removals are committed to the store in one write, then teams are settled.
//!
//! A missing server document or category aborts the pass before anything changes.
//! Any other failure is contained in the bracket task that hit it.

use crate::amqp::publisher::EventPublisher;
use crate::bracket::{BracketClassifier, BracketConfig};
use crate::error::{MatchmakingError, Result};
use crate::matchmaking::finalizer::TeamFinalizer;
use crate::matchmaking::pass::PassState;
use crate::matchmaking::promotion::{build_team, BracketOutcome, PromotionConfig, PromotionScheduler};
use crate::metrics::MetricsCollector;
use crate::platform::{ChannelProvisioner, MemberDirectory, MemberMover};
use crate::queue::store::QueueStore;
use crate::types::{Mode, ServerId, Team, TeamMatched, UserId};
use futures::future::join_all;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Tunables for the engine
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub bracket: BracketConfig,
    pub promotion: PromotionConfig,
}

/// Summary of one pass
#[derive(Debug, Clone)]
pub struct PassReport {
    pub server_id: ServerId,
    pub teams: Vec<Team>,
    pub announcements: Vec<TeamMatched>,
    pub abandoned_groups: usize,
    pub failed_brackets: usize,
    pub removed_slots: usize,
    pub duration: Duration,
}

impl PassReport {
    pub fn promoted_teams(&self) -> usize {
        self.teams.iter().filter(|team| team.is_promoted()).count()
    }

    /// Every user placed in a team by this pass
    pub fn matched_users(&self) -> Vec<UserId> {
        self.teams
            .iter()
            .flat_map(|team| team.players.iter().map(|p| p.user_id.clone()))
            .collect()
    }
}

/// Statistics about engine operations
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub passes_completed: u64,
    pub passes_aborted: u64,
    pub teams_matched: u64,
    pub teams_promoted: u64,
    pub players_matched: u64,
    pub abandoned_groups: u64,
    pub failed_brackets: u64,
}

#[derive(Debug, Default)]
struct StageTally {
    abandoned: usize,
    failed: usize,
}

impl StageTally {
    fn absorb(&mut self, other: StageTally) {
        self.abandoned += other.abandoned;
        self.failed += other.failed;
    }
}

/// The matchmaking engine
pub struct MatchmakingEngine {
    store: Arc<dyn QueueStore>,
    classifier: BracketClassifier,
    scheduler: PromotionScheduler,
    finalizer: TeamFinalizer,
    stats: RwLock<EngineStats>,
    metrics_collector: Arc<MetricsCollector>,
}

impl MatchmakingEngine {
    /// Create a new engine with its own metrics collector
    pub fn new(
        store: Arc<dyn QueueStore>,
        directory: Arc<dyn MemberDirectory>,
        provisioner: Arc<dyn ChannelProvisioner>,
        mover: Arc<dyn MemberMover>,
        publisher: Arc<dyn EventPublisher>,
        config: EngineConfig,
    ) -> Result<Self> {
        let metrics_collector = Arc::new(MetricsCollector::new()?);
        Self::with_metrics(
            store,
            directory,
            provisioner,
            mover,
            publisher,
            config,
            metrics_collector,
        )
    }

    /// Create a new engine reporting into an existing metrics collector
    pub fn with_metrics(
        store: Arc<dyn QueueStore>,
        directory: Arc<dyn MemberDirectory>,
        provisioner: Arc<dyn ChannelProvisioner>,
        mover: Arc<dyn MemberMover>,
        publisher: Arc<dyn EventPublisher>,
        config: EngineConfig,
        metrics_collector: Arc<MetricsCollector>,
    ) -> Result<Self> {
        let classifier = BracketClassifier::new(config.bracket)?;
        let scheduler = PromotionScheduler::new(
            store.clone(),
            directory,
            classifier.clone(),
            config.promotion,
            metrics_collector.clone(),
        )?;
        let finalizer =
            TeamFinalizer::new(provisioner, mover, publisher, metrics_collector.clone());

        Ok(Self {
            store,
            classifier,
            scheduler,
            finalizer,
            stats: RwLock::new(EngineStats::default()),
            metrics_collector,
        })
    }

    pub fn classifier(&self) -> &BracketClassifier {
        &self.classifier
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics_collector.clone()
    }

    /// Run one matchmaking pass for a server.
    ///
    /// Callers must not run two passes for the same server at once; see
    /// [`crate::matchmaking::PassCoordinator`].
    pub async fn run_pass(&self, server_id: &str) -> Result<PassReport> {
        let started = Instant::now();

        let state = match self.store.load_queue(server_id).await? {
            Some(state) => state,
            None => {
                return self.abort(
                    started,
                    MatchmakingError::ServerNotFound {
                        server_id: server_id.to_string(),
                    },
                )
            }
        };
        let category_id = match state.category_id() {
            Some(category_id) => category_id.to_string(),
            None => {
                return self.abort(
                    started,
                    MatchmakingError::ConfigurationError {
                        message: format!("no voice category configured for server {}", server_id),
                    },
                )
            }
        };

        debug!(
            "Starting pass for server {} ({} queued slots)",
            server_id,
            state.queues.total_entries()
        );
        let pass = PassState::new(state);

        let mut tally = self.match_instant(&pass, &category_id).await;
        let (threes, twos) = tokio::join!(
            self.run_promotion_stage(&pass, &category_id, Mode::Threes),
            self.run_promotion_stage(&pass, &category_id, Mode::Twos)
        );
        tally.absorb(threes);
        tally.absorb(twos);

        let removed_slots = match pass.commit(self.store.as_ref()).await {
            Ok(removed) => removed,
            Err(e) => {
                error!("Failed to commit pass for server {}: {}", server_id, e);
                self.metrics_collector
                    .record_pass("commit_failed", started.elapsed());
                return Err(e);
            }
        };

        let teams = pass.teams()?;
        let announcements = self.finalizer.settle(&teams).await;

        let report = PassReport {
            server_id: server_id.to_string(),
            teams,
            announcements,
            abandoned_groups: tally.abandoned,
            failed_brackets: tally.failed,
            removed_slots,
            duration: started.elapsed(),
        };
        self.record_report(&report)?;

        if let Ok(Some(latest)) = self.store.load_queue(server_id).await {
            self.metrics_collector.update_queue_sizes(&latest.queues);
        }

        info!(
            "Pass for server {} finished in {:?}: {} teams ({} promoted), {} abandoned, {} failed brackets",
            server_id,
            report.duration,
            report.teams.len(),
            report.promoted_teams(),
            report.abandoned_groups,
            report.failed_brackets
        );
        Ok(report)
    }

    fn abort(&self, started: Instant, reason: MatchmakingError) -> Result<PassReport> {
        warn!("Matchmaking pass aborted: {}", reason);
        self.metrics_collector
            .record_pass("aborted", started.elapsed());
        if let Ok(mut stats) = self.stats.write() {
            stats.passes_aborted += 1;
        }
        Err(reason.into())
    }

    /// Form full 4v4 teams from every bracket without waiting
    async fn match_instant(&self, pass: &PassState, category_id: &str) -> StageTally {
        let mut tally = StageTally::default();
        let mode = Mode::Fours;
        let size = mode.team_size();

        let groups = match pass.partition(mode, &self.classifier) {
            Ok(groups) => groups,
            Err(e) => {
                error!("Failed to partition {} queue: {}", mode, e);
                tally.failed += 1;
                return tally;
            }
        };

        for (bracket, group) in groups {
            for chunk in group.chunks_exact(size) {
                let ids: Vec<UserId> = chunk.iter().map(|e| e.user_id.clone()).collect();
                let result = match pass.claim(&ids) {
                    Ok(true) => {
                        let team = build_team(pass.server_id(), mode, bracket, chunk.to_vec(), None);
                        self.finalizer.finalize(pass, category_id, team).await.map(|_| ())
                    }
                    Ok(false) => Ok(()),
                    Err(e) => Err(e),
                };

                if let Err(e) = result {
                    error!(
                        "Instant {} matching failed in bracket {} of server {}: {}",
                        mode,
                        bracket,
                        pass.server_id(),
                        e
                    );
                    self.metrics_collector.record_bracket_failure(mode);
                    tally.failed += 1;
                    break;
                }
            }
        }

        tally
    }

    /// Run the promotion scheduler over every bracket present in the mode
    async fn run_promotion_stage(
        &self,
        pass: &PassState,
        category_id: &str,
        mode: Mode,
    ) -> StageTally {
        let mut tally = StageTally::default();

        let brackets = match pass.brackets_in(mode, &self.classifier) {
            Ok(brackets) => brackets,
            Err(e) => {
                error!("Failed to read {} brackets: {}", mode, e);
                tally.failed += 1;
                return tally;
            }
        };

        let tasks = brackets.into_iter().map(|bracket| async move {
            let result = self
                .scheduler
                .run_bracket(pass, &self.finalizer, category_id, mode, bracket)
                .await;
            (bracket, result)
        });

        for (bracket, result) in join_all(tasks).await {
            match result {
                Ok(BracketOutcome { abandoned, .. }) => tally.abandoned += abandoned,
                Err(e) => {
                    error!(
                        "{} bracket {} task failed in server {}: {}",
                        mode,
                        bracket,
                        pass.server_id(),
                        e
                    );
                    self.metrics_collector.record_bracket_failure(mode);
                    tally.failed += 1;
                }
            }
        }

        tally
    }

    fn record_report(&self, report: &PassReport) -> Result<()> {
        self.metrics_collector
            .record_pass("completed", report.duration);

        let mut stats = self
            .stats
            .write()
            .map_err(|_| MatchmakingError::InternalError {
                message: "Failed to acquire engine stats lock".to_string(),
            })?;
        stats.passes_completed += 1;
        stats.teams_matched += report.teams.len() as u64;
        stats.teams_promoted += report.promoted_teams() as u64;
        stats.players_matched += report.matched_users().len() as u64;
        stats.abandoned_groups += report.abandoned_groups as u64;
        stats.failed_brackets += report.failed_brackets as u64;
        Ok(())
    }

    /// Get engine statistics
    pub fn get_stats(&self) -> Result<EngineStats> {
        let stats = self
            .stats
            .read()
            .map_err(|_| MatchmakingError::InternalError {
                message: "Failed to acquire engine stats lock".to_string(),
            })?;
        Ok(stats.clone())
    }
}
