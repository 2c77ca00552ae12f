//! Promotion window scheduling
//!
//! A candidate team below the largest mode is held for a random wait. When the wait
//! ends the live queue is re-read: if the whole team and one more same-bracket
//! player have opted into the next mode, the team is promoted, otherwise it is
//! finalized at its own size as long as every member is still around.

use crate::bracket::BracketClassifier;
use crate::error::{MatchmakingError, Result};
use crate::matchmaking::finalizer::TeamFinalizer;
use crate::matchmaking::pass::PassState;
use crate::metrics::MetricsCollector;
use crate::platform::MemberDirectory;
use crate::queue::store::QueueStore;
use crate::types::{Bracket, Mode, QueueEntry, ServerQueueState, Team, UserId};
use crate::utils;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Configuration for the promotion window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionConfig {
    /// Shortest wait before a promotion decision
    pub min_wait_seconds: u64,
    /// Longest wait before a promotion decision
    pub max_wait_seconds: u64,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            min_wait_seconds: 10,
            max_wait_seconds: 20,
        }
    }
}

impl PromotionConfig {
    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.min_wait_seconds > self.max_wait_seconds {
            return Err(MatchmakingError::ConfigurationError {
                message: "min_wait_seconds must not exceed max_wait_seconds".to_string(),
            }
            .into());
        }

        if self.max_wait_seconds == 0 {
            return Err(MatchmakingError::ConfigurationError {
                message: "max_wait_seconds must be greater than 0".to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// Draw a wait uniformly from the window
    pub fn sample_wait(&self) -> Duration {
        utils::random_duration_between(self.min_wait_seconds, self.max_wait_seconds)
    }
}

/// What one bracket task produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BracketOutcome {
    pub teams: usize,
    pub promoted: usize,
    pub abandoned: usize,
}

/// Runs the promotion loop for one mode and bracket at a time
pub struct PromotionScheduler {
    store: Arc<dyn QueueStore>,
    directory: Arc<dyn MemberDirectory>,
    classifier: BracketClassifier,
    config: PromotionConfig,
    metrics: Arc<MetricsCollector>,
}

impl PromotionScheduler {
    pub fn new(
        store: Arc<dyn QueueStore>,
        directory: Arc<dyn MemberDirectory>,
        classifier: BracketClassifier,
        config: PromotionConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            directory,
            classifier,
            config,
            metrics,
        })
    }

    pub fn config(&self) -> &PromotionConfig {
        &self.config
    }

    /// Form teams from one bracket of `mode` until fewer than a team's worth of
    /// unclaimed players remain or a candidate group is abandoned.
    pub async fn run_bracket(
        &self,
        pass: &PassState,
        finalizer: &TeamFinalizer,
        category_id: &str,
        mode: Mode,
        bracket: Bracket,
    ) -> Result<BracketOutcome> {
        let target = mode.next().ok_or_else(|| MatchmakingError::InternalError {
            message: format!("{} has no larger mode to promote into", mode),
        })?;
        let size = mode.team_size();
        let mut outcome = BracketOutcome::default();

        while let Some(candidates) = pass.claim_oldest(mode, bracket, size, &self.classifier)? {
            let candidate_ids: Vec<UserId> =
                candidates.iter().map(|c| c.user_id.clone()).collect();

            let wait = self.config.sample_wait();
            self.metrics.record_promotion_wait(wait);
            debug!(
                "Holding {} candidates {:?} (bracket {}) for {:?}",
                mode, candidate_ids, bracket, wait
            );
            sleep(wait).await;

            let latest = match self.reload(pass.server_id()).await {
                Ok(latest) => latest,
                Err(e) => {
                    pass.release(&candidate_ids)?;
                    return Err(e);
                }
            };
            pass.refresh(latest.clone())?;

            let departed = self
                .departed_members(&latest, mode, &candidate_ids)
                .await?;
            if !departed.is_empty() {
                // Members still present keep their original slot, the rest are dropped
                let present: Vec<UserId> = candidate_ids
                    .iter()
                    .filter(|id| !departed.contains(id))
                    .cloned()
                    .collect();
                pass.release(&present)?;
                pass.drop_players(&departed)?;
                self.metrics.record_abandoned_group(mode);
                outcome.abandoned += 1;
                info!(
                    "Abandoned {} candidate group in bracket {} of server {}: {:?} left during the wait",
                    mode,
                    bracket,
                    pass.server_id(),
                    departed
                );
                break;
            }

            let promoted = self
                .try_promote(pass, finalizer, category_id, mode, target, bracket, &candidates)
                .await?;
            if promoted {
                outcome.promoted += 1;
            } else {
                let team = build_team(pass.server_id(), mode, bracket, candidates, None);
                finalizer.finalize(pass, category_id, team).await?;
            }
            outcome.teams += 1;
        }

        Ok(outcome)
    }

    /// Promote the candidates into `target` when everyone involved has opted in
    #[allow(clippy::too_many_arguments)]
    async fn try_promote(
        &self,
        pass: &PassState,
        finalizer: &TeamFinalizer,
        category_id: &str,
        mode: Mode,
        target: Mode,
        bracket: Bracket,
        candidates: &[QueueEntry],
    ) -> Result<bool> {
        let member_ids: Vec<&str> = candidates.iter().map(|c| c.user_id.as_str()).collect();
        if !pass.all_allow(&member_ids, target)? {
            debug!(
                "Candidates {:?} are not all eligible for {}, keeping {}",
                member_ids, target, mode
            );
            return Ok(false);
        }

        let extra = match pass.claim_promotion_candidate(
            &[mode, target],
            bracket,
            target,
            &self.classifier,
        )? {
            Some(extra) => extra,
            None => return Ok(false),
        };

        let mut players = candidates.to_vec();
        players.push(extra);
        let team = build_team(pass.server_id(), target, bracket, players, Some(mode));
        info!(
            "Promoting {} team {:?} to {} in server {}",
            mode,
            team.user_ids(),
            target,
            pass.server_id()
        );
        finalizer.finalize(pass, category_id, team).await?;
        Ok(true)
    }

    async fn reload(&self, server_id: &str) -> Result<ServerQueueState> {
        self.store.load_queue(server_id).await?.ok_or_else(|| {
            MatchmakingError::ServerNotFound {
                server_id: server_id.to_string(),
            }
            .into()
        })
    }

    /// Candidates no longer in the live mode queue or no longer in the server
    async fn departed_members(
        &self,
        latest: &ServerQueueState,
        mode: Mode,
        candidate_ids: &[UserId],
    ) -> Result<Vec<UserId>> {
        let mut departed = Vec::new();
        for user_id in candidate_ids {
            let queued = latest.queues.contains(mode, user_id);
            let member = match self.directory.is_member(&latest.server_id, user_id).await {
                Ok(member) => member,
                Err(e) => {
                    warn!("Membership lookup failed for {}: {}", user_id, e);
                    return Err(e);
                }
            };
            if !queued || !member {
                departed.push(user_id.clone());
            }
        }
        Ok(departed)
    }
}

/// Assemble a team record from claimed entries
pub fn build_team(
    server_id: &str,
    mode: Mode,
    bracket: Bracket,
    players: Vec<QueueEntry>,
    promoted_from: Option<Mode>,
) -> Team {
    Team {
        id: utils::generate_team_id(),
        server_id: server_id.to_string(),
        mode,
        bracket,
        players,
        matched_at: utils::current_timestamp(),
        promoted_from,
        channel: None,
    }
}
