//! Team finalization
//!
//! Finalization happens in two steps around the pass commit. [`TeamFinalizer::finalize`]
//! runs inside a bracket task: it sweeps the members out of every mode of the working
//! copy and requests the team's voice channel. [`TeamFinalizer::settle`] runs after the
//! removals are persisted: it moves connected members and announces the team.

use crate::amqp::publisher::EventPublisher;
use crate::error::Result;
use crate::matchmaking::pass::PassState;
use crate::metrics::MetricsCollector;
use crate::platform::{ChannelProvisioner, MemberMover, MoveOutcome};
use crate::types::{Team, TeamMatched, UserId};
use crate::utils;
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct TeamFinalizer {
    provisioner: Arc<dyn ChannelProvisioner>,
    mover: Arc<dyn MemberMover>,
    publisher: Arc<dyn EventPublisher>,
    metrics: Arc<MetricsCollector>,
}

impl TeamFinalizer {
    pub fn new(
        provisioner: Arc<dyn ChannelProvisioner>,
        mover: Arc<dyn MemberMover>,
        publisher: Arc<dyn EventPublisher>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            provisioner,
            mover,
            publisher,
            metrics,
        }
    }

    /// Remove the team from every queue of the working copy and give it a channel.
    ///
    /// A channel failure leaves the team matched without a channel.
    pub async fn finalize(&self, pass: &PassState, category_id: &str, team: Team) -> Result<Team> {
        let mut team = team;
        pass.finalize_members(&team)?;

        match self
            .provisioner
            .create_team_channel(pass.server_id(), category_id, &team)
            .await
        {
            Ok(channel) => {
                self.metrics.record_channel_created(true);
                team.channel = Some(channel);
            }
            Err(e) => {
                self.metrics.record_channel_created(false);
                warn!(
                    "Team {} in server {} matched without a channel: {}",
                    team.id,
                    pass.server_id(),
                    e
                );
            }
        }

        self.metrics.record_team_matched(team.mode, team.promoted_from);
        info!(
            "Finalized {} team {} (bracket {}) in server {}: {:?}",
            team.mode,
            team.id,
            team.bracket,
            pass.server_id(),
            team.user_ids()
        );

        pass.record_team(team.clone())?;
        Ok(team)
    }

    /// Move connected members into their team channel and announce each team
    pub async fn settle(&self, teams: &[Team]) -> Vec<TeamMatched> {
        let mut announcements = Vec::with_capacity(teams.len());

        for team in teams {
            let unmoved = self.move_members(team).await;
            let event = TeamMatched {
                server_id: team.server_id.clone(),
                team: team.clone(),
                unmoved,
                timestamp: utils::current_timestamp(),
            };

            if let Err(e) = self.publisher.publish_team_matched(event.clone()).await {
                error!("Failed to announce team {}: {}", team.id, e);
            }
            announcements.push(event);
        }

        announcements
    }

    /// Returns the members that did not end up in the channel
    async fn move_members(&self, team: &Team) -> Vec<UserId> {
        let channel = match &team.channel {
            Some(channel) => channel,
            None => return team.players.iter().map(|p| p.user_id.clone()).collect(),
        };

        let mut unmoved = Vec::new();
        for player in &team.players {
            match self
                .mover
                .move_member(&team.server_id, channel, &player.user_id)
                .await
            {
                Ok(MoveOutcome::Moved) => {
                    self.metrics.record_member_move("moved");
                }
                Ok(MoveOutcome::NotConnected) => {
                    self.metrics.record_member_move("not_connected");
                    unmoved.push(player.user_id.clone());
                }
                Err(e) => {
                    self.metrics.record_member_move("failed");
                    warn!(
                        "Failed to move {} into {}: {}",
                        player.user_id, channel.name, e
                    );
                    unmoved.push(player.user_id.clone());
                }
            }
        }
        unmoved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::publisher::MockEventPublisher;
    use crate::matchmaking::promotion::build_team;
    use crate::platform::MockVoicePlatform;
    use crate::types::{Bracket, ChannelRef, Mode, PlayerStats, QueueEntry, ServerQueueState};
    use async_trait::async_trait;
    use chrono::Utc;
    use mockall::mock;

    mock! {
        Provisioner {}

        #[async_trait]
        impl ChannelProvisioner for Provisioner {
            async fn create_team_channel(
                &self,
                server_id: &str,
                category_id: &str,
                team: &Team,
            ) -> Result<ChannelRef>;
            async fn delete_channel(&self, server_id: &str, channel_id: &str) -> Result<()>;
        }
    }

    mock! {
        Mover {}

        #[async_trait]
        impl MemberMover for Mover {
            async fn move_member(
                &self,
                server_id: &str,
                channel: &ChannelRef,
                user_id: &str,
            ) -> Result<MoveOutcome>;
        }
    }

    fn setup() -> (TeamFinalizer, Arc<MockVoicePlatform>, Arc<MockEventPublisher>) {
        let platform = Arc::new(MockVoicePlatform::new());
        let publisher = Arc::new(MockEventPublisher::new());
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let finalizer =
            TeamFinalizer::new(platform.clone(), platform.clone(), publisher.clone(), metrics);
        (finalizer, platform, publisher)
    }

    fn entry(user_id: &str) -> QueueEntry {
        QueueEntry::new(user_id, PlayerStats::new(5.0, 200), Utc::now())
    }

    fn pass_with_stale_duplicates() -> PassState {
        let mut state = ServerQueueState::new("s1", "Server");
        state.category = Some("cat".to_string());
        state.queues.twos.extend([entry("a"), entry("b"), entry("c")]);
        state.queues.threes.extend([entry("a"), entry("c")]);
        state.queues.fours.push(entry("b"));
        PassState::new(state)
    }

    #[tokio::test]
    async fn test_finalize_sweeps_every_mode() {
        let (finalizer, platform, _publisher) = setup();
        let pass = pass_with_stale_duplicates();
        let team = build_team("s1", Mode::Twos, Bracket::Mid, vec![entry("a"), entry("b")], None);

        let team = finalizer.finalize(&pass, "cat", team).await.unwrap();

        assert!(team.channel.is_some());
        assert_eq!(platform.created_channels().len(), 1);
        for mode in Mode::ALL {
            let remaining = pass.remaining(mode).unwrap();
            assert!(remaining.iter().all(|e| e.user_id != "a" && e.user_id != "b"));
        }
        assert_eq!(pass.remaining(Mode::Threes).unwrap().len(), 1);
        assert_eq!(pass.teams().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_channel_failure_still_matches() {
        let (finalizer, platform, publisher) = setup();
        platform.set_channel_creation_failure(true);
        let pass = pass_with_stale_duplicates();
        let team = build_team("s1", Mode::Twos, Bracket::Mid, vec![entry("a"), entry("c")], None);

        let team = finalizer.finalize(&pass, "cat", team).await.unwrap();
        assert!(team.channel.is_none());

        let announcements = finalizer.settle(&[team]).await;
        assert_eq!(announcements[0].unmoved, vec!["a", "c"]);
        assert!(platform.moves().is_empty());
        assert_eq!(publisher.matched_teams().len(), 1);
    }

    #[tokio::test]
    async fn test_settle_skips_disconnected_and_failed_moves() {
        let (finalizer, platform, publisher) = setup();
        platform.connect("a");
        platform.connect("c");
        platform.fail_moves_for("c");
        let pass = pass_with_stale_duplicates();
        let team = build_team(
            "s1",
            Mode::Threes,
            Bracket::Mid,
            vec![entry("a"), entry("b"), entry("c")],
            Some(Mode::Twos),
        );
        let team = finalizer.finalize(&pass, "cat", team).await.unwrap();

        let announcements = finalizer.settle(&[team.clone()]).await;

        let moves = platform.moves();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].0, "a");
        assert_eq!(moves[0].1, team.channel.unwrap().id);
        assert_eq!(announcements[0].unmoved, vec!["b", "c"]);
        assert_eq!(publisher.matched_teams()[0].id, team.id);
    }

    #[tokio::test]
    async fn test_one_channel_request_and_one_move_per_member() {
        let mut provisioner = MockProvisioner::new();
        provisioner
            .expect_create_team_channel()
            .withf(|server_id, category_id, team| {
                server_id == "s1" && category_id == "cat" && team.size() == 2
            })
            .times(1)
            .returning(|_, _, team| {
                Ok(ChannelRef {
                    id: "team-channel".to_string(),
                    name: format!("{} team", team.mode),
                    user_limit: team.size(),
                })
            });
        provisioner.expect_delete_channel().never();

        let mut mover = MockMover::new();
        mover
            .expect_move_member()
            .withf(|server_id, channel, user_id| {
                server_id == "s1" && channel.id == "team-channel" && user_id == "a"
            })
            .times(1)
            .returning(|_, _, _| Ok(MoveOutcome::Moved));
        mover
            .expect_move_member()
            .withf(|server_id, channel, user_id| {
                server_id == "s1" && channel.id == "team-channel" && user_id == "b"
            })
            .times(1)
            .returning(|_, _, _| Err(anyhow::anyhow!("member left voice")));

        let publisher = Arc::new(MockEventPublisher::new());
        let finalizer = TeamFinalizer::new(
            Arc::new(provisioner),
            Arc::new(mover),
            publisher.clone(),
            Arc::new(MetricsCollector::new().unwrap()),
        );

        let pass = pass_with_stale_duplicates();
        let team = build_team("s1", Mode::Twos, Bracket::Mid, vec![entry("a"), entry("b")], None);
        let team = finalizer.finalize(&pass, "cat", team).await.unwrap();
        assert_eq!(team.channel.as_ref().map(|c| c.user_limit), Some(2));

        let announcements = finalizer.settle(&[team]).await;
        assert_eq!(announcements[0].unmoved, vec!["b"]);
        assert_eq!(publisher.matched_teams().len(), 1);
    }
}
