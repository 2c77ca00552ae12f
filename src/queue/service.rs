//! Player-facing queue operations
//!
//! Every write goes through [`QueueStore::modify_queue`], so a rejected request
//! leaves the server document untouched. Events are published after the write.

use crate::amqp::publisher::EventPublisher;
use crate::bracket::BracketClassifier;
use crate::error::{MatchmakingError, Result};
use crate::metrics::MetricsCollector;
use crate::queue::store::QueueStore;
use crate::types::{
    Bracket, JoinQueueRequest, LeaveQueueRequest, LeaveReason, Mode, PlayerLeftQueue,
    PlayerQueued, PlayerStats, PreferenceToggleRequest, QueueEntry, ServerQueueState,
    SetCategoryRequest, UserId,
};
use crate::utils;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a join request did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The player entered every preferred mode
    Joined { modes: Vec<Mode>, bracket: Bracket },
    /// The player was already queued and has been removed from these modes
    Left(Vec<Mode>),
}

pub struct QueueService {
    store: Arc<dyn QueueStore>,
    classifier: BracketClassifier,
    publisher: Arc<dyn EventPublisher>,
    metrics: Arc<MetricsCollector>,
}

impl QueueService {
    pub fn new(
        store: Arc<dyn QueueStore>,
        classifier: BracketClassifier,
        publisher: Arc<dyn EventPublisher>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            store,
            classifier,
            publisher,
            metrics,
        }
    }

    /// Join every preferred mode, or leave them all when already queued
    pub async fn join(&self, request: JoinQueueRequest) -> Result<JoinOutcome> {
        let existing = self.store.load_queue(&request.server_id).await?;
        let configured = match &existing {
            Some(state) => state.category_id().is_some(),
            None => {
                self.store
                    .save_queue(ServerQueueState::new(
                        request.server_id.as_str(),
                        request.server_name.as_str(),
                    ))
                    .await?;
                false
            }
        };
        if !configured {
            self.metrics.record_join_rejected("no_category");
            return Err(MatchmakingError::ConfigurationError {
                message: format!(
                    "server {} has no team voice category configured",
                    request.server_id
                ),
            }
            .into());
        }

        if !request.in_voice {
            self.metrics.record_join_rejected("not_in_voice");
            return Err(MatchmakingError::NotInVoiceChannel {
                user_id: request.user_id.clone(),
            }
            .into());
        }

        let mut outcome = None;
        let result = self
            .store
            .modify_queue(&request.server_id, &request.server_name, &mut |state| {
                outcome = Some(self.apply_join(state, &request)?);
                Ok(())
            })
            .await;

        let state = match result {
            Ok(state) => state,
            Err(e) => {
                if let Some(MatchmakingError::InvalidPlayerStats { .. }) =
                    e.downcast_ref::<MatchmakingError>()
                {
                    self.metrics.record_join_rejected("invalid_stats");
                }
                return Err(e);
            }
        };
        self.metrics.update_queue_sizes(&state.queues);

        let outcome = outcome.ok_or_else(|| MatchmakingError::InternalError {
            message: "join mutation produced no outcome".to_string(),
        })?;

        match &outcome {
            JoinOutcome::Joined { modes, bracket } => {
                info!(
                    "Player {} joined {:?} in server {} (bracket {})",
                    request.user_id, modes, request.server_id, bracket
                );
                self.metrics.record_player_queued(modes);
                let event = PlayerQueued {
                    server_id: request.server_id.clone(),
                    user_id: request.user_id.clone(),
                    modes: modes.clone(),
                    bracket: *bracket,
                    timestamp: utils::current_timestamp(),
                };
                if let Err(e) = self.publisher.publish_player_queued(event).await {
                    warn!("Failed to publish PlayerQueued for {}: {}", request.user_id, e);
                }
            }
            JoinOutcome::Left(modes) => {
                self.announce_left(&request.server_id, &request.user_id, modes, LeaveReason::Toggled)
                    .await;
            }
        }

        Ok(outcome)
    }

    fn apply_join(
        &self,
        state: &mut ServerQueueState,
        request: &JoinQueueRequest,
    ) -> Result<JoinOutcome> {
        let preferred = state.preferences.modes_for(&request.user_id);
        let already_queued = preferred
            .iter()
            .any(|mode| state.queues.contains(*mode, &request.user_id));
        if already_queued {
            return Ok(JoinOutcome::Left(
                state.queues.remove_user(&request.user_id),
            ));
        }

        let stats = self.resolve_stats(state, request)?;
        let mut template = QueueEntry::new(request.user_id.as_str(), stats, request.timestamp);
        let bracket = self.classifier.classify_entry(&mut template);

        // Clear any leftover slot in a mode the player no longer prefers
        state.queues.remove_user(&request.user_id);
        let modes: Vec<Mode> = preferred.into_iter().collect();
        for mode in &modes {
            state.queues.get_mut(*mode).push(template.clone());
        }
        state.used_stats.insert(request.user_id.clone(), stats);

        Ok(JoinOutcome::Joined { modes, bracket })
    }

    fn resolve_stats(
        &self,
        state: &ServerQueueState,
        request: &JoinQueueRequest,
    ) -> Result<PlayerStats> {
        let stats = state
            .used_stats
            .get(&request.user_id)
            .copied()
            .or(request.stats)
            .ok_or_else(|| MatchmakingError::InvalidPlayerStats {
                user_id: request.user_id.clone(),
                reason: "no stats available".to_string(),
            })?;
        stats.validate(&request.user_id)?;
        Ok(stats)
    }

    /// Leave every queue
    pub async fn leave(&self, request: LeaveQueueRequest) -> Result<Vec<Mode>> {
        self.remove_everywhere(&request.server_id, &request.user_id, LeaveReason::UserLeft)
            .await
    }

    /// Remove a player whose voice connection dropped
    pub async fn handle_voice_disconnect(&self, server_id: &str, user_id: &str) -> Result<Vec<Mode>> {
        self.remove_everywhere(server_id, user_id, LeaveReason::VoiceDisconnected)
            .await
    }

    async fn remove_everywhere(
        &self,
        server_id: &str,
        user_id: &str,
        reason: LeaveReason,
    ) -> Result<Vec<Mode>> {
        let server_name = match self.store.load_queue(server_id).await? {
            Some(state) if state.queues.is_queued(user_id) => state.server_name,
            _ => {
                debug!("Player {} is not queued in server {}", user_id, server_id);
                return Ok(Vec::new());
            }
        };

        let mut removed = Vec::new();
        let state = self
            .store
            .modify_queue(server_id, &server_name, &mut |state| {
                removed = state.queues.remove_user(user_id);
                Ok(())
            })
            .await?;
        self.metrics.update_queue_sizes(&state.queues);

        if !removed.is_empty() {
            self.announce_left(server_id, user_id, &removed, reason).await;
        }
        Ok(removed)
    }

    async fn announce_left(&self, server_id: &str, user_id: &str, modes: &[Mode], reason: LeaveReason) {
        info!(
            "Player {} left {:?} in server {} ({:?})",
            user_id, modes, server_id, reason
        );
        self.metrics.record_player_left(reason);
        let event = PlayerLeftQueue {
            server_id: server_id.to_string(),
            user_id: user_id.to_string(),
            modes: modes.to_vec(),
            reason,
            timestamp: utils::current_timestamp(),
        };
        if let Err(e) = self.publisher.publish_player_left_queue(event).await {
            warn!("Failed to publish PlayerLeftQueue for {}: {}", user_id, e);
        }
    }

    /// Flip one mode in a player's preferences. Refused while the player is queued.
    pub async fn toggle_preference(&self, request: PreferenceToggleRequest) -> Result<BTreeSet<Mode>> {
        let server_name = self
            .store
            .load_queue(&request.server_id)
            .await?
            .map(|state| state.server_name)
            .unwrap_or_else(|| request.server_id.clone());

        let mut updated = BTreeSet::new();
        self.store
            .modify_queue(&request.server_id, &server_name, &mut |state| {
                if state.queues.is_queued(&request.user_id) {
                    return Err(MatchmakingError::PreferenceChangeDenied {
                        user_id: request.user_id.clone(),
                        reason: "leave the queue before changing modes".to_string(),
                    }
                    .into());
                }

                let modes = state.preferences.toggle(&request.user_id, request.mode);
                if modes.is_empty() {
                    return Err(MatchmakingError::PreferenceChangeDenied {
                        user_id: request.user_id.clone(),
                        reason: "at least one mode must stay enabled".to_string(),
                    }
                    .into());
                }
                updated = modes;
                Ok(())
            })
            .await?;

        self.metrics.record_preference_change();
        debug!(
            "Player {} in server {} now prefers {:?}",
            request.user_id, request.server_id, updated
        );
        Ok(updated)
    }

    /// Configure the category team channels are created under
    pub async fn set_category(&self, request: SetCategoryRequest) -> Result<()> {
        let category_id = request.category_id.trim().to_string();
        if category_id.is_empty() {
            return Err(MatchmakingError::InvalidQueueRequest {
                reason: "category id cannot be empty".to_string(),
            }
            .into());
        }

        self.store
            .modify_queue(&request.server_id, &request.server_name, &mut |state| {
                state.server_name = request.server_name.clone();
                state.category = Some(category_id.clone());
                Ok(())
            })
            .await?;

        info!(
            "Server {} will create team channels under category {}",
            request.server_id, category_id
        );
        Ok(())
    }

    /// Empty every queue of every server. Returns the number of players removed.
    pub async fn clear_all_queues(&self) -> Result<usize> {
        let mut cleared = 0;

        for server_id in self.store.list_servers().await? {
            let state = match self.store.load_queue(&server_id).await? {
                Some(state) if !state.queues.is_empty() => state,
                _ => continue,
            };

            let mut queued: Vec<(UserId, Vec<Mode>)> = Vec::new();
            for mode in Mode::ALL {
                for entry in state.queues.get(mode) {
                    match queued.iter_mut().find(|(user_id, _)| *user_id == entry.user_id) {
                        Some((_, modes)) => modes.push(mode),
                        None => queued.push((entry.user_id.clone(), vec![mode])),
                    }
                }
            }

            let updated = self
                .store
                .modify_queue(&server_id, &state.server_name, &mut |state| {
                    state.queues.clear();
                    Ok(())
                })
                .await?;
            self.metrics.update_queue_sizes(&updated.queues);

            for (user_id, modes) in &queued {
                self.announce_left(&server_id, user_id, modes, LeaveReason::QueuesCleared)
                    .await;
            }
            cleared += queued.len();
        }

        info!("Cleared {} queued players", cleared);
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::publisher::MockEventPublisher;
    use crate::queue::store::InMemoryQueueStore;
    use crate::types::AmqpMessage;
    use chrono::Utc;

    const SERVER: &str = "server-1";

    fn setup() -> (QueueService, Arc<InMemoryQueueStore>, Arc<MockEventPublisher>) {
        let store = Arc::new(InMemoryQueueStore::default());
        let publisher = Arc::new(MockEventPublisher::new());
        let service = QueueService::new(
            store.clone(),
            BracketClassifier::default(),
            publisher.clone(),
            Arc::new(MetricsCollector::new().unwrap()),
        );
        (service, store, publisher)
    }

    fn join_request(user_id: &str, stats: Option<PlayerStats>) -> JoinQueueRequest {
        JoinQueueRequest {
            server_id: SERVER.to_string(),
            server_name: "Test Server".to_string(),
            user_id: user_id.to_string(),
            in_voice: true,
            stats,
            timestamp: Utc::now(),
        }
    }

    async fn configure(service: &QueueService) {
        service
            .set_category(SetCategoryRequest {
                server_id: SERVER.to_string(),
                server_name: "Test Server".to_string(),
                category_id: "category-1".to_string(),
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_join_without_category_creates_document_and_fails() {
        let (service, store, _publisher) = setup();

        let err = service
            .join(join_request("a", Some(PlayerStats::new(3.0, 50))))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MatchmakingError>(),
            Some(MatchmakingError::ConfigurationError { .. })
        ));

        let state = store.load_queue(SERVER).await.unwrap().unwrap();
        assert!(state.category.is_none());
        assert!(state.queues.is_empty());
    }

    #[tokio::test]
    async fn test_join_enters_every_preferred_mode_then_toggles_out() {
        let (service, store, publisher) = setup();
        configure(&service).await;

        let outcome = service
            .join(join_request("a", Some(PlayerStats::new(3.0, 50))))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            JoinOutcome::Joined {
                modes: Mode::ALL.to_vec(),
                bracket: Bracket::Low,
            }
        );
        let state = store.load_queue(SERVER).await.unwrap().unwrap();
        assert_eq!(state.queues.modes_containing("a"), Mode::ALL.to_vec());
        assert!(state.used_stats.contains_key("a"));

        // Second press leaves; stats come from the cache
        let outcome = service.join(join_request("a", None)).await.unwrap();
        assert_eq!(outcome, JoinOutcome::Left(Mode::ALL.to_vec()));
        let state = store.load_queue(SERVER).await.unwrap().unwrap();
        assert!(!state.queues.is_queued("a"));

        let outcome = service.join(join_request("a", None)).await.unwrap();
        assert!(matches!(outcome, JoinOutcome::Joined { .. }));

        let events = publisher.get_published_events();
        assert!(matches!(events[0], AmqpMessage::PlayerQueued(_)));
        match &events[1] {
            AmqpMessage::PlayerLeftQueue(left) => assert_eq!(left.reason, LeaveReason::Toggled),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_rejects_invalid_stats_and_voice() {
        let (service, store, publisher) = setup();
        configure(&service).await;

        let err = service
            .join(join_request("a", Some(PlayerStats::new(-2.0, 50))))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MatchmakingError>(),
            Some(MatchmakingError::InvalidPlayerStats { .. })
        ));

        let err = service.join(join_request("b", None)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MatchmakingError>(),
            Some(MatchmakingError::InvalidPlayerStats { .. })
        ));

        let mut request = join_request("c", Some(PlayerStats::new(3.0, 50)));
        request.in_voice = false;
        let err = service.join(request).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MatchmakingError>(),
            Some(MatchmakingError::NotInVoiceChannel { .. })
        ));

        let state = store.load_queue(SERVER).await.unwrap().unwrap();
        assert!(state.queues.is_empty());
        assert!(state.used_stats.is_empty());
        assert!(publisher.get_published_events().is_empty());
    }

    #[tokio::test]
    async fn test_join_respects_preferences() {
        let (service, store, _publisher) = setup();
        configure(&service).await;

        service
            .toggle_preference(PreferenceToggleRequest {
                server_id: SERVER.to_string(),
                user_id: "a".to_string(),
                mode: Mode::Fours,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
        service
            .join(join_request("a", Some(PlayerStats::new(3.0, 50))))
            .await
            .unwrap();

        let state = store.load_queue(SERVER).await.unwrap().unwrap();
        assert_eq!(
            state.queues.modes_containing("a"),
            vec![Mode::Twos, Mode::Threes]
        );
    }

    #[tokio::test]
    async fn test_preference_toggle_denied_while_queued_or_emptying() {
        let (service, _store, _publisher) = setup();
        configure(&service).await;

        let toggle = |mode| PreferenceToggleRequest {
            server_id: SERVER.to_string(),
            user_id: "a".to_string(),
            mode,
            timestamp: Utc::now(),
        };

        assert_eq!(
            service.toggle_preference(toggle(Mode::Twos)).await.unwrap(),
            BTreeSet::from([Mode::Threes, Mode::Fours])
        );
        service.toggle_preference(toggle(Mode::Threes)).await.unwrap();
        let err = service
            .toggle_preference(toggle(Mode::Fours))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MatchmakingError>(),
            Some(MatchmakingError::PreferenceChangeDenied { .. })
        ));

        service
            .join(join_request("a", Some(PlayerStats::new(3.0, 50))))
            .await
            .unwrap();
        let err = service
            .toggle_preference(toggle(Mode::Twos))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MatchmakingError>(),
            Some(MatchmakingError::PreferenceChangeDenied { .. })
        ));
    }

    #[tokio::test]
    async fn test_voice_disconnect_and_clear() {
        let (service, store, publisher) = setup();
        configure(&service).await;
        for user_id in ["a", "b", "c"] {
            service
                .join(join_request(user_id, Some(PlayerStats::new(3.0, 50))))
                .await
                .unwrap();
        }

        let removed = service.handle_voice_disconnect(SERVER, "a").await.unwrap();
        assert_eq!(removed, Mode::ALL.to_vec());
        assert!(service
            .handle_voice_disconnect(SERVER, "a")
            .await
            .unwrap()
            .is_empty());

        publisher.clear_events();
        assert_eq!(service.clear_all_queues().await.unwrap(), 2);
        let state = store.load_queue(SERVER).await.unwrap().unwrap();
        assert!(state.queues.is_empty());
        assert_eq!(publisher.count_events("player.left"), 2);
    }

    #[tokio::test]
    async fn test_blank_category_is_rejected() {
        let (service, store, _publisher) = setup();
        let err = service
            .set_category(SetCategoryRequest {
                server_id: SERVER.to_string(),
                server_name: "Test Server".to_string(),
                category_id: "   ".to_string(),
                timestamp: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MatchmakingError>(),
            Some(MatchmakingError::InvalidQueueRequest { .. })
        ));
        assert!(store.load_queue(SERVER).await.unwrap().is_none());
    }
}
