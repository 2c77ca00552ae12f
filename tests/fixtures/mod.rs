//! Test fixtures for integration testing
//!
//! A complete in-process system: in-memory queue store, scriptable voice platform
//! and a recording event publisher wired into the queue service and pass
//! coordinator.

#![allow(dead_code)]

use huddle::amqp::publisher::MockEventPublisher;
use huddle::matchmaking::{EngineConfig, MatchmakingEngine, PassCoordinator, TriggerOutcome};
use huddle::metrics::MetricsCollector;
use huddle::platform::MockVoicePlatform;
use huddle::queue::{InMemoryQueueStore, JoinOutcome, QueueService, QueueStore};
use huddle::types::{
    Bracket, JoinQueueRequest, LeaveQueueRequest, Mode, PlayerStats, PreferenceToggleRequest,
    ServerQueueState, SetCategoryRequest, Team,
};
use huddle::utils::current_timestamp;
use huddle::PassReport;
use std::sync::Arc;

pub const SERVER: &str = "integration-server";

/// Everything a scenario needs, sharing one store and one publisher
pub struct TestSystem {
    pub store: Arc<InMemoryQueueStore>,
    pub platform: Arc<MockVoicePlatform>,
    pub publisher: Arc<MockEventPublisher>,
    pub engine: Arc<MatchmakingEngine>,
    pub coordinator: Arc<PassCoordinator>,
    pub queue_service: QueueService,
}

impl TestSystem {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let store = Arc::new(InMemoryQueueStore::default());
        let platform = Arc::new(MockVoicePlatform::new());
        let publisher = Arc::new(MockEventPublisher::new());
        let metrics = Arc::new(MetricsCollector::new().unwrap());

        let engine = Arc::new(
            MatchmakingEngine::with_metrics(
                store.clone(),
                platform.clone(),
                platform.clone(),
                platform.clone(),
                publisher.clone(),
                config,
                metrics.clone(),
            )
            .unwrap(),
        );
        let coordinator = Arc::new(PassCoordinator::new(engine.clone()));
        let queue_service = QueueService::new(
            store.clone(),
            engine.classifier().clone(),
            publisher.clone(),
            metrics,
        );

        Self {
            store,
            platform,
            publisher,
            engine,
            coordinator,
            queue_service,
        }
    }

    /// Configure the team channel category for the test server
    pub async fn configure(&self) {
        self.queue_service
            .set_category(SetCategoryRequest {
                server_id: SERVER.to_string(),
                server_name: "Integration Server".to_string(),
                category_id: "team-category".to_string(),
                timestamp: current_timestamp(),
            })
            .await
            .unwrap();
    }

    /// Connect a player to voice and press join
    pub async fn join(&self, user_id: &str, skill: f64, experience: u32) -> JoinOutcome {
        self.platform.add_connected_members(SERVER, &[user_id]);
        self.queue_service
            .join(JoinQueueRequest {
                server_id: SERVER.to_string(),
                server_name: "Integration Server".to_string(),
                user_id: user_id.to_string(),
                in_voice: true,
                stats: Some(PlayerStats::new(skill, experience)),
                timestamp: current_timestamp(),
            })
            .await
            .unwrap()
    }

    pub async fn leave(&self, user_id: &str) -> Vec<Mode> {
        self.queue_service
            .leave(LeaveQueueRequest {
                server_id: SERVER.to_string(),
                user_id: user_id.to_string(),
                timestamp: current_timestamp(),
            })
            .await
            .unwrap()
    }

    /// Restrict a player to the given modes before they queue
    pub async fn prefer_only(&self, user_id: &str, modes: &[Mode]) {
        for mode in Mode::ALL {
            if !modes.contains(&mode) {
                self.queue_service
                    .toggle_preference(PreferenceToggleRequest {
                        server_id: SERVER.to_string(),
                        user_id: user_id.to_string(),
                        mode,
                        timestamp: current_timestamp(),
                    })
                    .await
                    .unwrap();
            }
        }
    }

    /// Trigger a pass and wait for the run, including coalesced reruns
    pub async fn run_passes(&self) -> Vec<PassReport> {
        match self.coordinator.trigger(SERVER).unwrap() {
            TriggerOutcome::Started(handle) => handle.await.unwrap(),
            TriggerOutcome::Coalesced => panic!("a pass was already running"),
        }
    }

    pub async fn state(&self) -> ServerQueueState {
        self.store.load_queue(SERVER).await.unwrap().unwrap()
    }

    pub fn teams(&self) -> Vec<Team> {
        self.publisher.matched_teams()
    }
}

/// Sorted member ids of a team
pub fn members(team: &Team) -> Vec<String> {
    let mut ids: Vec<String> = team.user_ids().into_iter().map(str::to_string).collect();
    ids.sort();
    ids
}

/// Stats landing in the given bracket with the default classifier
pub fn stats_for(bracket: Bracket) -> (f64, u32) {
    match bracket {
        // 0.7 * 1 + 0.3 * 2 = 1.3
        Bracket::Low => (1.0, 50),
        // 0.7 * 6 + 0.3 * 6 = 6.0
        Bracket::Mid => (6.0, 200),
        // 0.7 * 10 + 0.3 * 10 = 10.0
        Bracket::High => (10.0, 900),
    }
}
