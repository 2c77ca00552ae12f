//! Property tests for bracket classification and pass outcomes

mod fixtures;

use chrono::Utc;
use fixtures::SERVER;
use huddle::bracket::{partition_by_bracket, BracketClassifier, BracketConfig};
use huddle::matchmaking::{EngineConfig, MatchmakingEngine};
use huddle::platform::MockVoicePlatform;
use huddle::queue::{InMemoryQueueStore, QueueStore};
use huddle::types::{Mode, PlayerStats, QueueEntry, ServerQueueState};
use proptest::prelude::*;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

fn classifier() -> BracketClassifier {
    BracketClassifier::new(BracketConfig::default()).unwrap()
}

fn player_stats() -> impl Strategy<Value = (f64, u32)> {
    (0.0f64..=10.0, 0u32..1_000)
}

fn mode_set() -> impl Strategy<Value = BTreeSet<Mode>> {
    proptest::sample::subsequence(Mode::ALL.to_vec(), 1..=3)
        .prop_map(|modes| modes.into_iter().collect())
}

proptest! {
    #[test]
    fn classification_is_deterministic((skill, experience) in player_stats()) {
        let classifier = classifier();
        prop_assert_eq!(
            classifier.classify(skill, experience),
            classifier.classify(skill, experience)
        );
    }

    #[test]
    fn higher_skill_never_lowers_the_bracket(
        (skill, experience) in player_stats(),
        bump in 0.0f64..5.0,
    ) {
        let classifier = classifier();
        prop_assert!(
            classifier.classify(skill, experience) <= classifier.classify(skill + bump, experience)
        );
    }

    #[test]
    fn partition_keeps_every_entry_once(players in prop::collection::vec(player_stats(), 0..40)) {
        let classifier = classifier();
        let entries: Vec<QueueEntry> = players
            .iter()
            .enumerate()
            .map(|(i, (skill, experience))| {
                QueueEntry::new(format!("u{}", i), PlayerStats::new(*skill, *experience), Utc::now())
            })
            .collect();

        let groups = partition_by_bracket(&entries, &classifier);
        let total: usize = groups.values().map(Vec::len).sum();
        prop_assert_eq!(total, entries.len());

        for (bracket, group) in &groups {
            prop_assert!(group.iter().all(|entry| entry.bracket == Some(*bracket)));
            // Queue order survives within a bracket
            let positions: Vec<usize> = group
                .iter()
                .map(|entry| entries.iter().position(|e| e.user_id == entry.user_id).unwrap())
                .collect();
            prop_assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn a_pass_never_matches_anyone_twice(
        players in prop::collection::vec((player_stats(), mode_set()), 0..14),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();

        runtime.block_on(async {
            let store = Arc::new(InMemoryQueueStore::default());
            let platform = Arc::new(MockVoicePlatform::new());
            let publisher = Arc::new(huddle::amqp::publisher::MockEventPublisher::new());
            let engine = MatchmakingEngine::new(
                store.clone(),
                platform.clone(),
                platform.clone(),
                platform.clone(),
                publisher,
                EngineConfig::default(),
            )
            .unwrap();

            let mut state = ServerQueueState::new(SERVER, "Property Server");
            state.category = Some("category".to_string());
            for (i, ((skill, experience), modes)) in players.iter().enumerate() {
                let user_id = format!("u{}", i);
                platform.add_connected_members(SERVER, &[user_id.as_str()]);
                state.preferences.set(user_id.clone(), modes.clone());
                for mode in modes {
                    state.queues.get_mut(*mode).push(QueueEntry::new(
                        user_id.clone(),
                        PlayerStats::new(*skill, *experience),
                        Utc::now() + chrono::Duration::seconds(i as i64),
                    ));
                }
            }
            store.save_queue(state).await.unwrap();

            let report = engine.run_pass(SERVER).await.unwrap();
            let classifier = classifier();

            let mut matched = HashSet::new();
            for team in &report.teams {
                assert_eq!(team.size(), team.mode.team_size());
                for player in &team.players {
                    assert!(matched.insert(player.user_id.clone()), "{} matched twice", player.user_id);
                    assert_eq!(
                        classifier.classify(player.skill_score, player.experience),
                        team.bracket
                    );
                }
            }

            let remaining = store.load_queue(SERVER).await.unwrap().unwrap();
            for user_id in &matched {
                assert!(!remaining.queues.is_queued(user_id));
            }
        });
    }
}
