//! Working copy of one server's queues for a single matchmaking pass
//!
//! Bracket tasks of a pass run interleaved on one task and share this working copy.
//! Every read and write goes through its methods, which take the lock only for the
//! duration of the call so no guard ever lives across an await. The store only sees
//! the pass's effects through [`PassState::commit`].

use crate::bracket::{brackets_present, partition_by_bracket, BracketClassifier};
use crate::error::{MatchmakingError, Result};
use crate::queue::store::QueueStore;
use crate::types::{Bracket, Mode, QueueEntry, ServerId, ServerQueueState, Team, UserId};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug)]
struct WorkingCopy {
    /// Latest known document, with finalized and dropped players already removed
    state: ServerQueueState,
    /// Players held by a candidate team or already finalized in this pass
    claimed: HashSet<UserId>,
    /// Players to be removed from every queue at commit
    removals: HashSet<UserId>,
    teams: Vec<Team>,
}

impl WorkingCopy {
    fn unclaimed(&self, mode: Mode) -> Vec<QueueEntry> {
        self.state
            .queues
            .get(mode)
            .iter()
            .filter(|entry| !self.claimed.contains(&entry.user_id))
            .cloned()
            .collect()
    }
}

/// Shared working copy for one pass
#[derive(Debug)]
pub struct PassState {
    server_id: ServerId,
    inner: Mutex<WorkingCopy>,
}

impl PassState {
    pub fn new(state: ServerQueueState) -> Self {
        Self {
            server_id: state.server_id.clone(),
            inner: Mutex::new(WorkingCopy {
                state,
                claimed: HashSet::new(),
                removals: HashSet::new(),
                teams: Vec::new(),
            }),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    fn lock(&self) -> Result<MutexGuard<'_, WorkingCopy>> {
        self.inner.lock().map_err(|_| {
            MatchmakingError::InternalError {
                message: format!("Pass state lock poisoned for server {}", self.server_id),
            }
            .into()
        })
    }

    /// Unclaimed entries of a mode grouped by freshly computed bracket
    pub fn partition(
        &self,
        mode: Mode,
        classifier: &BracketClassifier,
    ) -> Result<BTreeMap<Bracket, Vec<QueueEntry>>> {
        let copy = self.lock()?;
        Ok(partition_by_bracket(&copy.unclaimed(mode), classifier))
    }

    /// Brackets with at least one unclaimed entry in the mode
    pub fn brackets_in(&self, mode: Mode, classifier: &BracketClassifier) -> Result<Vec<Bracket>> {
        let copy = self.lock()?;
        Ok(brackets_present(&copy.unclaimed(mode), classifier))
    }

    /// Claim the given users if none of them is claimed yet
    pub fn claim(&self, user_ids: &[UserId]) -> Result<bool> {
        let mut copy = self.lock()?;
        if user_ids.iter().any(|user_id| copy.claimed.contains(user_id)) {
            return Ok(false);
        }
        copy.claimed.extend(user_ids.iter().cloned());
        Ok(true)
    }

    /// Claim the `count` oldest unclaimed entries of a bracket.
    ///
    /// Returns `None`, claiming nothing, when fewer than `count` are available.
    pub fn claim_oldest(
        &self,
        mode: Mode,
        bracket: Bracket,
        count: usize,
        classifier: &BracketClassifier,
    ) -> Result<Option<Vec<QueueEntry>>> {
        let mut copy = self.lock()?;
        let mut selected = Vec::with_capacity(count);
        for mut entry in copy.unclaimed(mode) {
            if classifier.classify_entry(&mut entry) == bracket {
                selected.push(entry);
                if selected.len() == count {
                    break;
                }
            }
        }

        if selected.len() < count {
            return Ok(None);
        }

        copy.claimed
            .extend(selected.iter().map(|entry| entry.user_id.clone()));
        Ok(Some(selected))
    }

    /// Claim the oldest unclaimed same-bracket entry from `pool` modes whose owner has
    /// opted into `target`. Pools are searched in order.
    pub fn claim_promotion_candidate(
        &self,
        pool: &[Mode],
        bracket: Bracket,
        target: Mode,
        classifier: &BracketClassifier,
    ) -> Result<Option<QueueEntry>> {
        let mut copy = self.lock()?;
        let mut found = None;
        'pools: for mode in pool {
            for mut entry in copy.unclaimed(*mode) {
                if classifier.classify_entry(&mut entry) == bracket
                    && copy.state.preferences.allows(&entry.user_id, target)
                {
                    found = Some(entry);
                    break 'pools;
                }
            }
        }

        if let Some(entry) = &found {
            copy.claimed.insert(entry.user_id.clone());
        }
        Ok(found)
    }

    /// Whether every listed user has opted into the mode
    pub fn all_allow(&self, user_ids: &[&str], mode: Mode) -> Result<bool> {
        let copy = self.lock()?;
        Ok(copy
            .state
            .preferences
            .all_allow(user_ids.iter().copied(), mode))
    }

    /// Give candidates back to the queue. Their slots were never removed.
    pub fn release(&self, user_ids: &[UserId]) -> Result<()> {
        let mut copy = self.lock()?;
        for user_id in user_ids {
            copy.claimed.remove(user_id);
        }
        Ok(())
    }

    /// Drop players from every queue at commit without forming a team
    pub fn drop_players(&self, user_ids: &[UserId]) -> Result<()> {
        let mut copy = self.lock()?;
        let targets: HashSet<UserId> = user_ids.iter().cloned().collect();
        copy.state.queues.remove_users(&targets);
        copy.claimed.extend(targets.iter().cloned());
        copy.removals.extend(targets);
        Ok(())
    }

    /// Remove a team's members from every mode of the working copy and mark them
    /// for removal at commit
    pub fn finalize_members(&self, team: &Team) -> Result<()> {
        let mut copy = self.lock()?;
        let members: HashSet<UserId> = team
            .players
            .iter()
            .map(|player| player.user_id.clone())
            .collect();
        copy.state.queues.remove_users(&members);
        copy.claimed.extend(members.iter().cloned());
        copy.removals.extend(members);
        Ok(())
    }

    pub fn record_team(&self, team: Team) -> Result<()> {
        let mut copy = self.lock()?;
        copy.teams.push(team);
        Ok(())
    }

    /// Replace the working copy with the latest document from the store.
    ///
    /// Players already finalized or dropped in this pass stay removed, and claims
    /// are kept so in-flight candidates are not selected again.
    pub fn refresh(&self, latest: ServerQueueState) -> Result<()> {
        let mut copy = self.lock()?;
        let mut latest = latest;
        latest.queues.remove_users(&copy.removals);
        copy.state = latest;
        debug!(
            "Refreshed working copy for server {} ({} slots)",
            self.server_id,
            copy.state.queues.total_entries()
        );
        Ok(())
    }

    pub fn teams(&self) -> Result<Vec<Team>> {
        let copy = self.lock()?;
        Ok(copy.teams.clone())
    }

    /// Entries still waiting in the working copy, including claimed ones
    pub fn remaining(&self, mode: Mode) -> Result<Vec<QueueEntry>> {
        let copy = self.lock()?;
        Ok(copy.state.queues.get(mode).clone())
    }

    /// Persist every removal made during the pass in one queue-only write
    pub async fn commit(&self, store: &dyn QueueStore) -> Result<usize> {
        let removals = {
            let copy = self.lock()?;
            copy.removals.clone()
        };
        if removals.is_empty() {
            return Ok(0);
        }
        store.remove_players(&self.server_id, &removals).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::store::InMemoryQueueStore;
    use crate::types::PlayerStats;
    use chrono::{Duration, Utc};

    fn state_with(mode: Mode, players: &[(&str, f64)]) -> ServerQueueState {
        let start = Utc::now();
        let mut state = ServerQueueState::new("s1", "Server");
        state.category = Some("cat".to_string());
        for (i, (user_id, skill)) in players.iter().enumerate() {
            state.queues.get_mut(mode).push(QueueEntry::new(
                *user_id,
                PlayerStats::new(*skill, 50),
                start + Duration::seconds(i as i64),
            ));
        }
        state
    }

    fn ids(entries: &[QueueEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.user_id.as_str()).collect()
    }

    #[test]
    fn test_claim_oldest_is_fifo_and_exclusive() {
        let classifier = BracketClassifier::default();
        let pass = PassState::new(state_with(
            Mode::Twos,
            &[("a", 2.0), ("hi", 12.0), ("b", 2.0), ("c", 2.0)],
        ));

        let first = pass
            .claim_oldest(Mode::Twos, Bracket::Low, 2, &classifier)
            .unwrap()
            .unwrap();
        assert_eq!(ids(&first), vec!["a", "b"]);
        assert!(first.iter().all(|e| e.bracket == Some(Bracket::Low)));

        // Only "c" is left unclaimed in the low bracket
        assert!(pass
            .claim_oldest(Mode::Twos, Bracket::Low, 2, &classifier)
            .unwrap()
            .is_none());

        pass.release(&["a".to_string()]).unwrap();
        let second = pass
            .claim_oldest(Mode::Twos, Bracket::Low, 2, &classifier)
            .unwrap()
            .unwrap();
        assert_eq!(ids(&second), vec!["a", "c"]);
    }

    #[test]
    fn test_promotion_candidate_respects_preferences() {
        let classifier = BracketClassifier::default();
        let mut state = state_with(Mode::Twos, &[("a", 2.0), ("b", 2.0), ("c", 2.0), ("d", 2.0)]);
        state.preferences.toggle("c", Mode::Threes);
        let pass = PassState::new(state);

        pass.claim_oldest(Mode::Twos, Bracket::Low, 2, &classifier)
            .unwrap();
        let candidate = pass
            .claim_promotion_candidate(&[Mode::Twos], Bracket::Low, Mode::Threes, &classifier)
            .unwrap()
            .unwrap();
        assert_eq!(candidate.user_id, "d");
        assert!(!pass.all_allow(&["a", "c"], Mode::Threes).unwrap());
        assert!(pass.all_allow(&["a", "d"], Mode::Threes).unwrap());
    }

    #[test]
    fn test_refresh_keeps_finalized_players_out() {
        let classifier = BracketClassifier::default();
        let original = state_with(Mode::Twos, &[("a", 2.0), ("b", 2.0)]);
        let pass = PassState::new(original.clone());

        let members = pass
            .claim_oldest(Mode::Twos, Bracket::Low, 2, &classifier)
            .unwrap()
            .unwrap();
        let team = Team {
            id: crate::utils::generate_team_id(),
            server_id: "s1".to_string(),
            mode: Mode::Twos,
            bracket: Bracket::Low,
            players: members,
            matched_at: Utc::now(),
            promoted_from: None,
            channel: None,
        };
        pass.finalize_members(&team).unwrap();

        // The store still has a and b until commit
        let mut latest = original;
        latest.queues.twos.push(QueueEntry::new(
            "late",
            PlayerStats::new(2.0, 50),
            Utc::now(),
        ));
        pass.refresh(latest).unwrap();

        assert_eq!(ids(&pass.remaining(Mode::Twos).unwrap()), vec!["late"]);
    }

    #[tokio::test]
    async fn test_commit_is_single_batched_removal() {
        let store = InMemoryQueueStore::default();
        let mut original = state_with(Mode::Twos, &[("a", 2.0), ("b", 2.0), ("c", 2.0)]);
        original
            .queues
            .fours
            .push(QueueEntry::new("a", PlayerStats::new(2.0, 50), Utc::now()));
        store.save_queue(original.clone()).await.unwrap();

        let pass = PassState::new(original);
        assert_eq!(pass.commit(&store).await.unwrap(), 0);

        pass.drop_players(&["a".to_string()]).unwrap();
        assert_eq!(pass.commit(&store).await.unwrap(), 2);

        let stored = store.load_queue("s1").await.unwrap().unwrap();
        assert!(!stored.queues.is_queued("a"));
        assert_eq!(stored.queues.len(Mode::Twos), 2);
    }
}
