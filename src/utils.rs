//! Utility functions for the matchmaking service

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;
use uuid::Uuid;

/// Generate a new unique team ID
pub fn generate_team_id() -> Uuid {
    Uuid::new_v4()
}

/// Generate a new unique channel ID for locally allocated channel handles
pub fn generate_channel_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Get the current UTC timestamp
pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// Pick a whole-second duration uniformly from `[min_seconds, max_seconds]`
pub fn random_duration_between(min_seconds: u64, max_seconds: u64) -> Duration {
    if max_seconds <= min_seconds {
        return Duration::from_secs(min_seconds);
    }
    let seconds = rand::rng().random_range(min_seconds..=max_seconds);
    Duration::from_secs(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_unique_ids() {
        let id1 = generate_team_id();
        let id2 = generate_team_id();
        assert_ne!(id1, id2);

        let channel1 = generate_channel_id();
        let channel2 = generate_channel_id();
        assert_ne!(channel1, channel2);
        assert!(!channel1.contains('-'));
    }

    #[test]
    fn test_random_duration_stays_in_window() {
        for _ in 0..100 {
            let wait = random_duration_between(10, 20);
            assert!(wait >= Duration::from_secs(10));
            assert!(wait <= Duration::from_secs(20));
        }
    }

    #[test]
    fn test_random_duration_degenerate_window() {
        assert_eq!(random_duration_between(5, 5), Duration::from_secs(5));
        assert_eq!(random_duration_between(7, 3), Duration::from_secs(7));
    }
}
