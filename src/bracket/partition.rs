//! Grouping a mode's queue by bracket

use crate::bracket::classifier::BracketClassifier;
use crate::types::{Bracket, QueueEntry};
use std::collections::BTreeMap;

/// Group entries by freshly computed bracket, keeping queue order within each group.
///
/// Returned entries carry the refreshed bracket in their cache field.
pub fn partition_by_bracket(
    entries: &[QueueEntry],
    classifier: &BracketClassifier,
) -> BTreeMap<Bracket, Vec<QueueEntry>> {
    let mut groups: BTreeMap<Bracket, Vec<QueueEntry>> = BTreeMap::new();
    for entry in entries {
        let mut entry = entry.clone();
        let bracket = classifier.classify_entry(&mut entry);
        groups.entry(bracket).or_default().push(entry);
    }
    groups
}

/// Brackets that have at least one entry, lowest first
pub fn brackets_present(entries: &[QueueEntry], classifier: &BracketClassifier) -> Vec<Bracket> {
    let mut brackets: Vec<Bracket> = entries
        .iter()
        .map(|entry| classifier.classify(entry.skill_score, entry.experience))
        .collect();
    brackets.sort();
    brackets.dedup();
    brackets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PlayerStats;
    use chrono::{Duration, Utc};

    fn entries() -> Vec<QueueEntry> {
        let start = Utc::now();
        let roster = [
            ("low-1", 2.0, 50),
            ("high-1", 10.0, 500),
            ("mid-1", 5.0, 200),
            ("low-2", 1.0, 20),
            ("mid-2", 1000.0, 150),
            ("low-3", 1000.0, 10),
        ];
        roster
            .iter()
            .enumerate()
            .map(|(i, (id, skill, exp))| {
                QueueEntry::new(
                    *id,
                    PlayerStats::new(*skill, *exp),
                    start + Duration::seconds(i as i64),
                )
            })
            .collect()
    }

    #[test]
    fn test_partition_preserves_queue_order() {
        let classifier = BracketClassifier::default();
        let groups = partition_by_bracket(&entries(), &classifier);

        let ids = |bracket: Bracket| -> Vec<String> {
            groups[&bracket].iter().map(|e| e.user_id.clone()).collect()
        };
        assert_eq!(ids(Bracket::Low), vec!["low-1", "low-2", "low-3"]);
        assert_eq!(ids(Bracket::Mid), vec!["mid-1", "mid-2"]);
        assert_eq!(ids(Bracket::High), vec!["high-1"]);
    }

    #[test]
    fn test_partition_sets_bracket_cache() {
        let classifier = BracketClassifier::default();
        let groups = partition_by_bracket(&entries(), &classifier);
        for (bracket, group) in &groups {
            assert!(group.iter().all(|entry| entry.bracket == Some(*bracket)));
        }
    }

    #[test]
    fn test_empty_queue_has_no_groups() {
        let classifier = BracketClassifier::default();
        assert!(partition_by_bracket(&[], &classifier).is_empty());
        assert!(brackets_present(&[], &classifier).is_empty());
    }

    #[test]
    fn test_brackets_present_deduplicates() {
        let classifier = BracketClassifier::default();
        assert_eq!(
            brackets_present(&entries(), &classifier),
            vec![Bracket::Low, Bracket::Mid, Bracket::High]
        );
    }
}
