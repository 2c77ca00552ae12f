//! Skill bracket classification
//!
//! Maps a player's skill score and experience metric onto one of three brackets.
//! Classification is pure and cheap, so callers recompute it every time they group
//! players instead of trusting a cached bracket.

use crate::error::{MatchmakingError, Result};
use crate::types::{Bracket, PlayerStats, QueueEntry};
use serde::{Deserialize, Serialize};

/// Configuration for bracket classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BracketConfig {
    /// Skill score reported when the stat lookup found nothing
    pub unknown_skill_sentinel: f64,
    /// Weight of the skill score in the blended value
    pub skill_weight: f64,
    /// Weight of the experience-derived score in the blended value
    pub experience_weight: f64,
    /// Experience below this maps to `low_experience_score`
    pub low_experience_below: u32,
    /// Experience below this (and at least `low_experience_below`) maps to `mid_experience_score`
    pub mid_experience_below: u32,
    pub low_experience_score: f64,
    pub mid_experience_score: f64,
    pub high_experience_score: f64,
    /// Blended values up to and including this are bracket 1
    pub low_bracket_max: f64,
    /// Blended values up to and including this are bracket 2, anything above is bracket 3
    pub mid_bracket_max: f64,
}

impl Default for BracketConfig {
    fn default() -> Self {
        Self {
            unknown_skill_sentinel: 1000.0,
            skill_weight: 0.7,
            experience_weight: 0.3,
            low_experience_below: 100,
            mid_experience_below: 400,
            low_experience_score: 2.0,
            mid_experience_score: 6.0,
            high_experience_score: 10.0,
            low_bracket_max: 3.0,
            mid_bracket_max: 8.0,
        }
    }
}

impl BracketConfig {
    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !self.skill_weight.is_finite() || self.skill_weight < 0.0 {
            return Err(MatchmakingError::ConfigurationError {
                message: "skill_weight must be a non-negative number".to_string(),
            }
            .into());
        }

        if !self.experience_weight.is_finite() || self.experience_weight < 0.0 {
            return Err(MatchmakingError::ConfigurationError {
                message: "experience_weight must be a non-negative number".to_string(),
            }
            .into());
        }

        if self.skill_weight + self.experience_weight == 0.0 {
            return Err(MatchmakingError::ConfigurationError {
                message: "skill_weight and experience_weight cannot both be zero".to_string(),
            }
            .into());
        }

        if self.low_experience_below >= self.mid_experience_below {
            return Err(MatchmakingError::ConfigurationError {
                message: "low_experience_below must be less than mid_experience_below".to_string(),
            }
            .into());
        }

        if self.low_bracket_max >= self.mid_bracket_max {
            return Err(MatchmakingError::ConfigurationError {
                message: "low_bracket_max must be less than mid_bracket_max".to_string(),
            }
            .into());
        }

        Ok(())
    }
}

/// Assigns players to skill brackets
#[derive(Debug, Clone, Default)]
pub struct BracketClassifier {
    config: BracketConfig,
}

impl BracketClassifier {
    pub fn new(config: BracketConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &BracketConfig {
        &self.config
    }

    /// Three-tier step function over the experience metric
    pub fn substitute_score(&self, experience: u32) -> f64 {
        if experience < self.config.low_experience_below {
            self.config.low_experience_score
        } else if experience < self.config.mid_experience_below {
            self.config.mid_experience_score
        } else {
            self.config.high_experience_score
        }
    }

    /// Value the bracket thresholds are applied to
    pub fn blended_score(&self, skill_score: f64, experience: u32) -> f64 {
        let substitute = self.substitute_score(experience);
        if skill_score == self.config.unknown_skill_sentinel {
            return substitute;
        }
        self.config.skill_weight * skill_score + self.config.experience_weight * substitute
    }

    pub fn classify(&self, skill_score: f64, experience: u32) -> Bracket {
        let blended = self.blended_score(skill_score, experience);
        if blended <= self.config.low_bracket_max {
            Bracket::Low
        } else if blended <= self.config.mid_bracket_max {
            Bracket::Mid
        } else {
            Bracket::High
        }
    }

    pub fn classify_stats(&self, stats: PlayerStats) -> Bracket {
        self.classify(stats.skill_score, stats.experience)
    }

    /// Classify from the entry's current stats and refresh its cached bracket
    pub fn classify_entry(&self, entry: &mut QueueEntry) -> Bracket {
        let bracket = self.classify(entry.skill_score, entry.experience);
        entry.bracket = Some(bracket);
        bracket
    }
}
