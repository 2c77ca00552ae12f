//! Skill brackets
//!
//! Classification of players into brackets and grouping of a queue by bracket.

pub mod classifier;
pub mod partition;

pub use classifier::{BracketClassifier, BracketConfig};
pub use partition::{brackets_present, partition_by_bracket};
