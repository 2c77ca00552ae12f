//! Team formation
//!
//! A pass forms 4v4 teams instantly, then runs the promotion window for the 3v3
//! and 2v2 brackets before committing removals in one write.

pub mod coordinator;
pub mod engine;
pub mod finalizer;
pub mod pass;
pub mod promotion;

pub use coordinator::{PassCoordinator, TriggerOutcome};
pub use engine::{EngineConfig, EngineStats, MatchmakingEngine, PassReport};
pub use finalizer::TeamFinalizer;
pub use pass::PassState;
pub use promotion::{BracketOutcome, PromotionConfig, PromotionScheduler};
