//! Service layer for the huddle matchmaking service
//!
//! This module contains the main application state, command routing,
//! and background task management for the production service.

pub mod app;
pub mod health;

pub use app::{run_change_listener, AppState, ServiceCore, ServiceError};
pub use health::{HealthCheck, HealthStatus};
