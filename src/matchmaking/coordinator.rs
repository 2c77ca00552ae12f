//! Per-server pass serialization
//!
//! At most one pass runs per server. A trigger that arrives while a pass is running
//! is folded into a single follow-up pass, started as soon as the current one ends.

use crate::error::{MatchmakingError, Result};
use crate::matchmaking::engine::{MatchmakingEngine, PassReport};
use crate::metrics::MetricsCollector;
use crate::types::ServerId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    RerunPending,
}

/// Result of asking for a pass
#[derive(Debug)]
pub enum TriggerOutcome {
    /// A new pass loop was spawned; it yields the report of every pass it ran
    Started(JoinHandle<Vec<PassReport>>),
    /// A pass is already running and will be followed by one more
    Coalesced,
}

/// Frees a server's run slot when a pass loop ends without reaching
/// [`PassCoordinator::finish_or_rerun`], such as after a panic or an abort.
struct RunSlot {
    coordinator: Arc<PassCoordinator>,
    server_id: ServerId,
    released: bool,
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Ok(mut runs) = self.coordinator.runs.lock() {
            runs.remove(&self.server_id);
        }
        warn!("Pass loop for server {} ended abnormally", self.server_id);
    }
}

pub struct PassCoordinator {
    engine: Arc<MatchmakingEngine>,
    runs: Mutex<HashMap<ServerId, RunState>>,
    metrics: Arc<MetricsCollector>,
}

impl PassCoordinator {
    pub fn new(engine: Arc<MatchmakingEngine>) -> Self {
        let metrics = engine.metrics();
        Self {
            engine,
            runs: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub fn engine(&self) -> &Arc<MatchmakingEngine> {
        &self.engine
    }

    /// Request a pass for a server
    pub fn trigger(self: &Arc<Self>, server_id: &str) -> Result<TriggerOutcome> {
        let mut runs = self.runs.lock().map_err(|_| MatchmakingError::InternalError {
            message: "Failed to acquire pass coordinator lock".to_string(),
        })?;

        if let Some(state) = runs.get_mut(server_id) {
            if *state == RunState::Running {
                debug!("Pass already running for server {}, queueing a rerun", server_id);
            }
            *state = RunState::RerunPending;
            self.metrics.record_coalesced_trigger();
            return Ok(TriggerOutcome::Coalesced);
        }

        runs.insert(server_id.to_string(), RunState::Running);
        drop(runs);

        let coordinator = Arc::clone(self);
        let server_id = server_id.to_string();
        let handle = tokio::spawn(async move { coordinator.drive(server_id).await });
        Ok(TriggerOutcome::Started(handle))
    }

    /// Request a pass for every listed server
    pub fn trigger_all(self: &Arc<Self>, server_ids: &[ServerId]) -> usize {
        let mut started = 0;
        for server_id in server_ids {
            match self.trigger(server_id) {
                Ok(TriggerOutcome::Started(_)) => started += 1,
                Ok(TriggerOutcome::Coalesced) => {}
                Err(e) => error!("Failed to trigger pass for server {}: {}", server_id, e),
            }
        }
        started
    }

    pub fn is_running(&self, server_id: &str) -> bool {
        self.runs
            .lock()
            .map(|runs| runs.contains_key(server_id))
            .unwrap_or(false)
    }

    /// Number of servers with a pass in flight
    pub fn in_flight(&self) -> usize {
        self.runs.lock().map(|runs| runs.len()).unwrap_or(0)
    }

    async fn drive(self: Arc<Self>, server_id: ServerId) -> Vec<PassReport> {
        let mut reports = Vec::new();
        let mut slot = RunSlot {
            coordinator: Arc::clone(&self),
            server_id: server_id.clone(),
            released: false,
        };

        loop {
            match self.engine.run_pass(&server_id).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    let configuration = e
                        .downcast_ref::<MatchmakingError>()
                        .is_some_and(|err| err.is_configuration_error());
                    if configuration {
                        warn!("Skipped pass for server {}: {}", server_id, e);
                    } else {
                        error!("Pass failed for server {}: {}", server_id, e);
                    }
                }
            }

            if !self.finish_or_rerun(&server_id) {
                slot.released = true;
                break;
            }
        }

        reports
    }

    /// Returns true when another pass was requested while this one ran
    fn finish_or_rerun(&self, server_id: &str) -> bool {
        let mut runs = match self.runs.lock() {
            Ok(runs) => runs,
            Err(_) => {
                error!("Pass coordinator lock poisoned, stopping passes for {}", server_id);
                return false;
            }
        };

        match runs.get_mut(server_id) {
            Some(state) if *state == RunState::RerunPending => {
                *state = RunState::Running;
                true
            }
            _ => {
                runs.remove(server_id);
                false
            }
        }
    }
}
