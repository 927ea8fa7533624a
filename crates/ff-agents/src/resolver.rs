use std::sync::Arc;

use tracing::debug;

use crate::coordinator::{ExecutionCoordinator, GateMode, Started};
use crate::error::{OrchestratorError, Result};
use crate::task_store::TaskStore;

/// Finds runnable tasks and starts as many as agents and concurrency allow.
pub struct DependencyResolver {
    store: Arc<TaskStore>,
    coordinator: Arc<ExecutionCoordinator>,
}

impl DependencyResolver {
    pub fn new(store: Arc<TaskStore>, coordinator: Arc<ExecutionCoordinator>) -> Self {
        Self { store, coordinator }
    }

    /// One scheduling pass in phase/priority order.
    ///
    /// Tasks with no idle agent for their role are skipped so that later
    /// tasks needing other roles can still start. Tasks that changed since
    /// the runnable snapshot, or whose gate is held elsewhere, are skipped
    /// too. A storage failure aborts the pass; runs started before it stay
    /// in progress and are reconciled by the next recovery.
    pub async fn tick(&self) -> Result<Vec<Started>> {
        let runnable = self.store.runnable();
        let mut started = Vec::new();
        for task in runnable {
            if self.coordinator.available_slots() == 0 {
                debug!("concurrency limit reached, ending tick");
                break;
            }
            match self.coordinator.try_dispatch(&task.id, GateMode::Skip).await {
                Ok(Some(run)) => started.push(run),
                Ok(None) => debug!(task_id = %task.id, "task busy, skipped"),
                Err(OrchestratorError::NoAgentAvailable { role }) => {
                    debug!(task_id = %task.id, role = %role, "no idle agent, skipped");
                }
                Err(OrchestratorError::AtCapacity { .. }) => break,
                Err(e @ OrchestratorError::Storage(_)) => return Err(e),
                Err(e) => debug!(task_id = %task.id, error = %e, "task changed since snapshot"),
            }
        }
        Ok(started)
    }
}
