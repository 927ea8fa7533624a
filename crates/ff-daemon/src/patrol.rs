use std::time::Duration;

use chrono::{DateTime, Utc};
use ff_agents::Orchestrator;
use ff_core::types::{AgentStatus, TaskId, TaskStats};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Result of a single patrol sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatrolReport {
    /// Tasks in progress for longer than the stalled threshold.
    pub stalled_task_ids: Vec<TaskId>,
    pub stats: TaskStats,
    pub idle_agents: usize,
    pub working_agents: usize,
    pub timestamp: DateTime<Utc>,
}

/// Periodic read-only sweep over the orchestrator: reports stalled runs and
/// overall progress. Never changes task or agent state.
pub struct PatrolRunner {
    stalled_after: Duration,
}

impl PatrolRunner {
    pub fn new(stalled_after: Duration) -> Self {
        Self { stalled_after }
    }

    pub fn run_patrol(&self, orchestrator: &Orchestrator) -> PatrolReport {
        debug!("patrol sweep starting");
        let now = Utc::now();

        let stalled = orchestrator.task_store().stalled(self.stalled_after);
        for task in &stalled {
            let since = task.started_at.unwrap_or(task.updated_at);
            warn!(
                task_id = %task.id,
                agent_id = task.assigned_agent.as_ref().map(|a| a.as_str()).unwrap_or("none"),
                running_mins = now.signed_duration_since(since).num_minutes(),
                "task appears stalled"
            );
        }

        let agents = orchestrator.agents();
        let count = |status: AgentStatus| agents.iter().filter(|a| a.status == status).count();
        let report = PatrolReport {
            stalled_task_ids: stalled.into_iter().map(|t| t.id).collect(),
            stats: orchestrator.stats(),
            idle_agents: count(AgentStatus::Idle),
            working_agents: count(AgentStatus::Working),
            timestamp: now,
        };

        info!(
            total = report.stats.total,
            completed = report.stats.completed,
            in_progress = report.stats.in_progress,
            failed = report.stats.failed,
            blocked = report.stats.blocked,
            progress_pct = report.stats.completion_percentage,
            stalled = report.stalled_task_ids.len(),
            idle_agents = report.idle_agents,
            working_agents = report.working_agents,
            "patrol completed"
        );
        report
    }
}
