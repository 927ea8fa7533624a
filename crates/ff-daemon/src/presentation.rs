//! Status-to-presentation mapping for the dashboard.
//!
//! The core knows nothing about how statuses are rendered; the dashboard
//! asks these functions for a label and a CSS class.

use ff_core::types::{AgentStatus, Severity, TaskStatus};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Badge {
    pub label: &'static str,
    pub css_class: &'static str,
}

const fn badge(label: &'static str, css_class: &'static str) -> Badge {
    Badge { label, css_class }
}

pub fn task_badge(status: TaskStatus) -> Badge {
    match status {
        TaskStatus::Pending => badge("Pending", "status-pending"),
        TaskStatus::InProgress => badge("In progress", "status-in-progress"),
        TaskStatus::Completed => badge("Completed", "status-completed"),
        TaskStatus::Failed => badge("Failed", "status-failed"),
        TaskStatus::Blocked => badge("Blocked", "status-blocked"),
    }
}

pub fn agent_badge(status: AgentStatus) -> Badge {
    match status {
        AgentStatus::Idle => badge("Idle", "agent-idle"),
        AgentStatus::Active => badge("On hold", "agent-active"),
        AgentStatus::Working => badge("Working", "agent-working"),
        AgentStatus::Offline => badge("Offline", "agent-offline"),
    }
}

pub fn severity_badge(severity: Severity) -> Badge {
    match severity {
        Severity::Info => badge("Info", "log-info"),
        Severity::Success => badge("Success", "log-success"),
        Severity::Warning => badge("Warning", "log-warning"),
        Severity::Error => badge("Error", "log-error"),
    }
}
