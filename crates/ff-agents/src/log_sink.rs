//! Append-only execution log.
//!
//! Every state transition is written through [`LogSink::commit`], which
//! persists task rows, agent rows and log events in one transaction and only
//! then publishes the events to the in-memory tail and live subscribers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use ff_core::db::{Commit, EventDraft, StateDb};
use ff_core::types::{AgentId, LogEvent, Severity, TaskId};
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

/// Filter for [`LogSink::snapshot`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    pub agent: Option<AgentId>,
    #[serde(default)]
    pub task: Option<TaskId>,
    #[serde(default)]
    pub min_severity: Option<Severity>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl LogQuery {
    pub fn for_task(task: impl Into<TaskId>) -> Self {
        Self {
            task: Some(task.into()),
            ..Self::default()
        }
    }

    fn matches(&self, event: &LogEvent) -> bool {
        self.agent
            .as_ref()
            .map_or(true, |a| event.agent_id.as_ref() == Some(a))
            && self
                .task
                .as_ref()
                .map_or(true, |t| event.task_id.as_ref() == Some(t))
            && self
                .min_severity
                .map_or(true, |s| event.severity.rank() >= s.rank())
    }
}

pub struct LogSink {
    db: Arc<StateDb>,
    recent: Mutex<VecDeque<Arc<LogEvent>>>,
    subscribers: Mutex<Vec<flume::Sender<Arc<LogEvent>>>>,
    retain: usize,
}

impl LogSink {
    /// Open the sink, seeding the in-memory tail from the newest `retain`
    /// persisted events.
    pub async fn open(db: Arc<StateDb>, retain: usize) -> Result<Self> {
        let retain = retain.max(1);
        let tail = db.load_recent_events(retain).await?;
        Ok(Self {
            db,
            recent: Mutex::new(tail.into_iter().map(Arc::new).collect()),
            subscribers: Mutex::new(Vec::new()),
            retain,
        })
    }

    pub fn db(&self) -> &Arc<StateDb> {
        &self.db
    }

    /// Append one standalone event.
    pub async fn append(
        &self,
        severity: Severity,
        agent_id: Option<AgentId>,
        task_id: Option<TaskId>,
        message: impl Into<String>,
    ) -> Result<LogEvent> {
        let draft = EventDraft::new(severity, agent_id, task_id, message);
        self.commit(Commit::new().event(draft))
            .await?
            .pop()
            .ok_or_else(|| OrchestratorError::Storage("event insert returned no row".into()))
    }

    /// Persist a transition atomically, then publish its events.
    pub async fn commit(&self, commit: Commit) -> Result<Vec<LogEvent>> {
        let logged = self.db.commit(commit).await?;
        for event in &logged {
            self.publish(Arc::new(event.clone()));
        }
        Ok(logged)
    }

    fn publish(&self, event: Arc<LogEvent>) {
        {
            let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
            // Concurrent commits may finish out of order; keep the tail sorted.
            let pos = recent.partition_point(|e| e.seq < event.seq);
            recent.insert(pos, event.clone());
            while recent.len() > self.retain {
                recent.pop_front();
            }
        }
        let mut senders = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Newest matching events (at most `limit`), oldest first.
    pub fn snapshot(&self, query: &LogQuery) -> Vec<LogEvent> {
        let recent: Vec<Arc<LogEvent>> = {
            let guard = self.recent.lock().unwrap_or_else(|e| e.into_inner());
            guard.iter().cloned().collect()
        };
        let limit = query.limit.unwrap_or(usize::MAX);
        let mut out: Vec<LogEvent> = recent
            .iter()
            .rev()
            .filter(|e| query.matches(e))
            .take(limit)
            .map(|e| (**e).clone())
            .collect();
        out.reverse();
        out
    }

    /// Full persisted history of one task, oldest first.
    pub async fn history(&self, task_id: &TaskId) -> Result<Vec<LogEvent>> {
        Ok(self.db.events_for_task(task_id).await?)
    }

    /// Live feed of events published after this call.
    pub fn subscribe(&self) -> flume::Receiver<Arc<LogEvent>> {
        let (tx, rx) = flume::unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sink(retain: usize) -> LogSink {
        let db = Arc::new(StateDb::new_in_memory().await.unwrap());
        LogSink::open(db, retain).await.unwrap()
    }

    #[tokio::test]
    async fn append_assigns_increasing_seq() {
        let logs = sink(10).await;
        let a = logs.append(Severity::Info, None, None, "one").await.unwrap();
        let b = logs.append(Severity::Info, None, None, "two").await.unwrap();
        assert!(b.seq > a.seq);
        let all = logs.snapshot(&LogQuery::default());
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].message, "one");
    }

    #[tokio::test]
    async fn snapshot_filters_and_limits() {
        let logs = sink(10).await;
        let t1 = TaskId::new("t1");
        logs.append(Severity::Info, None, Some(t1.clone()), "started").await.unwrap();
        logs.append(Severity::Error, None, Some(t1.clone()), "boom").await.unwrap();
        logs.append(Severity::Info, None, Some(TaskId::new("t2")), "other").await.unwrap();

        let q = LogQuery::for_task("t1");
        assert_eq!(logs.snapshot(&q).len(), 2);

        let q = LogQuery {
            min_severity: Some(Severity::Warning),
            ..LogQuery::default()
        };
        let errors = logs.snapshot(&q);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "boom");

        let q = LogQuery {
            limit: Some(1),
            ..LogQuery::default()
        };
        assert_eq!(logs.snapshot(&q)[0].message, "other");
    }

    #[tokio::test]
    async fn retention_bounds_memory_not_history() {
        let logs = sink(2).await;
        for i in 0..5 {
            logs.append(Severity::Info, None, Some(TaskId::new("t")), format!("e{i}"))
                .await
                .unwrap();
        }
        assert_eq!(logs.snapshot(&LogQuery::default()).len(), 2);
        assert_eq!(logs.history(&TaskId::new("t")).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn subscribers_receive_and_are_pruned() {
        let logs = sink(10).await;
        let rx = logs.subscribe();
        let dropped = logs.subscribe();
        drop(dropped);
        logs.append(Severity::Success, None, None, "done").await.unwrap();
        assert_eq!(rx.recv_async().await.unwrap().message, "done");
        assert_eq!(logs.subscriber_count(), 1);
    }
}
