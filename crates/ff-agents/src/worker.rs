//! The seam between the orchestrator and whatever actually performs a task.
//!
//! The orchestrator treats a worker as opaque: it hands over a
//! [`WorkRequest`] and gets back a [`WorkOutcome`]. Worker output is
//! untrusted and is sanitized before it is recorded.

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use ff_core::config::WorkerConfig;
use ff_core::types::{AgentId, Role, Task, TaskId};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

const MAX_ARTIFACTS: usize = 64;
const MAX_TEXT: usize = 4096;
/// Bytes of worker stdout kept; more than this is a protocol error.
const MAX_STDOUT: u64 = 1024 * 1024;
/// Bytes of worker stderr kept; the rest is discarded.
const MAX_STDERR: u64 = 64 * 1024;

// ---------------------------------------------------------------------------
// Request / outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    pub task_id: TaskId,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub role: Role,
    pub agent_id: AgentId,
    pub attempt: u32,
}

impl WorkRequest {
    pub fn for_task(task: &Task, agent_id: &AgentId) -> Self {
        Self {
            task_id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            acceptance_criteria: task.acceptance_criteria.clone(),
            role: task.required_role,
            agent_id: agent_id.clone(),
            attempt: task.attempts,
        }
    }
}

/// What the worker reports back.
///
/// On the wire: `{"status": "completed", "artifacts": [...], "summary": "..."}`,
/// `{"status": "failed", "reason": "..."}` or `{"status": "blocked", "reason": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkOutcome {
    Completed {
        #[serde(default)]
        artifacts: Vec<String>,
        #[serde(default)]
        summary: String,
    },
    Failed {
        reason: String,
    },
    Blocked {
        reason: String,
    },
}

impl WorkOutcome {
    /// Trim and bound everything the worker reported.
    pub fn sanitized(self) -> Self {
        match self {
            WorkOutcome::Completed { artifacts, summary } => WorkOutcome::Completed {
                artifacts: artifacts
                    .into_iter()
                    .map(|a| clip(a.trim()))
                    .filter(|a| !a.is_empty())
                    .take(MAX_ARTIFACTS)
                    .collect(),
                summary: clip(summary.trim()),
            },
            WorkOutcome::Failed { reason } => WorkOutcome::Failed {
                reason: non_empty(clip(reason.trim()), "worker reported failure"),
            },
            WorkOutcome::Blocked { reason } => WorkOutcome::Blocked {
                reason: non_empty(clip(reason.trim()), "worker reported a blocker"),
            },
        }
    }
}

fn clip(s: &str) -> String {
    match s.char_indices().nth(MAX_TEXT) {
        Some((end, _)) => s[..end].to_string(),
        None => s.to_string(),
    }
}

fn non_empty(s: String, fallback: &str) -> String {
    if s.is_empty() {
        fallback.to_string()
    } else {
        s
    }
}

// ---------------------------------------------------------------------------
// Worker trait
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("no worker command configured")]
    NotConfigured,
    #[error("worker i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker exited with {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },
    #[error("worker protocol: {0}")]
    Protocol(String),
    #[error("{0}")]
    Other(String),
}

/// Performs one task on behalf of an agent.
///
/// Implementations must be cancel-safe: a run that exceeds its timeout is
/// dropped mid-flight.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn execute(&self, request: WorkRequest) -> Result<WorkOutcome, WorkerError>;
}

// ---------------------------------------------------------------------------
// CommandWorker
// ---------------------------------------------------------------------------

/// Runs an external program per task: the request is written to its stdin
/// as JSON and a JSON [`WorkOutcome`] is read from its stdout.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl CommandWorker {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
        }
    }
}

#[async_trait]
impl Worker for CommandWorker {
    async fn execute(&self, request: WorkRequest) -> Result<WorkOutcome, WorkerError> {
        if self.command.trim().is_empty() {
            return Err(WorkerError::NotConfigured);
        }
        let payload =
            serde_json::to_vec(&request).map_err(|e| WorkerError::Protocol(e.to_string()))?;

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(&self.env)
            .env("FF_TASK_ID", request.task_id.as_str())
            .env("FF_AGENT_ID", request.agent_id.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        debug!(task_id = %request.task_id, pid = ?child.id(), "worker spawned");

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
        }

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => return Err(WorkerError::Protocol("worker pipes not captured".into())),
        };
        let ((stdout, stdout_overflow), (stderr, _), status) = tokio::try_join!(
            read_bounded(stdout, MAX_STDOUT),
            read_bounded(stderr, MAX_STDERR),
            child.wait(),
        )?;
        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(WorkerError::Exit {
                code: status.code(),
                stderr: clip(stderr.trim()),
            });
        }
        if stdout_overflow {
            return Err(WorkerError::Protocol(format!(
                "worker output exceeded {MAX_STDOUT} bytes"
            )));
        }
        parse_outcome(&String::from_utf8_lossy(&stdout))
    }
}

/// Keep the first `limit` bytes of `pipe` and drain the rest, so memory stays
/// bounded and the child never stalls on a full pipe. The flag reports
/// whether anything was dropped.
async fn read_bounded<R>(mut pipe: R, limit: u64) -> std::io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    (&mut pipe).take(limit).read_to_end(&mut kept).await?;
    let dropped = tokio::io::copy(&mut pipe, &mut tokio::io::sink()).await?;
    Ok((kept, dropped > 0))
}

/// Accept either a single JSON document or log lines followed by a final
/// JSON line.
fn parse_outcome(stdout: &str) -> Result<WorkOutcome, WorkerError> {
    let trimmed = stdout.trim();
    if let Ok(outcome) = serde_json::from_str::<WorkOutcome>(trimmed) {
        return Ok(outcome);
    }
    let last = trimmed
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| WorkerError::Protocol("worker produced no output".into()))?;
    serde_json::from_str(last.trim()).map_err(|e| WorkerError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_wire_format() {
        let o: WorkOutcome = serde_json::from_str(
            r#"{"status":"completed","artifacts":["src/api.rs"],"summary":"done"}"#,
        )
        .unwrap();
        assert_eq!(
            o,
            WorkOutcome::Completed {
                artifacts: vec!["src/api.rs".into()],
                summary: "done".into()
            }
        );
        let o: WorkOutcome =
            serde_json::from_str(r#"{"status":"blocked","reason":"needs keys"}"#).unwrap();
        assert!(matches!(o, WorkOutcome::Blocked { .. }));
    }

    #[test]
    fn sanitize_drops_blank_artifacts_and_caps() {
        let mut artifacts = vec!["  a.rs  ".to_string(), "   ".to_string()];
        artifacts.extend((0..100).map(|i| format!("f{i}")));
        let o = WorkOutcome::Completed {
            artifacts,
            summary: " ok ".into(),
        }
        .sanitized();
        match o {
            WorkOutcome::Completed { artifacts, summary } => {
                assert_eq!(artifacts[0], "a.rs");
                assert_eq!(artifacts.len(), MAX_ARTIFACTS);
                assert_eq!(summary, "ok");
            }
            other => panic!("unexpected {other:?}"),
        }
        let o = WorkOutcome::Failed { reason: "  ".into() }.sanitized();
        assert_eq!(
            o,
            WorkOutcome::Failed {
                reason: "worker reported failure".into()
            }
        );
    }

    #[test]
    fn parse_takes_last_json_line() {
        let out = "step 1\nstep 2\n{\"status\":\"failed\",\"reason\":\"tests red\"}\n";
        assert_eq!(
            parse_outcome(out).unwrap(),
            WorkOutcome::Failed {
                reason: "tests red".into()
            }
        );
        assert!(matches!(parse_outcome(""), Err(WorkerError::Protocol(_))));
        assert!(matches!(parse_outcome("nope"), Err(WorkerError::Protocol(_))));
    }

    #[tokio::test]
    async fn unconfigured_command_is_an_error() {
        let worker = CommandWorker::new(&WorkerConfig::default());
        let task = Task::new("t1", "Build API", Role::Backend);
        let err = worker
            .execute(WorkRequest::for_task(&task, &AgentId::new("backend-dev-1")))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::NotConfigured));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_worker_round_trip() {
        let config = WorkerConfig {
            command: "sh".into(),
            args: vec![
                "-c".into(),
                r#"cat >/dev/null; echo working; echo '{"status":"completed","artifacts":["out.txt"],"summary":"ok"}'"#.into(),
            ],
            env: Default::default(),
        };
        let worker = CommandWorker::new(&config);
        let task = Task::new("t1", "Build API", Role::Backend);
        let outcome = worker
            .execute(WorkRequest::for_task(&task, &AgentId::new("backend-dev-1")))
            .await
            .unwrap();
        assert!(matches!(outcome, WorkOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn bounded_reads_keep_the_head_and_drain_the_rest() {
        let input: &[u8] = b"0123456789";
        let (kept, dropped) = read_bounded(input, 4).await.unwrap();
        assert_eq!(kept, b"0123");
        assert!(dropped);

        let (kept, dropped) = read_bounded(&b"abc"[..], 4).await.unwrap();
        assert_eq!(kept, b"abc");
        assert!(!dropped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn oversized_output_is_rejected() {
        let config = WorkerConfig {
            command: "sh".into(),
            args: vec![
                "-c".into(),
                "cat >/dev/null; head -c 2000000 /dev/zero".into(),
            ],
            env: Default::default(),
        };
        let worker = CommandWorker::new(&config);
        let task = Task::new("t1", "Build API", Role::Backend);
        let err = worker
            .execute(WorkRequest::for_task(&task, &AgentId::new("backend-dev-1")))
            .await
            .unwrap_err();
        assert!(
            matches!(err, WorkerError::Protocol(ref m) if m.contains("exceeded")),
            "{err:?}"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_reported() {
        let config = WorkerConfig {
            command: "sh".into(),
            args: vec!["-c".into(), "cat >/dev/null; echo bad >&2; exit 3".into()],
            env: Default::default(),
        };
        let worker = CommandWorker::new(&config);
        let task = Task::new("t1", "Build API", Role::Backend);
        let err = worker
            .execute(WorkRequest::for_task(&task, &AgentId::new("backend-dev-1")))
            .await
            .unwrap_err();
        match err {
            WorkerError::Exit { code, stderr } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "bad");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
