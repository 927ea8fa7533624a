use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::types::{Type, ValueRef};
use rusqlite::{params, ErrorCode, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio_rusqlite::Connection;
use tracing::debug;

use crate::types::{Agent, AgentId, LogEvent, Severity, Task, TaskId};

/// Async SQLite-backed state for tasks, agents and the execution log.
///
/// State changes go through `conn`. Ad hoc queries get their own `reader`
/// connection so a slow query never holds up a commit.
pub struct StateDb {
    conn: Connection,
    reader: Connection,
}

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("query rejected: {0}")]
    Rejected(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// A log event that has not been assigned a sequence number yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDraft {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub agent_id: Option<AgentId>,
    pub task_id: Option<TaskId>,
    pub message: String,
}

impl EventDraft {
    pub fn new(
        severity: Severity,
        agent_id: Option<AgentId>,
        task_id: Option<TaskId>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            agent_id,
            task_id,
            message: message.into(),
        }
    }

    fn into_event(self, seq: u64) -> LogEvent {
        LogEvent {
            seq,
            timestamp: self.timestamp,
            severity: self.severity,
            agent_id: self.agent_id,
            task_id: self.task_id,
            message: self.message,
        }
    }
}

/// Everything written by one state transition. Applied in a single
/// transaction: either all rows land or none do.
#[derive(Debug, Clone, Default)]
pub struct Commit {
    pub tasks: Vec<Task>,
    pub agents: Vec<Agent>,
    pub events: Vec<EventDraft>,
}

impl Commit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn agent(mut self, agent: Agent) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn event(mut self, event: EventDraft) -> Self {
        self.events.push(event);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() && self.agents.is_empty() && self.events.is_empty()
    }
}

/// Tabular result of a read-only query; cells are JSON scalars.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    /// More rows were available than the row cap allowed.
    pub truncated: bool,
}

const READ_KEYWORDS: [&str; 4] = ["SELECT", "WITH", "EXPLAIN", "VALUES"];

/// VM steps between deadline checks while an ad hoc query runs.
const PROGRESS_STEPS: i32 = 1_000;

static MEMORY_DBS: AtomicU64 = AtomicU64::new(0);

const TASK_COLUMNS: &str = "id, title, description, acceptance_criteria, dependencies, phase, \
     phase_name, priority, required_role, status, assigned_agent, created_at, updated_at, \
     started_at, finished_at, estimated_hours, actual_hours, attempts, artifacts, last_error";

const AGENT_COLUMNS: &str = "id, name, roles, status, current_task, completed_tasks, last_activity";

const EVENT_COLUMNS: &str = "seq, timestamp, severity, agent_id, task_id, message";

impl StateDb {
    /// Open (or create) a database at the given file path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).await?;
        init_schema(&conn).await?;
        // WAL lets this reader run alongside the writer.
        let reader = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .await?;
        init_reader(&reader, false).await?;
        debug!(path = %path.display(), "state database opened");
        Ok(Self { conn, reader })
    }

    /// Create a purely in-memory database (useful for tests).
    ///
    /// Both connections share one named in-memory database; the reader runs
    /// read-uncommitted so it takes no table locks the writer would wait on.
    pub async fn new_in_memory() -> Result<Self> {
        let uri = format!(
            "file:ff-state-{}-{}?mode=memory&cache=shared",
            std::process::id(),
            MEMORY_DBS.fetch_add(1, Ordering::Relaxed)
        );
        let conn = Connection::open(&uri).await?;
        init_schema(&conn).await?;
        let reader = Connection::open(&uri).await?;
        init_reader(&reader, true).await?;
        debug!(%uri, "in-memory state database opened");
        Ok(Self { conn, reader })
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Apply a commit in one transaction and return its events with their
    /// assigned sequence numbers.
    pub async fn commit(&self, commit: Commit) -> Result<Vec<LogEvent>> {
        if commit.is_empty() {
            return Ok(Vec::new());
        }
        let logged = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for task in &commit.tasks {
                    write_task(&tx, task)?;
                }
                for agent in &commit.agents {
                    write_agent(&tx, agent)?;
                }
                let mut logged = Vec::with_capacity(commit.events.len());
                for draft in commit.events {
                    tx.execute(
                        "INSERT INTO events (timestamp, severity, agent_id, task_id, message)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            draft.timestamp.to_rfc3339(),
                            draft.severity.as_str(),
                            draft.agent_id.as_ref().map(|a| a.as_str().to_string()),
                            draft.task_id.as_ref().map(|t| t.as_str().to_string()),
                            draft.message,
                        ],
                    )?;
                    let seq = tx.last_insert_rowid() as u64;
                    logged.push(draft.into_event(seq));
                }
                tx.commit()?;
                Ok(logged)
            })
            .await?;
        debug!(events = logged.len(), "commit applied");
        Ok(logged)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn load_tasks(&self) -> Result<Vec<Task>> {
        let tasks = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks ORDER BY phase, priority, created_at, id"
                ))?;
                let rows = stmt.query_map([], row_to_task)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?;
        Ok(tasks)
    }

    pub async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        let id = id.as_str().to_string();
        let task = self
            .conn
            .call(move |conn| {
                let task = conn
                    .query_row(
                        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                        params![id],
                        row_to_task,
                    )
                    .optional()?;
                Ok(task)
            })
            .await?;
        Ok(task)
    }

    pub async fn load_agents(&self) -> Result<Vec<Agent>> {
        let agents = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY id"))?;
                let rows = stmt.query_map([], row_to_agent)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?;
        Ok(agents)
    }

    /// The newest `limit` events, oldest first.
    pub async fn load_recent_events(&self, limit: usize) -> Result<Vec<LogEvent>> {
        let limit = limit as i64;
        let mut events = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EVENT_COLUMNS} FROM events ORDER BY seq DESC LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit], row_to_event)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?;
        events.reverse();
        Ok(events)
    }

    /// Every event recorded for one task, oldest first.
    pub async fn events_for_task(&self, task_id: &TaskId) -> Result<Vec<LogEvent>> {
        let id = task_id.as_str().to_string();
        let events = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EVENT_COLUMNS} FROM events WHERE task_id = ?1 ORDER BY seq"
                ))?;
                let rows = stmt.query_map(params![id], row_to_event)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?;
        Ok(events)
    }

    // -----------------------------------------------------------------------
    // Read-only query surface
    // -----------------------------------------------------------------------

    /// Run a single read-only statement and return at most `max_rows` rows.
    ///
    /// The statement is screened lexically, must be reported read-only by
    /// SQLite, and runs on the query-only reader connection. It is
    /// interrupted once it has run for `timeout`.
    pub async fn query_readonly(
        &self,
        sql: &str,
        max_rows: usize,
        timeout: Duration,
    ) -> Result<QueryResult> {
        let sql = screen_query(sql)?;
        let outcome = self
            .reader
            .call(move |conn| {
                let deadline = Instant::now() + timeout;
                conn.progress_handler(PROGRESS_STEPS, Some(move || Instant::now() >= deadline));
                let outcome = run_readonly(conn, &sql, max_rows);
                conn.progress_handler(0, None::<fn() -> bool>);
                Ok(outcome)
            })
            .await?;
        let result = outcome.map_err(|e| DbError::Rejected(rejection(e, timeout)))?;
        debug!(rows = result.rows.len(), truncated = result.truncated, "read-only query");
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

async fn init_schema(conn: &Connection) -> Result<()> {
    conn
        .call(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode=WAL;
                PRAGMA synchronous=NORMAL;
                PRAGMA temp_store=MEMORY;
                PRAGMA busy_timeout=5000;

                CREATE TABLE IF NOT EXISTS tasks (
                    id                  TEXT PRIMARY KEY,
                    title               TEXT NOT NULL,
                    description         TEXT NOT NULL,
                    acceptance_criteria TEXT NOT NULL,
                    dependencies        TEXT NOT NULL,
                    phase               INTEGER NOT NULL,
                    phase_name          TEXT NOT NULL,
                    priority            INTEGER NOT NULL,
                    required_role       TEXT NOT NULL,
                    status              TEXT NOT NULL,
                    assigned_agent      TEXT,
                    created_at          TEXT NOT NULL,
                    updated_at          TEXT NOT NULL,
                    started_at          TEXT,
                    finished_at         TEXT,
                    estimated_hours     REAL NOT NULL DEFAULT 0,
                    actual_hours        REAL,
                    attempts            INTEGER NOT NULL DEFAULT 0,
                    artifacts           TEXT NOT NULL,
                    last_error          TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
                CREATE INDEX IF NOT EXISTS idx_tasks_phase  ON tasks(phase);

                CREATE TABLE IF NOT EXISTS agents (
                    id              TEXT PRIMARY KEY,
                    name            TEXT NOT NULL,
                    roles           TEXT NOT NULL,
                    status          TEXT NOT NULL,
                    current_task    TEXT,
                    completed_tasks INTEGER NOT NULL DEFAULT 0,
                    last_activity   TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS events (
                    seq       INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp TEXT NOT NULL,
                    severity  TEXT NOT NULL,
                    agent_id  TEXT,
                    task_id   TEXT,
                    message   TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_events_task  ON events(task_id);
                CREATE INDEX IF NOT EXISTS idx_events_agent ON events(agent_id);
                ",
            )?;
            Ok(())
        })
        .await?;
    Ok(())
}

async fn init_reader(reader: &Connection, shared_cache: bool) -> Result<()> {
    reader
        .call(move |conn| {
            conn.pragma_update(None, "query_only", true)?;
            if shared_cache {
                conn.pragma_update(None, "read_uncommitted", true)?;
            }
            conn.busy_timeout(Duration::from_secs(5))?;
            Ok(())
        })
        .await?;
    Ok(())
}

/// Lexical screen: the leading keyword must read data. Statement count is
/// checked when the statement is prepared.
fn screen_query(sql: &str) -> Result<String> {
    let trimmed = sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    if trimmed.is_empty() {
        return Err(DbError::Rejected("empty query".into()));
    }
    let keyword: String = trimmed
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();
    if !READ_KEYWORDS.contains(&keyword.as_str()) {
        return Err(DbError::Rejected(format!(
            "statement must start with one of {}",
            READ_KEYWORDS.join(", ")
        )));
    }
    Ok(trimmed.to_string())
}

fn rejection(err: rusqlite::Error, timeout: Duration) -> String {
    match err {
        rusqlite::Error::MultipleStatement => "only a single statement is allowed".into(),
        rusqlite::Error::InvalidQuery => "statement would modify the database".into(),
        e if e.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) => {
            format!("query exceeded {} ms", timeout.as_millis())
        }
        e => e.to_string(),
    }
}

fn run_readonly(
    conn: &rusqlite::Connection,
    sql: &str,
    max_rows: usize,
) -> rusqlite::Result<QueryResult> {
    let mut stmt = conn.prepare(sql)?;
    if !stmt.readonly() {
        return Err(rusqlite::Error::InvalidQuery);
    }
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let width = columns.len();
    let mut result = QueryResult {
        columns,
        ..QueryResult::default()
    };
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        if result.rows.len() == max_rows {
            result.truncated = true;
            break;
        }
        let mut cells = Vec::with_capacity(width);
        for i in 0..width {
            cells.push(value_to_json(row.get_ref(i)?));
        }
        result.rows.push(cells);
    }
    Ok(result)
}

fn value_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::Value::String(format!("<blob {} bytes>", b.len())),
    }
}

// ---------------------------------------------------------------------------
// Row writers
// ---------------------------------------------------------------------------

fn to_json<T: Serialize>(value: &T) -> rusqlite::Result<String> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn write_task(conn: &rusqlite::Connection, task: &Task) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO tasks ({TASK_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                     ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
        ),
        params![
            task.id.as_str(),
            task.title,
            task.description,
            to_json(&task.acceptance_criteria)?,
            to_json(&task.dependencies)?,
            task.phase,
            task.phase_name,
            task.priority,
            task.required_role.as_str(),
            task.status.as_str(),
            task.assigned_agent.as_ref().map(|a| a.as_str()),
            task.created_at.to_rfc3339(),
            task.updated_at.to_rfc3339(),
            task.started_at.map(|t| t.to_rfc3339()),
            task.finished_at.map(|t| t.to_rfc3339()),
            task.estimated_hours,
            task.actual_hours,
            task.attempts,
            to_json(&task.artifacts)?,
            task.last_error,
        ],
    )?;
    Ok(())
}

fn write_agent(conn: &rusqlite::Connection, agent: &Agent) -> rusqlite::Result<()> {
    conn.execute(
        &format!("INSERT OR REPLACE INTO agents ({AGENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
        params![
            agent.id.as_str(),
            agent.name,
            to_json(&agent.roles)?,
            agent.status.as_str(),
            agent.current_task.as_ref().map(|t| t.as_str()),
            agent.completed_tasks,
            agent.last_activity.to_rfc3339(),
        ],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn decode_err<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| decode_err(idx, e))
}

fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

fn parse_json<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| decode_err(idx, e))
}

fn parse_enum<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.parse().map_err(|e| decode_err(idx, e))
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let criteria: String = row.get(3)?;
    let deps: String = row.get(4)?;
    let role: String = row.get(8)?;
    let status: String = row.get(9)?;
    let created_at: String = row.get(11)?;
    let updated_at: String = row.get(12)?;
    let artifacts: String = row.get(18)?;

    Ok(Task {
        id: TaskId::new(row.get::<_, String>(0)?),
        title: row.get(1)?,
        description: row.get(2)?,
        acceptance_criteria: parse_json(3, &criteria)?,
        dependencies: parse_json(4, &deps)?,
        phase: row.get(5)?,
        phase_name: row.get(6)?,
        priority: row.get(7)?,
        required_role: parse_enum(8, &role)?,
        status: parse_enum(9, &status)?,
        assigned_agent: row.get::<_, Option<String>>(10)?.map(AgentId::new),
        created_at: parse_ts(11, &created_at)?,
        updated_at: parse_ts(12, &updated_at)?,
        started_at: parse_opt_ts(13, row.get(13)?)?,
        finished_at: parse_opt_ts(14, row.get(14)?)?,
        estimated_hours: row.get(15)?,
        actual_hours: row.get(16)?,
        attempts: row.get(17)?,
        artifacts: parse_json(18, &artifacts)?,
        last_error: row.get(19)?,
    })
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    let roles: String = row.get(2)?;
    let status: String = row.get(3)?;
    let last_activity: String = row.get(6)?;

    Ok(Agent {
        id: AgentId::new(row.get::<_, String>(0)?),
        name: row.get(1)?,
        roles: parse_json(2, &roles)?,
        status: parse_enum(3, &status)?,
        current_task: row.get::<_, Option<String>>(4)?.map(TaskId::new),
        completed_tasks: row.get(5)?,
        last_activity: parse_ts(6, &last_activity)?,
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogEvent> {
    let timestamp: String = row.get(1)?;
    let severity: String = row.get(2)?;

    Ok(LogEvent {
        seq: row.get::<_, i64>(0)? as u64,
        timestamp: parse_ts(1, &timestamp)?,
        severity: parse_enum(2, &severity)?,
        agent_id: row.get::<_, Option<String>>(3)?.map(AgentId::new),
        task_id: row.get::<_, Option<String>>(4)?.map(TaskId::new),
        message: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn screen_accepts_reads() {
        assert_eq!(screen_query("  select 1 ; ").unwrap(), "select 1");
        assert!(screen_query("WITH t AS (SELECT 1) SELECT * FROM t").is_ok());
        assert!(screen_query("explain query plan select * from tasks").is_ok());
    }

    #[test]
    fn screen_rejects_writes() {
        assert!(screen_query("").is_err());
        assert!(screen_query("   ;  ").is_err());
        assert!(screen_query("DELETE FROM tasks").is_err());
        assert!(screen_query("PRAGMA query_only = OFF").is_err());
    }

    #[test]
    fn screen_leaves_semicolons_in_literals_alone() {
        let sql = "SELECT * FROM events WHERE message LIKE '%a;b%'";
        assert_eq!(screen_query(sql).unwrap(), sql);
    }

    #[test]
    fn interrupted_queries_name_the_limit() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_INTERRUPT),
            None,
        );
        assert_eq!(
            rejection(err, Duration::from_millis(250)),
            "query exceeded 250 ms"
        );
        assert_eq!(
            rejection(rusqlite::Error::MultipleStatement, Duration::ZERO),
            "only a single statement is allowed"
        );
    }
}
