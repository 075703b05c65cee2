//! SQLite implementation of `RunRepository`.
//!
//! Persistent storage that survives service restarts.
//!
//! # Schema Versioning
//!
//! The database has a `schema_version` table tracking the schema version.
//! When the schema changes, increment `CURRENT_SCHEMA_VERSION` and add a
//! migration in `run_migrations()`. Migrations run sequentially from the
//! current version to the target version.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use super::{
    NewAttempt, RepositoryError, RepositoryMetrics, RunFilter, RunPage, RunRepository,
    SummaryCounts,
};
use crate::model::{
    Actor, Attempt, AttemptStatus, CommitSha, NewEvent, PrState, ResolvedBy, Run, RunEvent,
    RunId, RunStatus,
};

/// Current schema version. Increment when making schema changes and add
/// corresponding migration logic in `run_migrations()`.
const CURRENT_SCHEMA_VERSION: i64 = 1;

/// SQLite-backed run repository.
///
/// Uses `tokio::task::spawn_blocking` to run synchronous rusqlite operations
/// without blocking the async runtime.
pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Create a new SQLite repository at the given path.
    ///
    /// Creates the database file and schema if they don't exist and runs any
    /// pending migrations. The database is configured with WAL journaling and
    /// a busy timeout for concurrent access.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();

        if path_str != ":memory:" && !path_str.is_empty() {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        RepositoryError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| RepositoryError::storage("open database", e.to_string()))?;

        // WAL can silently stay off on filesystems without shared-memory
        // support; verify it actually took. In-memory databases report
        // "memory", which is fine for their ephemeral use.
        let is_in_memory = path_str == ":memory:";
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| RepositoryError::storage("set journal_mode", e.to_string()))?;

        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));

        if !journal_mode_ok {
            return Err(RepositoryError::storage(
                "configure journal_mode",
                format!(
                    "Failed to enable WAL mode: SQLite returned '{}' instead of 'wal'",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            "#,
        )
        .map_err(|e| RepositoryError::storage("configure pragmas", e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| RepositoryError::storage("create schema_version table", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| RepositoryError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a new in-memory SQLite repository (for testing).
    pub fn new_in_memory() -> Result<Self, RepositoryError> {
        Self::new(":memory:")
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), RepositoryError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(RepositoryError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS runs (
                    id TEXT PRIMARY KEY,
                    provider TEXT NOT NULL,
                    repository TEXT NOT NULL,
                    branch TEXT NOT NULL,
                    commit_sha TEXT NOT NULL,
                    pipeline_url TEXT,
                    error_hash TEXT NOT NULL,
                    error_type TEXT NOT NULL,
                    error_summary TEXT NOT NULL,
                    status TEXT NOT NULL,
                    attempt_count INTEGER NOT NULL DEFAULT 0,
                    max_attempts INTEGER NOT NULL,
                    pr_url TEXT,
                    pr_number INTEGER,
                    pr_state TEXT NOT NULL,
                    pr_branch TEXT,
                    ai_provider TEXT,
                    ai_model TEXT,
                    resolved_by TEXT NOT NULL,
                    human_note TEXT,
                    escalation_reason TEXT,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_fingerprint
                    ON runs(repository, commit_sha, error_hash);
                CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
                CREATE INDEX IF NOT EXISTS idx_runs_repository ON runs(repository);

                CREATE TABLE IF NOT EXISTS attempts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL,
                    attempt_no INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    diagnosis TEXT,
                    proposed_fix TEXT,
                    validation_log TEXT,
                    failure_reason TEXT,
                    engine TEXT,
                    created_at INTEGER NOT NULL,
                    UNIQUE(run_id, attempt_no)
                );

                CREATE INDEX IF NOT EXISTS idx_attempts_run ON attempts(run_id, attempt_no);

                CREATE TABLE IF NOT EXISTS events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    actor TEXT NOT NULL,
                    message TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_events_run ON events(run_id, id);
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v1", e.to_string()))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| RepositoryError::storage("update schema version", e.to_string()))?;

        Ok(())
    }
}

// =============================================================================
// Row mapping helpers
// =============================================================================

fn ts_to_datetime(ts: i64, what: &'static str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::from_timestamp(ts, 0).ok_or(RepositoryError::Corruption(what))
}

const RUN_COLUMNS: &str = "id, provider, repository, branch, commit_sha, pipeline_url, \
     error_hash, error_type, error_summary, status, attempt_count, max_attempts, \
     pr_url, pr_number, pr_state, pr_branch, ai_provider, ai_model, resolved_by, \
     human_note, escalation_reason, created_at, updated_at";

/// Primitive row image of a run, converted to the domain type separately so
/// enum parse failures surface as corruption errors rather than panics.
struct RunRow {
    id: String,
    provider: String,
    repository: String,
    branch: String,
    commit_sha: String,
    pipeline_url: Option<String>,
    error_hash: String,
    error_type: String,
    error_summary: String,
    status: String,
    attempt_count: i64,
    max_attempts: i64,
    pr_url: Option<String>,
    pr_number: Option<i64>,
    pr_state: String,
    pr_branch: Option<String>,
    ai_provider: Option<String>,
    ai_model: Option<String>,
    resolved_by: String,
    human_note: Option<String>,
    escalation_reason: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            provider: row.get(1)?,
            repository: row.get(2)?,
            branch: row.get(3)?,
            commit_sha: row.get(4)?,
            pipeline_url: row.get(5)?,
            error_hash: row.get(6)?,
            error_type: row.get(7)?,
            error_summary: row.get(8)?,
            status: row.get(9)?,
            attempt_count: row.get(10)?,
            max_attempts: row.get(11)?,
            pr_url: row.get(12)?,
            pr_number: row.get(13)?,
            pr_state: row.get(14)?,
            pr_branch: row.get(15)?,
            ai_provider: row.get(16)?,
            ai_model: row.get(17)?,
            resolved_by: row.get(18)?,
            human_note: row.get(19)?,
            escalation_reason: row.get(20)?,
            created_at: row.get(21)?,
            updated_at: row.get(22)?,
        })
    }

    fn into_run(self) -> Result<Run, RepositoryError> {
        let status =
            RunStatus::parse(&self.status).ok_or(RepositoryError::Corruption("run status"))?;
        let pr_state =
            PrState::parse(&self.pr_state).ok_or(RepositoryError::Corruption("pr state"))?;
        let resolved_by = ResolvedBy::parse(&self.resolved_by)
            .ok_or(RepositoryError::Corruption("resolved_by"))?;
        let attempt_count = u32::try_from(self.attempt_count)
            .map_err(|_| RepositoryError::Corruption("attempt count"))?;
        let max_attempts = u32::try_from(self.max_attempts)
            .map_err(|_| RepositoryError::Corruption("max attempts"))?;
        let pr_number = self
            .pr_number
            .map(|n| u64::try_from(n).map_err(|_| RepositoryError::Corruption("pr number")))
            .transpose()?;

        Ok(Run {
            id: RunId(self.id),
            provider: self.provider,
            repository: self.repository,
            branch: self.branch,
            commit_sha: CommitSha(self.commit_sha),
            pipeline_url: self.pipeline_url,
            error_hash: self.error_hash,
            error_type: self.error_type,
            error_summary: self.error_summary,
            status,
            attempt_count,
            max_attempts,
            pr_url: self.pr_url,
            pr_number,
            pr_state,
            pr_branch: self.pr_branch,
            ai_provider: self.ai_provider,
            ai_model: self.ai_model,
            resolved_by,
            human_note: self.human_note,
            escalation_reason: self.escalation_reason,
            created_at: ts_to_datetime(self.created_at, "run created_at")?,
            updated_at: ts_to_datetime(self.updated_at, "run updated_at")?,
        })
    }
}

struct AttemptRow {
    id: i64,
    run_id: String,
    attempt_no: i64,
    status: String,
    diagnosis: Option<String>,
    proposed_fix: Option<String>,
    validation_log: Option<String>,
    failure_reason: Option<String>,
    engine: Option<String>,
    created_at: i64,
}

impl AttemptRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            attempt_no: row.get(2)?,
            status: row.get(3)?,
            diagnosis: row.get(4)?,
            proposed_fix: row.get(5)?,
            validation_log: row.get(6)?,
            failure_reason: row.get(7)?,
            engine: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_attempt(self) -> Result<Attempt, RepositoryError> {
        Ok(Attempt {
            id: self.id,
            run_id: RunId(self.run_id),
            attempt_no: u32::try_from(self.attempt_no)
                .map_err(|_| RepositoryError::Corruption("attempt number"))?,
            status: AttemptStatus::parse(&self.status)
                .ok_or(RepositoryError::Corruption("attempt status"))?,
            diagnosis: self.diagnosis,
            proposed_fix: self.proposed_fix,
            validation_log: self.validation_log,
            failure_reason: self.failure_reason,
            engine: self.engine,
            created_at: ts_to_datetime(self.created_at, "attempt created_at")?,
        })
    }
}

fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, String, String, String, String, i64)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn finish_event(
    (id, run_id, event_type, actor, message, payload, created_at): (
        i64,
        String,
        String,
        String,
        String,
        String,
        i64,
    ),
) -> Result<RunEvent, RepositoryError> {
    let actor = Actor::parse(&actor).ok_or(RepositoryError::Corruption("event actor"))?;
    let payload: serde_json::Value =
        serde_json::from_str(&payload).map_err(|_| RepositoryError::Corruption("event payload"))?;
    Ok(RunEvent {
        id,
        run_id: RunId(run_id),
        event_type,
        actor,
        message,
        payload,
        created_at: ts_to_datetime(created_at, "event created_at")?,
    })
}

// =============================================================================
// RunRepository trait implementation
// =============================================================================

#[async_trait]
impl RunRepository for SqliteRepository {
    async fn insert_run(&self, run: &Run) -> Result<(), RepositoryError> {
        let conn = self.conn.clone();
        let run = run.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "INSERT INTO runs (id, provider, repository, branch, commit_sha, pipeline_url,
                                   error_hash, error_type, error_summary, status, attempt_count,
                                   max_attempts, pr_url, pr_number, pr_state, pr_branch,
                                   ai_provider, ai_model, resolved_by, human_note,
                                   escalation_reason, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                         ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
                params![
                    run.id.0,
                    run.provider,
                    run.repository,
                    run.branch,
                    run.commit_sha.0,
                    run.pipeline_url,
                    run.error_hash,
                    run.error_type,
                    run.error_summary,
                    run.status.as_str(),
                    run.attempt_count,
                    run.max_attempts,
                    run.pr_url,
                    run.pr_number.map(|n| n as i64),
                    run.pr_state.as_str(),
                    run.pr_branch,
                    run.ai_provider,
                    run.ai_model,
                    run.resolved_by.as_str(),
                    run.human_note,
                    run.escalation_reason,
                    run.created_at.timestamp(),
                    run.updated_at.timestamp(),
                ],
            )
            .map_err(|e| RepositoryError::storage("insert_run", e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| RepositoryError::storage("insert_run", e.to_string()))?
    }

    async fn get_run(&self, id: &RunId) -> Result<Option<Run>, RepositoryError> {
        let conn = self.conn.clone();
        let id = id.0.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let row = conn
                .query_row(
                    &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                    params![id],
                    RunRow::from_row,
                )
                .optional()
                .map_err(|e| RepositoryError::storage("get_run", e.to_string()))?;

            row.map(RunRow::into_run).transpose()
        })
        .await
        .map_err(|e| RepositoryError::storage("get_run", e.to_string()))?
    }

    async fn find_by_fingerprint(
        &self,
        repository: &str,
        commit_sha: &CommitSha,
        error_hash: &str,
    ) -> Result<Option<Run>, RepositoryError> {
        let conn = self.conn.clone();
        let repository = repository.to_string();
        let commit_sha = commit_sha.0.clone();
        let error_hash = error_hash.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {RUN_COLUMNS} FROM runs
                         WHERE repository = ?1 AND commit_sha = ?2 AND error_hash = ?3"
                    ),
                    params![repository, commit_sha, error_hash],
                    RunRow::from_row,
                )
                .optional()
                .map_err(|e| RepositoryError::storage("find_by_fingerprint", e.to_string()))?;

            row.map(RunRow::into_run).transpose()
        })
        .await
        .map_err(|e| RepositoryError::storage("find_by_fingerprint", e.to_string()))?
    }

    async fn update_run(&self, run: &Run) -> Result<(), RepositoryError> {
        let conn = self.conn.clone();
        let run = run.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let updated = conn
                .execute(
                    "UPDATE runs SET status = ?2, attempt_count = ?3, pr_url = ?4,
                                     pr_number = ?5, pr_state = ?6, pr_branch = ?7,
                                     ai_provider = ?8, ai_model = ?9, resolved_by = ?10,
                                     human_note = ?11, escalation_reason = ?12, updated_at = ?13
                     WHERE id = ?1",
                    params![
                        run.id.0,
                        run.status.as_str(),
                        run.attempt_count,
                        run.pr_url,
                        run.pr_number.map(|n| n as i64),
                        run.pr_state.as_str(),
                        run.pr_branch,
                        run.ai_provider,
                        run.ai_model,
                        run.resolved_by.as_str(),
                        run.human_note,
                        run.escalation_reason,
                        run.updated_at.timestamp(),
                    ],
                )
                .map_err(|e| RepositoryError::storage("update_run", e.to_string()))?;

            if updated == 0 {
                return Err(RepositoryError::storage(
                    "update_run",
                    format!("run {} not found", run.id),
                ));
            }
            Ok(())
        })
        .await
        .map_err(|e| RepositoryError::storage("update_run", e.to_string()))?
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<RunPage, RepositoryError> {
        let conn = self.conn.clone();
        let status = filter.status.map(|s| s.as_str().to_string());
        let repository = filter.repository.clone();
        let limit = filter.limit;
        let offset = filter.offset;

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();

            let mut where_clause = String::from("WHERE 1=1");
            let mut bind: Vec<String> = Vec::new();
            if let Some(status) = status {
                bind.push(status);
                where_clause.push_str(&format!(" AND status = ?{}", bind.len()));
            }
            if let Some(repository) = repository {
                bind.push(repository);
                where_clause.push_str(&format!(" AND repository = ?{}", bind.len()));
            }

            let total: i64 = conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM runs {where_clause}"),
                    rusqlite::params_from_iter(bind.iter()),
                    |row| row.get(0),
                )
                .map_err(|e| RepositoryError::storage("list_runs count", e.to_string()))?;

            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {RUN_COLUMNS} FROM runs {where_clause}
                     ORDER BY created_at DESC, rowid DESC LIMIT {limit} OFFSET {offset}"
                ))
                .map_err(|e| RepositoryError::storage("list_runs", e.to_string()))?;

            let rows = stmt
                .query_map(rusqlite::params_from_iter(bind.iter()), RunRow::from_row)
                .map_err(|e| RepositoryError::storage("list_runs", e.to_string()))?;

            let mut runs = Vec::new();
            for row in rows {
                // Skip corrupt rows so one bad record doesn't hide the rest.
                let raw = match row {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!("Skipping unreadable run row: {}", e);
                        continue;
                    }
                };
                match raw.into_run() {
                    Ok(run) => runs.push(run),
                    Err(e) => warn!("Skipping corrupt run row: {}", e),
                }
            }

            Ok(RunPage {
                runs,
                total: usize::try_from(total).unwrap_or(0),
            })
        })
        .await
        .map_err(|e| RepositoryError::storage("list_runs", e.to_string()))?
    }

    async fn insert_attempt(&self, attempt: NewAttempt) -> Result<Attempt, RepositoryError> {
        let conn = self.conn.clone();
        let created_at = Utc::now();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "INSERT INTO attempts (run_id, attempt_no, status, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    attempt.run_id.0,
                    attempt.attempt_no,
                    attempt.status.as_str(),
                    created_at.timestamp(),
                ],
            )
            .map_err(|e| RepositoryError::storage("insert_attempt", e.to_string()))?;

            let id = conn.last_insert_rowid();
            Ok(Attempt {
                id,
                run_id: attempt.run_id,
                attempt_no: attempt.attempt_no,
                status: attempt.status,
                diagnosis: None,
                proposed_fix: None,
                validation_log: None,
                failure_reason: None,
                engine: None,
                created_at,
            })
        })
        .await
        .map_err(|e| RepositoryError::storage("insert_attempt", e.to_string()))?
    }

    async fn update_attempt(&self, attempt: &Attempt) -> Result<(), RepositoryError> {
        let conn = self.conn.clone();
        let attempt = attempt.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let updated = conn
                .execute(
                    "UPDATE attempts SET status = ?2, diagnosis = ?3, proposed_fix = ?4,
                                         validation_log = ?5, failure_reason = ?6, engine = ?7
                     WHERE id = ?1",
                    params![
                        attempt.id,
                        attempt.status.as_str(),
                        attempt.diagnosis,
                        attempt.proposed_fix,
                        attempt.validation_log,
                        attempt.failure_reason,
                        attempt.engine,
                    ],
                )
                .map_err(|e| RepositoryError::storage("update_attempt", e.to_string()))?;

            if updated == 0 {
                return Err(RepositoryError::storage(
                    "update_attempt",
                    format!("attempt {} not found", attempt.id),
                ));
            }
            Ok(())
        })
        .await
        .map_err(|e| RepositoryError::storage("update_attempt", e.to_string()))?
    }

    async fn attempts_for_run(&self, run_id: &RunId) -> Result<Vec<Attempt>, RepositoryError> {
        let conn = self.conn.clone();
        let run_id = run_id.0.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn
                .prepare(
                    "SELECT id, run_id, attempt_no, status, diagnosis, proposed_fix,
                            validation_log, failure_reason, engine, created_at
                     FROM attempts WHERE run_id = ?1 ORDER BY attempt_no",
                )
                .map_err(|e| RepositoryError::storage("attempts_for_run", e.to_string()))?;

            let rows = stmt
                .query_map(params![run_id], AttemptRow::from_row)
                .map_err(|e| RepositoryError::storage("attempts_for_run", e.to_string()))?;

            let mut attempts = Vec::new();
            for row in rows {
                let raw =
                    row.map_err(|e| RepositoryError::storage("attempts_for_run", e.to_string()))?;
                attempts.push(raw.into_attempt()?);
            }
            Ok(attempts)
        })
        .await
        .map_err(|e| RepositoryError::storage("attempts_for_run", e.to_string()))?
    }

    async fn append_event(&self, event: NewEvent) -> Result<RunEvent, RepositoryError> {
        let conn = self.conn.clone();
        let created_at = Utc::now();
        let payload_json = serde_json::to_string(&event.payload)
            .map_err(|e| RepositoryError::storage("append_event serialize", e.to_string()))?;

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "INSERT INTO events (run_id, event_type, actor, message, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.run_id.0,
                    event.event_type,
                    event.actor.as_str(),
                    event.message,
                    payload_json,
                    created_at.timestamp(),
                ],
            )
            .map_err(|e| RepositoryError::storage("append_event", e.to_string()))?;

            Ok(RunEvent {
                id: conn.last_insert_rowid(),
                run_id: event.run_id,
                event_type: event.event_type,
                actor: event.actor,
                message: event.message,
                payload: event.payload,
                created_at,
            })
        })
        .await
        .map_err(|e| RepositoryError::storage("append_event", e.to_string()))?
    }

    async fn events_for_run(
        &self,
        run_id: &RunId,
        limit: usize,
    ) -> Result<Vec<RunEvent>, RepositoryError> {
        let conn = self.conn.clone();
        let run_id = run_id.0.clone();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn
                .prepare(
                    "SELECT id, run_id, event_type, actor, message, payload, created_at
                     FROM events WHERE run_id = ?1 ORDER BY id LIMIT ?2",
                )
                .map_err(|e| RepositoryError::storage("events_for_run", e.to_string()))?;

            let rows = stmt
                .query_map(params![run_id, limit], event_from_row)
                .map_err(|e| RepositoryError::storage("events_for_run", e.to_string()))?;

            let mut events = Vec::new();
            for row in rows {
                let raw =
                    row.map_err(|e| RepositoryError::storage("events_for_run", e.to_string()))?;
                events.push(finish_event(raw)?);
            }
            Ok(events)
        })
        .await
        .map_err(|e| RepositoryError::storage("events_for_run", e.to_string()))?
    }

    async fn summary_counts(&self) -> Result<SummaryCounts, RepositoryError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM runs GROUP BY status")
                .map_err(|e| RepositoryError::storage("summary_counts", e.to_string()))?;

            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(|e| RepositoryError::storage("summary_counts", e.to_string()))?;

            let mut counts = SummaryCounts::default();
            for row in rows {
                let (status, n) =
                    row.map_err(|e| RepositoryError::storage("summary_counts", e.to_string()))?;
                let status =
                    RunStatus::parse(&status).ok_or(RepositoryError::Corruption("run status"))?;
                counts.add(status, usize::try_from(n).unwrap_or(0));
            }
            Ok(counts)
        })
        .await
        .map_err(|e| RepositoryError::storage("summary_counts", e.to_string()))?
    }

    async fn repository_metrics(&self) -> Result<Vec<RepositoryMetrics>, RepositoryError> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn
                .prepare(
                    "SELECT repository, status, COUNT(*), COALESCE(SUM(attempt_count), 0)
                     FROM runs GROUP BY repository, status ORDER BY repository",
                )
                .map_err(|e| RepositoryError::storage("repository_metrics", e.to_string()))?;

            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })
                .map_err(|e| RepositoryError::storage("repository_metrics", e.to_string()))?;

            let mut metrics: Vec<RepositoryMetrics> = Vec::new();
            for row in rows {
                let (repository, status, n, attempts) = row
                    .map_err(|e| RepositoryError::storage("repository_metrics", e.to_string()))?;
                let status =
                    RunStatus::parse(&status).ok_or(RepositoryError::Corruption("run status"))?;
                let n = usize::try_from(n).unwrap_or(0);
                let attempts = usize::try_from(attempts).unwrap_or(0);

                if metrics.last().map(|m| m.repository.as_str()) != Some(repository.as_str()) {
                    metrics.push(RepositoryMetrics {
                        repository: repository.clone(),
                        total_runs: 0,
                        fixed: 0,
                        escalated: 0,
                        resolved: 0,
                        aborted: 0,
                        active: 0,
                        total_attempts: 0,
                    });
                }
                let entry = metrics.last_mut().unwrap();
                entry.total_runs += n;
                entry.total_attempts += attempts;
                match status {
                    RunStatus::Fixed => entry.fixed += n,
                    RunStatus::Escalated => entry.escalated += n,
                    RunStatus::Resolved => entry.resolved += n,
                    RunStatus::Aborted => entry.aborted += n,
                    RunStatus::Queued | RunStatus::Running => entry.active += n,
                }
            }
            Ok(metrics)
        })
        .await
        .map_err(|e| RepositoryError::storage("repository_metrics", e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PrState, ResolvedBy};

    fn sample_run(repository: &str, sha: &str, hash: &str) -> Run {
        let now = Utc::now();
        Run {
            id: RunId::generate(),
            provider: "github-actions".to_string(),
            repository: repository.to_string(),
            branch: "main".to_string(),
            commit_sha: CommitSha::from(sha),
            pipeline_url: Some("https://ci.example/run/1".to_string()),
            error_hash: hash.to_string(),
            error_type: "type_error".to_string(),
            error_summary: "TS2339: property does not exist".to_string(),
            status: RunStatus::Queued,
            attempt_count: 0,
            max_attempts: 3,
            pr_url: None,
            pr_number: None,
            pr_state: PrState::None,
            pr_branch: None,
            ai_provider: None,
            ai_model: None,
            resolved_by: ResolvedBy::None,
            human_note: None,
            escalation_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_run_round_trip() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        let run = sample_run("acme/api", "abc123", "hash1");
        repo.insert_run(&run).await.unwrap();

        let found = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(found.repository, run.repository);
        assert_eq!(found.commit_sha, run.commit_sha);
        assert_eq!(found.status, RunStatus::Queued);
        assert_eq!(found.pr_state, PrState::None);
        assert_eq!(found.pipeline_url, run.pipeline_url);
    }

    #[tokio::test]
    async fn test_fingerprint_is_unique() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        let run = sample_run("acme/api", "abc123", "hash1");
        repo.insert_run(&run).await.unwrap();

        // Same (repository, commit, errorHash) triple must be rejected by
        // the unique index; dedup happens before insert in the ingestor.
        let duplicate = sample_run("acme/api", "abc123", "hash1");
        assert!(repo.insert_run(&duplicate).await.is_err());
    }

    #[tokio::test]
    async fn test_update_run_fields() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        let mut run = sample_run("acme/api", "abc123", "hash1");
        repo.insert_run(&run).await.unwrap();

        run.status = RunStatus::Fixed;
        run.attempt_count = 2;
        run.resolved_by = ResolvedBy::Ai;
        run.pr_state = PrState::Open;
        run.pr_number = Some(17);
        run.pr_url = Some("https://github.com/acme/api/pull/17".to_string());
        run.touch();
        repo.update_run(&run).await.unwrap();

        let found = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(found.status, RunStatus::Fixed);
        assert_eq!(found.attempt_count, 2);
        assert_eq!(found.resolved_by, ResolvedBy::Ai);
        assert_eq!(found.pr_state, PrState::Open);
        assert_eq!(found.pr_number, Some(17));
    }

    #[tokio::test]
    async fn test_update_missing_run_is_error() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        let run = sample_run("acme/api", "abc123", "hash1");
        assert!(repo.update_run(&run).await.is_err());
    }

    #[tokio::test]
    async fn test_attempt_round_trip() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        let run = sample_run("acme/api", "abc123", "hash1");
        repo.insert_run(&run).await.unwrap();

        let mut attempt = repo
            .insert_attempt(NewAttempt {
                run_id: run.id.clone(),
                attempt_no: 1,
                status: AttemptStatus::Running,
            })
            .await
            .unwrap();

        attempt.status = AttemptStatus::Succeeded;
        attempt.diagnosis = Some("renamed field".to_string());
        attempt.proposed_fix = Some("rename call sites".to_string());
        attempt.validation_log = Some("[CONTAINER_VALIDATION_PASSED]".to_string());
        attempt.engine = Some("sequential".to_string());
        repo.update_attempt(&attempt).await.unwrap();

        let attempts = repo.attempts_for_run(&run.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, AttemptStatus::Succeeded);
        assert_eq!(attempts[0].diagnosis.as_deref(), Some("renamed field"));
        assert_eq!(attempts[0].engine.as_deref(), Some("sequential"));
    }

    #[tokio::test]
    async fn test_duplicate_attempt_no_rejected() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        let run = sample_run("acme/api", "abc123", "hash1");
        repo.insert_run(&run).await.unwrap();

        repo.insert_attempt(NewAttempt {
            run_id: run.id.clone(),
            attempt_no: 1,
            status: AttemptStatus::Running,
        })
        .await
        .unwrap();

        let duplicate = repo
            .insert_attempt(NewAttempt {
                run_id: run.id.clone(),
                attempt_no: 1,
                status: AttemptStatus::Running,
            })
            .await;
        assert!(duplicate.is_err());
    }

    #[tokio::test]
    async fn test_event_round_trip_preserves_payload() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        let run = sample_run("acme/api", "abc123", "hash1");
        repo.insert_run(&run).await.unwrap();

        let payload = serde_json::json!({"attemptNo": 1, "matches": ["fix-1"]});
        repo.append_event(NewEvent {
            run_id: run.id.clone(),
            event_type: "attempt.thinking".to_string(),
            actor: Actor::Ai,
            message: "diagnosis recorded".to_string(),
            payload: payload.clone(),
        })
        .await
        .unwrap();

        let events = repo.events_for_run(&run.id, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "attempt.thinking");
        assert_eq!(events[0].actor, Actor::Ai);
        assert_eq!(events[0].payload, payload);
    }

    #[tokio::test]
    async fn test_list_runs_with_filters() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        let mut fixed = sample_run("acme/api", "sha1", "hash1");
        fixed.status = RunStatus::Fixed;
        repo.insert_run(&fixed).await.unwrap();
        repo.insert_run(&sample_run("acme/api", "sha2", "hash2"))
            .await
            .unwrap();
        repo.insert_run(&sample_run("other/repo", "sha3", "hash3"))
            .await
            .unwrap();

        let page = repo
            .list_runs(&RunFilter {
                status: Some(RunStatus::Fixed),
                repository: Some("acme/api".to_string()),
                offset: 0,
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.runs[0].commit_sha, CommitSha::from("sha1"));

        let all = repo.list_runs(&RunFilter { limit: 10, ..Default::default() }).await.unwrap();
        assert_eq!(all.total, 3);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("healops.db");

        let run = sample_run("acme/api", "abc123", "hash1");
        {
            let repo = SqliteRepository::new(&db_path).unwrap();
            repo.insert_run(&run).await.unwrap();
        }

        let repo = SqliteRepository::new(&db_path).unwrap();
        let found = repo.get_run(&run.id).await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn test_summary_counts() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        let mut escalated = sample_run("acme/api", "sha1", "hash1");
        escalated.status = RunStatus::Escalated;
        repo.insert_run(&escalated).await.unwrap();
        repo.insert_run(&sample_run("acme/api", "sha2", "hash2"))
            .await
            .unwrap();

        let counts = repo.summary_counts().await.unwrap();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.escalated, 1);
        assert_eq!(counts.queued, 1);
    }

    #[tokio::test]
    async fn test_repository_metrics_grouping() {
        let repo = SqliteRepository::new_in_memory().unwrap();
        let mut fixed = sample_run("acme/api", "sha1", "hash1");
        fixed.status = RunStatus::Fixed;
        fixed.attempt_count = 2;
        repo.insert_run(&fixed).await.unwrap();
        repo.insert_run(&sample_run("acme/api", "sha2", "hash2"))
            .await
            .unwrap();
        repo.insert_run(&sample_run("zeta/repo", "sha3", "hash3"))
            .await
            .unwrap();

        let metrics = repo.repository_metrics().await.unwrap();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].repository, "acme/api");
        assert_eq!(metrics[0].total_runs, 2);
        assert_eq!(metrics[0].fixed, 1);
        assert_eq!(metrics[0].active, 1);
        assert_eq!(metrics[0].total_attempts, 2);
    }
}
