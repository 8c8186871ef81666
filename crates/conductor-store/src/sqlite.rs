use crate::repository::{
    ClaimRequest, ConnectionRepository, DesktopWorkerRepository, HelpRepository,
    ScheduleRepository, TaskRepository,
};
use crate::schema;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{
    from_millis, ConductorError, ConductorResult, Connection, DesktopWorker, HelpRequest,
    ResponseSource, ScheduledTask, Task,
};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

const TASK_COLUMNS: &str = "task_id, prompt, options, status, worker_id, session_id, result, \
     source, source_metadata, scheduled_task_id, retry_count, messages, version, created_at, \
     updated_at, completed_at";

const SCHEDULE_COLUMNS: &str = "schedule_id, name, prompt, start_url, interval_seconds, \
     cron_expression, enabled, options, parallel_workers, max_runs, run_count, next_run_at, \
     last_run_at, notify_on_complete, self_learning, self_healing, self_learning_max_runs, \
     self_learning_run_count, deleted, created_at, updated_at";

const HELP_COLUMNS: &str = "request_id, task_id, worker_id, questions, context, timeout_seconds, \
     status, answers, response_source, channel, chat_id, message_id, created_at, resolved_at";

const CONNECTION_COLUMNS: &str =
    "client_id, client_type, status, capabilities, novnc_url, metadata, last_heartbeat, registered_at";

const DESKTOP_COLUMNS: &str = "client_id, novnc_url, capabilities, metadata, created_at, updated_at";

/// SQLite-backed store.
///
/// A single connection guarded by a mutex; every call runs on the blocking
/// thread pool. Due-schedule claims select and advance the schedules inside
/// one `BEGIN IMMEDIATE` transaction, so several processes sharing the
/// database file pick disjoint schedules and each slot is handed out once.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl SqliteStore {
    /// Open (creating parent directories if needed) and migrate a database
    /// file.
    pub fn open(path: impl AsRef<Path>) -> ConductorResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = schema::open_and_migrate(path).map_err(db_error)?;
        tracing::info!(path = %path.display(), "SQLite store opened");
        Ok(Self::from_connection(conn))
    }

    /// Private in-memory database, used by tests.
    pub fn open_in_memory() -> ConductorResult<Self> {
        let conn = schema::open_in_memory().map_err(db_error)?;
        Ok(Self::from_connection(conn))
    }

    /// Wrap an already migrated connection.
    pub fn from_connection(conn: rusqlite::Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    async fn run<T, F>(&self, f: F) -> ConductorResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> ConductorResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| ConductorError::Store(format!("blocking task failed: {e}")))?
    }
}

fn db_error(e: rusqlite::Error) -> ConductorError {
    ConductorError::Store(e.to_string())
}

fn millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> ConductorResult<String> {
    Ok(serde_json::to_string(value)?)
}

fn conversion_error(
    idx: usize,
    e: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(idx, e))
}

fn opt_json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| serde_json::from_str(&t).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn parse_col<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    text.parse().map_err(|e: String| conversion_error(idx, e))
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    Ok(from_millis(row.get(idx)?))
}

fn opt_time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let value: Option<i64> = row.get(idx)?;
    Ok(value.map(from_millis))
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        task_id: row.get(0)?,
        prompt: row.get(1)?,
        options: json_col(row, 2)?,
        status: parse_col(row, 3)?,
        worker_id: row.get(4)?,
        session_id: row.get(5)?,
        result: opt_json_col(row, 6)?,
        source: parse_col(row, 7)?,
        source_metadata: json_col(row, 8)?,
        scheduled_task_id: row.get(9)?,
        retry_count: row.get(10)?,
        messages: json_col(row, 11)?,
        version: to_u64(row.get(12)?),
        created_at: time_col(row, 13)?,
        updated_at: time_col(row, 14)?,
        completed_at: opt_time_col(row, 15)?,
    })
}

fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduledTask> {
    Ok(ScheduledTask {
        schedule_id: row.get(0)?,
        name: row.get(1)?,
        prompt: row.get(2)?,
        start_url: row.get(3)?,
        interval_seconds: to_u64(row.get(4)?),
        cron_expression: row.get(5)?,
        enabled: row.get(6)?,
        options: json_col(row, 7)?,
        parallel_workers: row.get(8)?,
        max_runs: row.get(9)?,
        run_count: row.get(10)?,
        next_run_at: opt_time_col(row, 11)?,
        last_run_at: opt_time_col(row, 12)?,
        notify_on_complete: row.get(13)?,
        self_learning: row.get(14)?,
        self_healing: row.get(15)?,
        self_learning_max_runs: row.get(16)?,
        self_learning_run_count: row.get(17)?,
        deleted: row.get(18)?,
        created_at: time_col(row, 19)?,
        updated_at: time_col(row, 20)?,
    })
}

fn help_from_row(row: &Row<'_>) -> rusqlite::Result<HelpRequest> {
    let source: Option<String> = row.get(8)?;
    Ok(HelpRequest {
        request_id: row.get(0)?,
        task_id: row.get(1)?,
        worker_id: row.get(2)?,
        questions: json_col(row, 3)?,
        context: opt_json_col(row, 4)?,
        timeout_seconds: row.get(5)?,
        status: parse_col(row, 6)?,
        answers: opt_json_col(row, 7)?,
        response_source: source.map(ResponseSource::from),
        channel: row.get(9)?,
        chat_id: opt_json_col(row, 10)?,
        message_id: row.get(11)?,
        created_at: time_col(row, 12)?,
        resolved_at: opt_time_col(row, 13)?,
    })
}

fn connection_from_row(row: &Row<'_>) -> rusqlite::Result<Connection> {
    let status: String = row.get(2)?;
    Ok(Connection {
        client_id: row.get(0)?,
        client_type: parse_col(row, 1)?,
        status: serde_json::from_value(serde_json::Value::String(status))
            .map_err(|e| conversion_error(2, e))?,
        capabilities: json_col(row, 3)?,
        novnc_url: row.get(4)?,
        metadata: json_col(row, 5)?,
        last_heartbeat: time_col(row, 6)?,
        registered_at: time_col(row, 7)?,
    })
}

fn desktop_from_row(row: &Row<'_>) -> rusqlite::Result<DesktopWorker> {
    Ok(DesktopWorker {
        client_id: row.get(0)?,
        novnc_url: row.get(1)?,
        capabilities: json_col(row, 2)?,
        metadata: json_col(row, 3)?,
        created_at: time_col(row, 4)?,
        updated_at: time_col(row, 5)?,
    })
}

fn query_all<T>(
    conn: &rusqlite::Connection,
    sql: &str,
    params: impl rusqlite::Params,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> ConductorResult<Vec<T>> {
    let mut stmt = conn.prepare(sql).map_err(db_error)?;
    let rows = stmt
        .query_map(params, map)
        .map_err(db_error)?
        .collect::<rusqlite::Result<Vec<T>>>()
        .map_err(db_error)?;
    Ok(rows)
}

// --- Tasks ---

#[async_trait]
impl TaskRepository for SqliteStore {
    async fn save_task(&self, task: &Task) -> ConductorResult<()> {
        let task = task.clone();
        self.run(move |conn| {
            let sql = format!(
                "INSERT INTO tasks ({TASK_COLUMNS}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16) \
                 ON CONFLICT(task_id) DO UPDATE SET \
                 prompt = excluded.prompt, options = excluded.options, status = excluded.status, \
                 worker_id = excluded.worker_id, session_id = excluded.session_id, \
                 result = excluded.result, source = excluded.source, \
                 source_metadata = excluded.source_metadata, \
                 scheduled_task_id = excluded.scheduled_task_id, \
                 retry_count = excluded.retry_count, messages = excluded.messages, \
                 version = excluded.version, updated_at = excluded.updated_at, \
                 completed_at = excluded.completed_at \
                 WHERE excluded.version > tasks.version"
            );
            let result = task.result.as_ref().map(to_json).transpose()?;
            conn.execute(
                &sql,
                params![
                    task.task_id,
                    task.prompt,
                    to_json(&task.options)?,
                    task.status.as_str(),
                    task.worker_id,
                    task.session_id,
                    result,
                    task.source.as_str(),
                    to_json(&task.source_metadata)?,
                    task.scheduled_task_id,
                    task.retry_count,
                    to_json(&task.messages)?,
                    to_i64(task.version),
                    millis(task.created_at),
                    millis(task.updated_at),
                    task.completed_at.map(millis),
                ],
            )
            .map_err(db_error)?;
            Ok(())
        })
        .await
    }

    async fn get_task(&self, task_id: &str) -> ConductorResult<Option<Task>> {
        let task_id = task_id.to_string();
        self.run(move |conn| {
            conn.query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"),
                params![task_id],
                task_from_row,
            )
            .optional()
            .map_err(db_error)
        })
        .await
    }

    async fn list_active_tasks(&self) -> ConductorResult<Vec<Task>> {
        self.run(|conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE status NOT IN ('completed', 'failed') ORDER BY created_at"
                ),
                [],
                task_from_row,
            )
        })
        .await
    }

    async fn list_tasks_by_schedule(&self, schedule_id: &str) -> ConductorResult<Vec<Task>> {
        let schedule_id = schedule_id.to_string();
        self.run(move |conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE scheduled_task_id = ?1 ORDER BY created_at"
                ),
                params![schedule_id],
                task_from_row,
            )
        })
        .await
    }

    async fn list_recent_tasks(&self, limit: usize) -> ConductorResult<Vec<Task>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.run(move |conn| {
            query_all(
                conn,
                &format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC LIMIT ?1"),
                params![limit],
                task_from_row,
            )
        })
        .await
    }
}

// --- Schedules ---

#[async_trait]
impl ScheduleRepository for SqliteStore {
    async fn create_schedule(&self, schedule: &ScheduledTask) -> ConductorResult<()> {
        let s = schedule.clone();
        self.run(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO scheduled_tasks ({SCHEDULE_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                      ?17, ?18, ?19, ?20, ?21)"
                ),
                params![
                    s.schedule_id,
                    s.name,
                    s.prompt,
                    s.start_url,
                    to_i64(s.interval_seconds),
                    s.cron_expression,
                    s.enabled,
                    to_json(&s.options)?,
                    s.parallel_workers,
                    s.max_runs,
                    s.run_count,
                    s.next_run_at.map(millis),
                    s.last_run_at.map(millis),
                    s.notify_on_complete,
                    s.self_learning,
                    s.self_healing,
                    s.self_learning_max_runs,
                    s.self_learning_run_count,
                    s.deleted,
                    millis(s.created_at),
                    millis(s.updated_at),
                ],
            )
            .map_err(db_error)?;
            Ok(())
        })
        .await
    }

    async fn update_schedule(&self, schedule: &ScheduledTask) -> ConductorResult<bool> {
        let s = schedule.clone();
        self.run(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE scheduled_tasks SET name = ?2, prompt = ?3, start_url = ?4, \
                     interval_seconds = ?5, cron_expression = ?6, enabled = ?7, options = ?8, \
                     parallel_workers = ?9, max_runs = ?10, next_run_at = ?11, \
                     notify_on_complete = ?12, self_learning = ?13, self_healing = ?14, \
                     self_learning_max_runs = ?15, updated_at = ?16 \
                     WHERE schedule_id = ?1 AND deleted = 0",
                    params![
                        s.schedule_id,
                        s.name,
                        s.prompt,
                        s.start_url,
                        to_i64(s.interval_seconds),
                        s.cron_expression,
                        s.enabled,
                        to_json(&s.options)?,
                        s.parallel_workers,
                        s.max_runs,
                        s.next_run_at.map(millis),
                        s.notify_on_complete,
                        s.self_learning,
                        s.self_healing,
                        s.self_learning_max_runs,
                        millis(s.updated_at),
                    ],
                )
                .map_err(db_error)?;
            Ok(changed > 0)
        })
        .await
    }

    async fn get_schedule(&self, schedule_id: &str) -> ConductorResult<Option<ScheduledTask>> {
        let schedule_id = schedule_id.to_string();
        self.run(move |conn| {
            conn.query_row(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM scheduled_tasks WHERE schedule_id = ?1"),
                params![schedule_id],
                schedule_from_row,
            )
            .optional()
            .map_err(db_error)
        })
        .await
    }

    async fn list_schedules(&self) -> ConductorResult<Vec<ScheduledTask>> {
        self.run(|conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM scheduled_tasks WHERE deleted = 0 ORDER BY created_at"
                ),
                [],
                schedule_from_row,
            )
        })
        .await
    }

    async fn delete_schedule(&self, schedule_id: &str) -> ConductorResult<bool> {
        let schedule_id = schedule_id.to_string();
        let now = millis(Utc::now());
        self.run(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE scheduled_tasks SET deleted = 1, enabled = 0, updated_at = ?2 \
                     WHERE schedule_id = ?1 AND deleted = 0",
                    params![schedule_id, now],
                )
                .map_err(db_error)?;
            Ok(changed > 0)
        })
        .await
    }

    async fn claim_due(&self, request: &ClaimRequest) -> ConductorResult<Vec<ScheduledTask>> {
        let owner = request.owner.clone();
        let now = request.now;
        let limit = i64::try_from(request.limit).unwrap_or(i64::MAX);
        self.run(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_error)?;
            let mut due = query_all(
                &tx,
                &format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM scheduled_tasks \
                     WHERE enabled = 1 AND deleted = 0 \
                     AND next_run_at IS NOT NULL AND next_run_at <= ?1 \
                     ORDER BY next_run_at LIMIT ?2"
                ),
                params![millis(now), limit],
                schedule_from_row,
            )?;
            for schedule in &mut due {
                schedule.record_run(now);
                tx.execute(
                    "UPDATE scheduled_tasks SET run_count = ?2, last_run_at = ?3, next_run_at = ?4, \
                     enabled = ?5, updated_at = ?6, last_fired_by = ?7 \
                     WHERE schedule_id = ?1",
                    params![
                        schedule.schedule_id,
                        schedule.run_count,
                        schedule.last_run_at.map(millis),
                        schedule.next_run_at.map(millis),
                        schedule.enabled,
                        millis(schedule.updated_at),
                        owner,
                    ],
                )
                .map_err(db_error)?;
            }
            tx.commit().map_err(db_error)?;
            Ok(due)
        })
        .await
    }

    async fn increment_learning_runs(&self, schedule_id: &str) -> ConductorResult<Option<u32>> {
        let schedule_id = schedule_id.to_string();
        self.run(move |conn| {
            conn.query_row(
                "UPDATE scheduled_tasks \
                 SET self_learning_run_count = self_learning_run_count + 1 \
                 WHERE schedule_id = ?1 RETURNING self_learning_run_count",
                params![schedule_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_error)
        })
        .await
    }
}

// --- Help requests ---

#[async_trait]
impl HelpRepository for SqliteStore {
    async fn save_help_request(&self, request: &HelpRequest) -> ConductorResult<()> {
        let r = request.clone();
        self.run(move |conn| {
            let context = r.context.as_ref().map(to_json).transpose()?;
            let answers = r.answers.as_ref().map(to_json).transpose()?;
            let chat_id = r.chat_id.as_ref().map(to_json).transpose()?;
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO help_requests ({HELP_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    r.request_id,
                    r.task_id,
                    r.worker_id,
                    to_json(&r.questions)?,
                    context,
                    r.timeout_seconds,
                    r.status.as_str(),
                    answers,
                    r.response_source.map(String::from),
                    r.channel,
                    chat_id,
                    r.message_id,
                    millis(r.created_at),
                    r.resolved_at.map(millis),
                ],
            )
            .map_err(db_error)?;
            Ok(())
        })
        .await
    }

    async fn get_help_request(&self, request_id: &str) -> ConductorResult<Option<HelpRequest>> {
        let request_id = request_id.to_string();
        self.run(move |conn| {
            conn.query_row(
                &format!("SELECT {HELP_COLUMNS} FROM help_requests WHERE request_id = ?1"),
                params![request_id],
                help_from_row,
            )
            .optional()
            .map_err(db_error)
        })
        .await
    }

    async fn list_pending_help_requests(&self) -> ConductorResult<Vec<HelpRequest>> {
        self.run(|conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {HELP_COLUMNS} FROM help_requests WHERE status = 'pending' ORDER BY created_at"
                ),
                [],
                help_from_row,
            )
        })
        .await
    }
}

// --- Connections ---

#[async_trait]
impl ConnectionRepository for SqliteStore {
    async fn save_connection(&self, connection: &Connection) -> ConductorResult<()> {
        let c = connection.clone();
        self.run(move |conn| {
            let status = serde_json::to_value(c.status)?;
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO connections ({CONNECTION_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    c.client_id,
                    c.client_type.as_str(),
                    status.as_str().unwrap_or("idle"),
                    to_json(&c.capabilities)?,
                    c.novnc_url,
                    to_json(&c.metadata)?,
                    millis(c.last_heartbeat),
                    millis(c.registered_at),
                ],
            )
            .map_err(db_error)?;
            Ok(())
        })
        .await
    }

    async fn delete_connection(&self, client_id: &str) -> ConductorResult<()> {
        let client_id = client_id.to_string();
        self.run(move |conn| {
            conn.execute(
                "DELETE FROM connections WHERE client_id = ?1",
                params![client_id],
            )
            .map_err(db_error)?;
            Ok(())
        })
        .await
    }

    async fn list_connections(&self) -> ConductorResult<Vec<Connection>> {
        self.run(|conn| {
            query_all(
                conn,
                &format!("SELECT {CONNECTION_COLUMNS} FROM connections ORDER BY registered_at"),
                [],
                connection_from_row,
            )
        })
        .await
    }
}

// --- Desktop workers ---

#[async_trait]
impl DesktopWorkerRepository for SqliteStore {
    async fn upsert_desktop_worker(&self, worker: &DesktopWorker) -> ConductorResult<()> {
        let w = worker.clone();
        self.run(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO desktop_workers ({DESKTOP_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                     ON CONFLICT(client_id) DO UPDATE SET novnc_url = excluded.novnc_url, \
                     capabilities = excluded.capabilities, metadata = excluded.metadata, \
                     updated_at = excluded.updated_at"
                ),
                params![
                    w.client_id,
                    w.novnc_url,
                    to_json(&w.capabilities)?,
                    to_json(&w.metadata)?,
                    millis(w.created_at),
                    millis(w.updated_at),
                ],
            )
            .map_err(db_error)?;
            Ok(())
        })
        .await
    }

    async fn get_desktop_worker(&self, client_id: &str) -> ConductorResult<Option<DesktopWorker>> {
        let client_id = client_id.to_string();
        self.run(move |conn| {
            conn.query_row(
                &format!("SELECT {DESKTOP_COLUMNS} FROM desktop_workers WHERE client_id = ?1"),
                params![client_id],
                desktop_from_row,
            )
            .optional()
            .map_err(db_error)
        })
        .await
    }

    async fn delete_desktop_worker(&self, client_id: &str) -> ConductorResult<bool> {
        let client_id = client_id.to_string();
        self.run(move |conn| {
            let changed = conn
                .execute(
                    "DELETE FROM desktop_workers WHERE client_id = ?1",
                    params![client_id],
                )
                .map_err(db_error)?;
            Ok(changed > 0)
        })
        .await
    }

    async fn list_desktop_workers(&self) -> ConductorResult<Vec<DesktopWorker>> {
        self.run(|conn| {
            query_all(
                conn,
                &format!("SELECT {DESKTOP_COLUMNS} FROM desktop_workers ORDER BY client_id"),
                [],
                desktop_from_row,
            )
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use conductor_core::{TaskSource, TaskStatus};
    use serde_json::json;

    #[tokio::test]
    async fn test_task_roundtrip_and_version_guard() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut task = Task::new("t1", "collect invoices", TaskSource::Gateway);
        task.source_metadata.insert("chat_id".into(), json!(123));
        store.save_task(&task).await.unwrap();

        let stale = task.clone();
        task.assign_to("w1").unwrap();
        task.push_message(json!({"step": 1}));
        store.save_task(&task).await.unwrap();
        // An older snapshot arriving late is ignored.
        store.save_task(&stale).await.unwrap();

        let loaded = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Assigned);
        assert_eq!(loaded.worker_id.as_deref(), Some("w1"));
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.source_metadata["chat_id"], json!(123));
        assert_eq!(loaded.version, task.version);
    }

    #[tokio::test]
    async fn test_active_tasks_exclude_terminal() {
        let store = SqliteStore::open_in_memory().unwrap();
        let open = Task::new("open", "x", TaskSource::Api);
        let mut done = Task::new("done", "x", TaskSource::Api);
        done.finish(TaskStatus::Completed, json!("ok")).unwrap();
        store.save_task(&open).await.unwrap();
        store.save_task(&done).await.unwrap();
        let active = store.list_active_tasks().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].task_id, "open");
    }

    #[tokio::test]
    async fn test_increment_learning_runs() {
        let store = SqliteStore::open_in_memory().unwrap();
        let schedule = ScheduledTask::new("learn", "x", 60);
        store.create_schedule(&schedule).await.unwrap();
        assert_eq!(
            store
                .increment_learning_runs(&schedule.schedule_id)
                .await
                .unwrap(),
            Some(1)
        );
        assert_eq!(
            store
                .increment_learning_runs(&schedule.schedule_id)
                .await
                .unwrap(),
            Some(2)
        );
        assert_eq!(store.increment_learning_runs("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_connection_snapshot() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut conn = Connection::new("sup-1", conductor_core::ClientType::Supervisor);
        conn.status = conductor_core::ClientStatus::Busy;
        store.save_connection(&conn).await.unwrap();
        let listed = store.list_connections().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, conductor_core::ClientStatus::Busy);
        store.delete_connection("sup-1").await.unwrap();
        assert!(store.list_connections().await.unwrap().is_empty());
    }
}
