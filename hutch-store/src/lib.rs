//! SQLite-backed durable state for hutchd.
//!
//! Every call opens its own connection, so a `StateStore` is cheap to clone
//! and safe to share across tasks. Timestamps are stored as RFC 3339 strings
//! in UTC with millisecond precision so lexical order matches time order.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use hutch_core::model::{
    ChatInfo, ContainerConfig, ContextMode, MountAllowlistEntry, RegisteredGroup, ScheduleKind,
    ScheduledTask, TaskStatus,
};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid value for {field}: {value}")]
    InvalidEnum { field: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Applied canvas request keys remembered per group for redelivery checks.
const CANVAS_REQUEST_HISTORY: i64 = 256;

/// Format a timestamp the way the store compares them.
pub fn timestamp(datetime: DateTime<Utc>) -> String {
    datetime.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_timestamp() -> String {
    timestamp(Utc::now())
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let connection = Connection::open(&path)?;
        create_schema(&connection)?;
        debug!(path = %path.display(), "state store ready");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // --- groups ---

    pub fn upsert_group(&self, group: &RegisteredGroup) -> Result<()> {
        let container_config = group
            .container_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO registered_groups
                   (jid, name, folder, trigger_pattern, is_main, requires_trigger,
                    container_config, added_at, disbanded)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(jid) DO UPDATE SET
                   name = excluded.name,
                   folder = excluded.folder,
                   trigger_pattern = excluded.trigger_pattern,
                   is_main = excluded.is_main,
                   requires_trigger = excluded.requires_trigger,
                   container_config = excluded.container_config,
                   disbanded = excluded.disbanded",
                params![
                    group.jid,
                    group.name,
                    group.folder,
                    group.trigger,
                    group.is_main,
                    group.requires_trigger,
                    container_config,
                    group.added_at,
                    group.disbanded,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_group(&self, jid: &str) -> Result<Option<RegisteredGroup>> {
        self.with_connection(|conn| {
            let group = conn
                .query_row(
                    "SELECT * FROM registered_groups WHERE jid = ?",
                    params![jid],
                    row_to_group,
                )
                .optional()?;
            Ok(group)
        })
    }

    pub fn get_group_by_folder(&self, folder: &str) -> Result<Option<RegisteredGroup>> {
        self.with_connection(|conn| {
            let group = conn
                .query_row(
                    "SELECT * FROM registered_groups WHERE folder = ? AND disbanded = 0",
                    params![folder],
                    row_to_group,
                )
                .optional()?;
            Ok(group)
        })
    }

    /// All groups that have not been disbanded, ordered by registration time.
    pub fn list_groups(&self) -> Result<Vec<RegisteredGroup>> {
        self.with_connection(|conn| {
            let mut statement = conn.prepare(
                "SELECT * FROM registered_groups WHERE disbanded = 0 ORDER BY added_at, jid",
            )?;
            let groups = statement
                .query_map([], row_to_group)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(groups)
        })
    }

    // --- sessions ---

    pub fn get_session(&self, group_folder: &str) -> Result<Option<String>> {
        self.with_connection(|conn| {
            let session = conn
                .query_row(
                    "SELECT session_id FROM sessions WHERE group_folder = ?",
                    params![group_folder],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(session)
        })
    }

    pub fn set_session(&self, group_folder: &str, session_id: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO sessions (group_folder, session_id) VALUES (?, ?)
                 ON CONFLICT(group_folder) DO UPDATE SET session_id = excluded.session_id",
                params![group_folder, session_id],
            )?;
            Ok(())
        })
    }

    // --- scheduled tasks ---

    /// Insert a task. Returns `false` if a task with the same id already exists,
    /// leaving the stored row untouched.
    pub fn create_task(&self, task: &ScheduledTask) -> Result<bool> {
        self.with_connection(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO scheduled_tasks
                   (id, group_folder, chat_jid, prompt, schedule_type, schedule_value,
                    context_mode, next_run, last_run, last_result, status, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    task.id,
                    task.group_folder,
                    task.chat_jid,
                    task.prompt,
                    task.schedule_type.as_str(),
                    task.schedule_value,
                    task.context_mode.as_str(),
                    task.next_run,
                    task.last_run,
                    task.last_result,
                    task.status.as_str(),
                    task.created_at,
                ],
            )?;
            Ok(inserted == 1)
        })
    }

    pub fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>> {
        self.with_connection(|conn| {
            let task = conn
                .query_row(
                    "SELECT * FROM scheduled_tasks WHERE id = ?",
                    params![id],
                    row_to_task,
                )
                .optional()?;
            Ok(task)
        })
    }

    pub fn list_tasks(&self) -> Result<Vec<ScheduledTask>> {
        self.with_connection(|conn| {
            let mut statement =
                conn.prepare("SELECT * FROM scheduled_tasks ORDER BY created_at, id")?;
            let tasks = statement
                .query_map([], row_to_task)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
    }

    pub fn list_tasks_for_group(&self, group_folder: &str) -> Result<Vec<ScheduledTask>> {
        self.with_connection(|conn| {
            let mut statement = conn.prepare(
                "SELECT * FROM scheduled_tasks WHERE group_folder = ? ORDER BY created_at, id",
            )?;
            let tasks = statement
                .query_map(params![group_folder], row_to_task)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
    }

    /// Returns `false` when no task has this id.
    pub fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<bool> {
        self.with_connection(|conn| {
            let updated = conn.execute(
                "UPDATE scheduled_tasks SET status = ? WHERE id = ?",
                params![status.as_str(), id],
            )?;
            Ok(updated == 1)
        })
    }

    /// Active tasks whose `next_run` is at or before `now`, oldest first.
    pub fn get_due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>> {
        self.with_connection(|conn| {
            let mut statement = conn.prepare(
                "SELECT * FROM scheduled_tasks
                 WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?
                 ORDER BY next_run",
            )?;
            let tasks = statement
                .query_map(params![timestamp(now)], row_to_task)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
    }

    /// Record a fire. A missing `next_run` completes an active task; paused or
    /// cancelled tasks keep their status.
    pub fn update_task_after_run(
        &self,
        id: &str,
        next_run: Option<&str>,
        last_result: &str,
        run_at: DateTime<Utc>,
    ) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE scheduled_tasks
                 SET next_run = ?1,
                     last_run = ?2,
                     last_result = ?3,
                     status = CASE WHEN ?1 IS NULL AND status = 'active'
                                   THEN 'completed' ELSE status END
                 WHERE id = ?4",
                params![next_run, timestamp(run_at), last_result, id],
            )?;
            Ok(())
        })
    }

    pub fn update_task_result(&self, id: &str, last_result: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE scheduled_tasks SET last_result = ? WHERE id = ?",
                params![last_result, id],
            )?;
            Ok(())
        })
    }

    // --- mount allowlist ---

    pub fn list_allowlist(&self) -> Result<Vec<MountAllowlistEntry>> {
        self.with_connection(|conn| {
            let mut statement = conn.prepare(
                "SELECT path, allow_read_write, description FROM mount_allowlist ORDER BY path",
            )?;
            let entries = statement
                .query_map([], |row| {
                    Ok(MountAllowlistEntry {
                        path: row.get("path")?,
                        allow_read_write: row.get("allow_read_write")?,
                        description: row.get("description")?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(entries)
        })
    }

    /// Merge entries by path; existing paths are overwritten.
    pub fn upsert_allowlist(&self, entries: &[MountAllowlistEntry]) -> Result<()> {
        self.with_connection(|conn| {
            let tx = conn.unchecked_transaction()?;
            for entry in entries {
                tx.execute(
                    "INSERT INTO mount_allowlist (path, allow_read_write, description)
                     VALUES (?, ?, ?)
                     ON CONFLICT(path) DO UPDATE SET
                       allow_read_write = excluded.allow_read_write,
                       description = excluded.description",
                    params![entry.path, entry.allow_read_write, entry.description],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    // --- chats ---

    pub fn store_chat_metadata(
        &self,
        jid: &str,
        timestamp: &str,
        name: Option<&str>,
        channel: Option<&str>,
    ) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO chats (jid, name, channel, last_message_time) VALUES (?, ?, ?, ?)
                 ON CONFLICT(jid) DO UPDATE SET
                   name = COALESCE(excluded.name, chats.name),
                   channel = COALESCE(excluded.channel, chats.channel),
                   last_message_time = MAX(chats.last_message_time, excluded.last_message_time)",
                params![jid, name, channel, timestamp],
            )?;
            Ok(())
        })
    }

    pub fn get_chat(&self, jid: &str) -> Result<Option<ChatInfo>> {
        self.with_connection(|conn| {
            let chat = conn
                .query_row(
                    "SELECT jid, name, channel, last_message_time FROM chats WHERE jid = ?",
                    params![jid],
                    row_to_chat,
                )
                .optional()?;
            Ok(chat)
        })
    }

    // --- canvas ---

    pub fn get_canvas(&self, group_folder: &str) -> Result<Option<Value>> {
        let raw: Option<String> = self.with_connection(|conn| {
            let raw = conn
                .query_row(
                    "SELECT state FROM canvas_state WHERE group_folder = ?",
                    params![group_folder],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(raw)
        })?;
        Ok(raw.map(|raw| serde_json::from_str(&raw)).transpose()?)
    }

    /// Whether the canvas update identified by `request_key` was already applied.
    pub fn canvas_request_applied(&self, group_folder: &str, request_key: &str) -> Result<bool> {
        self.with_connection(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM canvas_requests WHERE group_folder = ? AND request_key = ?",
                    params![group_folder, request_key],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Store the new canvas state and remember `request_key` in one
    /// transaction. Only the most recent keys per group are kept.
    pub fn set_canvas(&self, group_folder: &str, request_key: &str, state: &Value) -> Result<()> {
        let raw = serde_json::to_string(state)?;
        self.with_connection(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO canvas_state (group_folder, state, updated_at) VALUES (?, ?, ?)
                 ON CONFLICT(group_folder) DO UPDATE SET
                   state = excluded.state,
                   updated_at = excluded.updated_at",
                params![group_folder, raw, now_timestamp()],
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO canvas_requests (group_folder, request_key) VALUES (?, ?)",
                params![group_folder, request_key],
            )?;
            tx.execute(
                "DELETE FROM canvas_requests
                 WHERE group_folder = ?1 AND rowid NOT IN (
                   SELECT rowid FROM canvas_requests WHERE group_folder = ?1
                   ORDER BY rowid DESC LIMIT ?2
                 )",
                params![group_folder, CANVAS_REQUEST_HISTORY],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let connection = Connection::open(&self.path)?;
        connection.busy_timeout(std::time::Duration::from_secs(5))?;
        f(&connection)
    }
}

fn create_schema(connection: &Connection) -> Result<()> {
    connection.execute_batch(
        "
        PRAGMA journal_mode = WAL;

        CREATE TABLE IF NOT EXISTS registered_groups (
          jid TEXT PRIMARY KEY,
          name TEXT NOT NULL,
          folder TEXT NOT NULL,
          trigger_pattern TEXT NOT NULL,
          is_main INTEGER NOT NULL DEFAULT 0,
          requires_trigger INTEGER NOT NULL DEFAULT 1,
          container_config TEXT,
          added_at TEXT NOT NULL,
          disbanded INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_groups_folder ON registered_groups(folder);

        CREATE TABLE IF NOT EXISTS sessions (
          group_folder TEXT PRIMARY KEY,
          session_id TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS scheduled_tasks (
          id TEXT PRIMARY KEY,
          group_folder TEXT NOT NULL,
          chat_jid TEXT NOT NULL,
          prompt TEXT NOT NULL,
          schedule_type TEXT NOT NULL,
          schedule_value TEXT NOT NULL,
          context_mode TEXT NOT NULL DEFAULT 'isolated',
          next_run TEXT,
          last_run TEXT,
          last_result TEXT,
          status TEXT NOT NULL DEFAULT 'active',
          created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_due ON scheduled_tasks(status, next_run);

        CREATE TABLE IF NOT EXISTS mount_allowlist (
          path TEXT PRIMARY KEY,
          allow_read_write INTEGER NOT NULL DEFAULT 0,
          description TEXT
        );

        CREATE TABLE IF NOT EXISTS chats (
          jid TEXT PRIMARY KEY,
          name TEXT,
          channel TEXT,
          last_message_time TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS canvas_state (
          group_folder TEXT PRIMARY KEY,
          state TEXT NOT NULL,
          updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS canvas_requests (
          group_folder TEXT NOT NULL,
          request_key TEXT NOT NULL,
          PRIMARY KEY (group_folder, request_key)
        );
        ",
    )?;
    Ok(())
}

fn row_to_group(row: &Row<'_>) -> std::result::Result<RegisteredGroup, rusqlite::Error> {
    let container_config = row
        .get::<_, Option<String>>("container_config")?
        .map(|raw| serde_json::from_str::<ContainerConfig>(&raw))
        .transpose()
        .map_err(|err| wrap_conversion_error(StoreError::Serialization(err)))?;

    Ok(RegisteredGroup {
        jid: row.get("jid")?,
        name: row.get("name")?,
        folder: row.get("folder")?,
        trigger: row.get("trigger_pattern")?,
        is_main: row.get("is_main")?,
        requires_trigger: row.get("requires_trigger")?,
        container_config,
        added_at: row.get("added_at")?,
        disbanded: row.get("disbanded")?,
    })
}

fn row_to_task(row: &Row<'_>) -> std::result::Result<ScheduledTask, rusqlite::Error> {
    let schedule_type = parse_column::<ScheduleKind>(row, "schedule_type")?;
    let context_mode = parse_column::<ContextMode>(row, "context_mode")?;
    let status = parse_column::<TaskStatus>(row, "status")?;

    Ok(ScheduledTask {
        id: row.get("id")?,
        group_folder: row.get("group_folder")?,
        chat_jid: row.get("chat_jid")?,
        prompt: row.get("prompt")?,
        schedule_type,
        schedule_value: row.get("schedule_value")?,
        context_mode,
        next_run: row.get("next_run")?,
        last_run: row.get("last_run")?,
        last_result: row.get("last_result")?,
        status,
        created_at: row.get("created_at")?,
    })
}

fn row_to_chat(row: &Row<'_>) -> std::result::Result<ChatInfo, rusqlite::Error> {
    Ok(ChatInfo {
        jid: row.get("jid")?,
        name: row.get("name")?,
        channel: row.get("channel")?,
        last_message_time: row.get("last_message_time")?,
    })
}

fn parse_column<T: std::str::FromStr>(
    row: &Row<'_>,
    field: &'static str,
) -> std::result::Result<T, rusqlite::Error> {
    let raw: String = row.get(field)?;
    raw.parse::<T>()
        .map_err(|_| wrap_conversion_error(StoreError::InvalidEnum { field, value: raw }))
}

fn wrap_conversion_error(error: StoreError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use hutch_core::model::AdditionalMount;
    use serde_json::json;
    use tempfile::tempdir;

    fn build_group(jid: &str, folder: &str) -> RegisteredGroup {
        RegisteredGroup {
            jid: jid.to_string(),
            name: folder.to_string(),
            folder: folder.to_string(),
            trigger: "@Andy".to_string(),
            is_main: folder == "main",
            requires_trigger: true,
            container_config: None,
            added_at: now_timestamp(),
            disbanded: false,
        }
    }

    fn build_task(id: &str, next_run: Option<DateTime<Utc>>, status: TaskStatus) -> ScheduledTask {
        ScheduledTask {
            id: id.to_string(),
            group_folder: "family".to_string(),
            chat_jid: "tg:2".to_string(),
            prompt: "water the plants".to_string(),
            schedule_type: ScheduleKind::Interval,
            schedule_value: "60000".to_string(),
            context_mode: ContextMode::Isolated,
            next_run: next_run.map(timestamp),
            last_run: None,
            last_result: None,
            status,
            created_at: now_timestamp(),
        }
    }

    #[test]
    fn group_round_trips_with_container_config() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::open(dir.path().join("state.db")).expect("open store");

        let mut group = build_group("tg:2", "family");
        group.container_config = Some(ContainerConfig {
            additional_mounts: vec![AdditionalMount {
                host_path: "/srv/notes".to_string(),
                container_path: Some("notes".to_string()),
                readonly: true,
            }],
            timeout: Some(60_000),
        });
        store.upsert_group(&group).expect("upsert");

        let loaded = store.get_group("tg:2").expect("get").expect("present");
        assert_eq!(loaded, group);
        assert_eq!(
            store.get_group_by_folder("family").expect("by folder"),
            Some(group)
        );
    }

    #[test]
    fn list_groups_skips_disbanded() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::open(dir.path().join("state.db")).expect("open store");

        store.upsert_group(&build_group("tg:1", "main")).expect("main");
        let mut gone = build_group("tg:3", "old");
        gone.disbanded = true;
        store.upsert_group(&gone).expect("old");

        let groups = store.list_groups().expect("list");
        assert_eq!(groups.len(), 1);
        assert!(groups[0].is_main);
    }

    #[test]
    fn sessions_overwrite_per_folder() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::open(dir.path().join("state.db")).expect("open store");

        assert!(store.get_session("main").expect("get").is_none());
        store.set_session("main", "sess-1").expect("set");
        store.set_session("main", "sess-2").expect("set again");
        assert_eq!(store.get_session("main").expect("get").as_deref(), Some("sess-2"));
    }

    #[test]
    fn create_task_is_idempotent_by_id() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::open(dir.path().join("state.db")).expect("open store");

        let task = build_task("task-1", Some(Utc::now()), TaskStatus::Active);
        assert!(store.create_task(&task).expect("create"));

        let mut duplicate = task.clone();
        duplicate.prompt = "something else".to_string();
        assert!(!store.create_task(&duplicate).expect("create dup"));

        let stored = store.get_task("task-1").expect("get").expect("present");
        assert_eq!(stored.prompt, "water the plants");
    }

    #[test]
    fn get_due_tasks_returns_only_active_due_tasks() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::open(dir.path().join("state.db")).expect("open store");
        let now = Utc::now();

        store
            .create_task(&build_task("due", Some(now - ChronoDuration::seconds(5)), TaskStatus::Active))
            .expect("due");
        store
            .create_task(&build_task("paused", Some(now - ChronoDuration::seconds(5)), TaskStatus::Paused))
            .expect("paused");
        store
            .create_task(&build_task("future", Some(now + ChronoDuration::seconds(30)), TaskStatus::Active))
            .expect("future");

        let due = store.get_due_tasks(now).expect("due tasks");
        let ids: Vec<_> = due.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["due"]);
    }

    #[test]
    fn update_after_run_completes_active_task_without_next_run() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::open(dir.path().join("state.db")).expect("open store");
        let now = Utc::now();

        store
            .create_task(&build_task("once", Some(now), TaskStatus::Active))
            .expect("create");
        store
            .update_task_after_run("once", None, "ok", now)
            .expect("after run");

        let task = store.get_task("once").expect("get").expect("present");
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.next_run.is_none());
        assert_eq!(task.last_result.as_deref(), Some("ok"));
        assert_eq!(task.last_run, Some(timestamp(now)));
    }

    #[test]
    fn update_after_run_keeps_cancelled_status() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::open(dir.path().join("state.db")).expect("open store");
        let now = Utc::now();

        store
            .create_task(&build_task("t", Some(now), TaskStatus::Active))
            .expect("create");
        assert!(store.update_task_status("t", TaskStatus::Cancelled).expect("cancel"));
        store
            .update_task_after_run("t", None, "late result", now)
            .expect("after run");

        let task = store.get_task("t").expect("get").expect("present");
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(!store.update_task_status("missing", TaskStatus::Paused).expect("missing"));
    }

    #[test]
    fn allowlist_merges_by_path() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::open(dir.path().join("state.db")).expect("open store");

        store
            .upsert_allowlist(&[MountAllowlistEntry {
                path: "/srv/notes".to_string(),
                allow_read_write: false,
                description: None,
            }])
            .expect("first");
        store
            .upsert_allowlist(&[
                MountAllowlistEntry {
                    path: "/srv/notes".to_string(),
                    allow_read_write: true,
                    description: Some("notes".to_string()),
                },
                MountAllowlistEntry {
                    path: "/srv/photos".to_string(),
                    allow_read_write: false,
                    description: None,
                },
            ])
            .expect("second");

        let entries = store.list_allowlist().expect("list");
        assert_eq!(entries.len(), 2);
        assert!(entries[0].allow_read_write);
        assert_eq!(entries[1].path, "/srv/photos");
    }

    #[test]
    fn chat_metadata_keeps_known_name() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::open(dir.path().join("state.db")).expect("open store");

        store
            .store_chat_metadata("tg:2", "2026-01-01T00:00:00.000Z", Some("Family"), Some("telegram"))
            .expect("first");
        store
            .store_chat_metadata("tg:2", "2026-01-02T00:00:00.000Z", None, None)
            .expect("second");

        let chat = store.get_chat("tg:2").expect("get").expect("present");
        assert_eq!(chat.name.as_deref(), Some("Family"));
        assert_eq!(chat.channel.as_deref(), Some("telegram"));
        assert_eq!(chat.last_message_time, "2026-01-02T00:00:00.000Z");
    }

    #[test]
    fn canvas_state_round_trips() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::open(dir.path().join("state.db")).expect("open store");

        assert!(store.get_canvas("main").expect("get").is_none());
        assert!(!store.canvas_request_applied("main", "main/req-1").expect("seen"));
        store
            .set_canvas("main", "main/req-1", &json!({"title": "Standup"}))
            .expect("set");
        assert_eq!(
            store.get_canvas("main").expect("get"),
            Some(json!({"title": "Standup"}))
        );
        assert!(store.canvas_request_applied("main", "main/req-1").expect("seen"));
        assert!(!store.canvas_request_applied("family", "main/req-1").expect("other group"));
    }

    #[test]
    fn canvas_request_history_is_bounded() {
        let dir = tempdir().expect("tempdir");
        let store = StateStore::open(dir.path().join("state.db")).expect("open store");

        let total = CANVAS_REQUEST_HISTORY + 10;
        for i in 0..total {
            store
                .set_canvas("main", &format!("main/req-{i}"), &json!({"n": i}))
                .expect("set");
        }
        assert!(!store.canvas_request_applied("main", "main/req-0").expect("oldest"));
        assert!(
            store
                .canvas_request_applied("main", &format!("main/req-{}", total - 1))
                .expect("newest")
        );
    }
}
