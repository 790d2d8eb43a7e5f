//! SQLite store: the single transactional boundary shared by every
//! component. Holds tasks, dependency edges, claims, workers, runs and the
//! schema-version marker. Values returned to callers are owned snapshots.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    ConnectOptions, Pool, Row, Sqlite,
};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, trace};

use crate::error::{GantryError, Result};
use crate::model::{
    Claim, ClaimStatus, Metadata, NewTask, Run, RunStatus, Task, TaskDetail, TaskStatus, Worker,
    WorkerStatus,
};

/// Ordered, additive migrations. Applied at open in order; the
/// `schema_version` marker records which have run.
const MIGRATIONS: &[&str] = &[
    // v1: tasks and dependency edges
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL CHECK (status IN
            ('backlog','ready','planning','active','blocked','review','human-review','done')),
        parent_id TEXT,
        score INTEGER NOT NULL DEFAULT 0,
        metadata TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        completed_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
    CREATE INDEX IF NOT EXISTS idx_tasks_parent_id ON tasks(parent_id);
    CREATE TABLE IF NOT EXISTS dependencies (
        blocker_id TEXT NOT NULL,
        blocked_id TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (blocker_id, blocked_id)
    );
    CREATE INDEX IF NOT EXISTS idx_dependencies_blocked ON dependencies(blocked_id);
    "#,
    // v2: claims, workers, runs
    r#"
    CREATE TABLE IF NOT EXISTS claims (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL,
        worker_id TEXT NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('active','released','expired')),
        claimed_at TEXT NOT NULL,
        lease_expires_at TEXT NOT NULL,
        renewed_count INTEGER NOT NULL DEFAULT 0
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_claims_one_active
        ON claims(task_id) WHERE status = 'active';
    CREATE INDEX IF NOT EXISTS idx_claims_worker ON claims(worker_id, status);
    CREATE TABLE IF NOT EXISTS workers (
        id TEXT PRIMARY KEY,
        host TEXT NOT NULL,
        pid INTEGER NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('idle','busy','dead')),
        registered_at TEXT NOT NULL,
        last_heartbeat_at TEXT NOT NULL,
        capabilities TEXT NOT NULL DEFAULT '[]',
        metadata TEXT NOT NULL DEFAULT '{}'
    );
    CREATE TABLE IF NOT EXISTS runs (
        id TEXT PRIMARY KEY,
        task_id TEXT,
        agent TEXT NOT NULL,
        pid INTEGER,
        proc_started_at INTEGER,
        status TEXT NOT NULL CHECK (status IN
            ('running','completed','failed','timeout','cancelled')),
        started_at TEXT NOT NULL,
        ended_at TEXT,
        exit_code INTEGER,
        output_path TEXT,
        error_message TEXT,
        metadata TEXT NOT NULL DEFAULT '{}'
    );
    CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
    CREATE INDEX IF NOT EXISTS idx_runs_task ON runs(task_id);
    "#,
    // v3: sync watermark
    r#"
    CREATE TABLE IF NOT EXISTS sync_state (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        last_export_at TEXT
    );
    INSERT OR IGNORE INTO sync_state (id, last_export_at) VALUES (1, NULL);
    "#,
];

const TASK_COLS: &str =
    "id, title, description, status, parent_id, score, metadata, created_at, updated_at, completed_at";

/// Format a timestamp for storage. Fixed-width RFC 3339 so that string
/// comparison in SQL matches chronological order.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| GantryError::Serialization(format!("bad timestamp '{s}': {e}")))
}

pub(crate) fn parse_ts_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(&s)).transpose()
}

fn parse_metadata(raw: &str) -> Result<Metadata> {
    serde_json::from_str(raw)
        .map_err(|e| GantryError::Serialization(format!("bad metadata json: {e}")))
}

/// SQLite-backed store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open the store at `path`, creating the file and applying any missing
    /// migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true)
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| GantryError::storage(format!("failed to open database: {e}")))?;

        Self::apply_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn apply_migrations(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        let current: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(pool)
            .await?;

        for (idx, batch) in MIGRATIONS.iter().enumerate() {
            let version = (idx + 1) as i64;
            if version <= current {
                continue;
            }
            let mut tx = pool.begin().await?;
            for statement in batch.split(';').map(str::trim).filter(|s| !s.is_empty()) {
                sqlx::query(statement)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| {
                        GantryError::storage(format!("migration {version} failed: {e}"))
                    })?;
            }
            sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
                .bind(version)
                .bind(fmt_ts(Utc::now()))
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            info!(version, "applied schema migration");
        }
        Ok(())
    }

    pub async fn schema_version(&self) -> Result<i64> {
        let version: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(&self.pool)
            .await?;
        Ok(version)
    }

    // ---- tasks ----

    pub(crate) fn row_to_task(row: &SqliteRow) -> Result<Task> {
        Ok(Task {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            status: TaskStatus::parse(row.try_get::<String, _>("status")?.as_str())?,
            parent_id: row.try_get("parent_id")?,
            score: row.try_get("score")?,
            metadata: parse_metadata(row.try_get::<String, _>("metadata")?.as_str())?,
            created_at: parse_ts(row.try_get::<String, _>("created_at")?.as_str())?,
            updated_at: parse_ts(row.try_get::<String, _>("updated_at")?.as_str())?,
            completed_at: parse_ts_opt(row.try_get("completed_at")?)?,
        })
    }

    /// Create a task. The parent, when set, must exist and must not close a
    /// hierarchy cycle.
    pub async fn create_task(&self, spec: NewTask) -> Result<Task> {
        let task = Task::from_spec(spec);
        if let Some(parent_id) = &task.parent_id {
            self.validate_parent(&task.id, parent_id).await?;
        }
        self.insert_task(&task).await?;
        debug!(task_id = %task.id, "created task");
        Ok(task)
    }

    /// Insert a fully-formed task row, preserving its timestamps. Used by
    /// task creation and by log import.
    pub(crate) async fn insert_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            "INSERT INTO tasks (id, title, description, status, parent_id, score, metadata,
                                created_at, updated_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.status.as_str())
        .bind(&task.parent_id)
        .bind(task.score)
        .bind(serde_json::to_string(&task.metadata)?)
        .bind(fmt_ts(task.created_at))
        .bind(fmt_ts(task.updated_at))
        .bind(task.completed_at.map(fmt_ts))
        .execute(&self.pool)
        .await
        .map_err(|e| GantryError::storage(format!("failed to insert task {}: {e}", task.id)))?;
        Ok(())
    }

    /// Overwrite a task row in place, preserving the caller's timestamps.
    /// Log import uses this to apply a winning upsert.
    pub(crate) async fn overwrite_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET title = ?, description = ?, status = ?, parent_id = ?, score = ?,
                              metadata = ?, created_at = ?, updated_at = ?, completed_at = ?
             WHERE id = ?",
        )
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.status.as_str())
        .bind(&task.parent_id)
        .bind(task.score)
        .bind(serde_json::to_string(&task.metadata)?)
        .bind(fmt_ts(task.created_at))
        .bind(fmt_ts(task.updated_at))
        .bind(task.completed_at.map(fmt_ts))
        .bind(&task.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLS} FROM tasks WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    pub async fn require_task(&self, id: &str) -> Result<Task> {
        self.get_task(id)
            .await?
            .ok_or_else(|| GantryError::task_not_found(id))
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLS} FROM tasks ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    /// Update a task's status, stamping `updated_at` and setting
    /// `completed_at` when it enters `Done`.
    pub async fn update_status(&self, id: &str, new: TaskStatus) -> Result<Task> {
        let now = Utc::now();
        let completed = if new == TaskStatus::Done {
            Some(fmt_ts(now))
        } else {
            None
        };
        let result = sqlx::query(
            "UPDATE tasks SET status = ?, updated_at = ?,
                              completed_at = COALESCE(?, CASE WHEN ? = 'done' THEN completed_at ELSE NULL END)
             WHERE id = ?",
        )
        .bind(new.as_str())
        .bind(fmt_ts(now))
        .bind(completed)
        .bind(new.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(GantryError::task_not_found(id));
        }
        trace!(task_id = %id, status = new.as_str(), "updated task status");
        self.require_task(id).await
    }

    /// Apply field updates to a task, stamping `updated_at`.
    pub async fn update_task(&self, task: &Task) -> Result<Task> {
        if let Some(parent_id) = &task.parent_id {
            self.validate_parent(&task.id, parent_id).await?;
        }
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE tasks SET title = ?, description = ?, status = ?, parent_id = ?, score = ?,
                              metadata = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.status.as_str())
        .bind(&task.parent_id)
        .bind(task.score)
        .bind(serde_json::to_string(&task.metadata)?)
        .bind(fmt_ts(now))
        .bind(&task.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(GantryError::task_not_found(&task.id));
        }
        self.require_task(&task.id).await
    }

    /// Delete a task and its dependency edges. Returns whether a row existed.
    pub async fn delete_task(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM dependencies WHERE blocker_id = ? OR blocked_id = ?")
            .bind(id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn validate_parent(&self, task_id: &str, parent_id: &str) -> Result<()> {
        if task_id == parent_id {
            return Err(GantryError::validation(format!(
                "task {task_id} cannot be its own parent"
            )));
        }
        // Walk the parent chain; revisiting task_id would close a cycle.
        let mut current = parent_id.to_string();
        let mut hops = 0usize;
        loop {
            let row = sqlx::query("SELECT parent_id FROM tasks WHERE id = ?")
                .bind(&current)
                .fetch_optional(&self.pool)
                .await?;
            let Some(row) = row else {
                return Err(GantryError::NotFound {
                    kind: "task",
                    id: current,
                });
            };
            match row.try_get::<Option<String>, _>("parent_id")? {
                Some(next) if next == task_id => {
                    return Err(GantryError::validation(format!(
                        "parent {parent_id} would create a hierarchy cycle through {task_id}"
                    )));
                }
                Some(next) => current = next,
                None => return Ok(()),
            }
            hops += 1;
            if hops > 10_000 {
                return Err(GantryError::storage("parent chain too deep".to_string()));
            }
        }
    }

    // ---- task detail (consumer contract) ----

    pub(crate) async fn blockers_of(&self, task_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT blocker_id FROM dependencies WHERE blocked_id = ? ORDER BY blocker_id",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| r.try_get("blocker_id").map_err(Into::into))
            .collect()
    }

    pub(crate) async fn blocked_by_task(&self, task_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT blocked_id FROM dependencies WHERE blocker_id = ? ORDER BY blocked_id",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| r.try_get("blocked_id").map_err(Into::into))
            .collect()
    }

    pub(crate) async fn children_of(&self, task_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT id FROM tasks WHERE parent_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| r.try_get("id").map_err(Into::into))
            .collect()
    }

    /// One task plus its dependency contract fields: blocker ids, ids of
    /// tasks it blocks, child ids and the computed ready flag.
    pub async fn task_detail(&self, id: &str) -> Result<TaskDetail> {
        let task = self.require_task(id).await?;
        let blocked_by = self.blockers_of(id).await?;
        let blocks = self.blocked_by_task(id).await?;
        let children = self.children_of(id).await?;
        let is_ready = matches!(
            crate::ready::is_ready(self, id).await?,
            crate::ready::Readiness::Ready
        );
        Ok(TaskDetail {
            task,
            blocked_by,
            blocks,
            children,
            is_ready,
        })
    }

    // ---- workers ----

    fn row_to_worker(row: &SqliteRow) -> Result<Worker> {
        Ok(Worker {
            id: row.try_get("id")?,
            host: row.try_get("host")?,
            pid: row.try_get("pid")?,
            status: WorkerStatus::parse(row.try_get::<String, _>("status")?.as_str())?,
            registered_at: parse_ts(row.try_get::<String, _>("registered_at")?.as_str())?,
            last_heartbeat_at: parse_ts(row.try_get::<String, _>("last_heartbeat_at")?.as_str())?,
            capabilities: serde_json::from_str(
                row.try_get::<String, _>("capabilities")?.as_str(),
            )
            .map_err(|e| GantryError::Serialization(format!("bad capabilities json: {e}")))?,
            metadata: parse_metadata(row.try_get::<String, _>("metadata")?.as_str())?,
        })
    }

    pub async fn insert_worker(&self, worker: &Worker) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO workers
                 (id, host, pid, status, registered_at, last_heartbeat_at, capabilities, metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&worker.id)
        .bind(&worker.host)
        .bind(worker.pid)
        .bind(worker.status.as_str())
        .bind(fmt_ts(worker.registered_at))
        .bind(fmt_ts(worker.last_heartbeat_at))
        .bind(serde_json::to_string(&worker.capabilities)?)
        .bind(serde_json::to_string(&worker.metadata)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_worker(&self, id: &str) -> Result<Option<Worker>> {
        let row = sqlx::query("SELECT * FROM workers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_worker).transpose()
    }

    pub async fn list_workers(&self) -> Result<Vec<Worker>> {
        let rows = sqlx::query("SELECT * FROM workers ORDER BY registered_at ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_worker).collect()
    }

    pub async fn heartbeat_worker(&self, id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE workers SET last_heartbeat_at = ? WHERE id = ?")
            .bind(fmt_ts(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(GantryError::NotFound {
                kind: "worker",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    pub async fn set_worker_status(&self, id: &str, status: WorkerStatus) -> Result<()> {
        sqlx::query("UPDATE workers SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_worker(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Workers whose last heartbeat is older than `cutoff` and are not
    /// already marked dead.
    pub async fn stale_workers(&self, cutoff: DateTime<Utc>) -> Result<Vec<Worker>> {
        let rows = sqlx::query(
            "SELECT * FROM workers WHERE status != 'dead' AND last_heartbeat_at < ?",
        )
        .bind(fmt_ts(cutoff))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_worker).collect()
    }

    // ---- runs ----

    fn row_to_run(row: &SqliteRow) -> Result<Run> {
        Ok(Run {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            agent: row.try_get("agent")?,
            pid: row.try_get("pid")?,
            proc_started_at: row.try_get("proc_started_at")?,
            status: RunStatus::parse(row.try_get::<String, _>("status")?.as_str())?,
            started_at: parse_ts(row.try_get::<String, _>("started_at")?.as_str())?,
            ended_at: parse_ts_opt(row.try_get("ended_at")?)?,
            exit_code: row.try_get("exit_code")?,
            output_path: row.try_get("output_path")?,
            error_message: row.try_get("error_message")?,
            metadata: parse_metadata(row.try_get::<String, _>("metadata")?.as_str())?,
        })
    }

    pub async fn insert_run(&self, run: &Run) -> Result<()> {
        sqlx::query(
            "INSERT INTO runs (id, task_id, agent, pid, proc_started_at, status, started_at,
                               ended_at, exit_code, output_path, error_message, metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&run.id)
        .bind(&run.task_id)
        .bind(&run.agent)
        .bind(run.pid)
        .bind(run.proc_started_at)
        .bind(run.status.as_str())
        .bind(fmt_ts(run.started_at))
        .bind(run.ended_at.map(fmt_ts))
        .bind(run.exit_code)
        .bind(&run.output_path)
        .bind(&run.error_message)
        .bind(serde_json::to_string(&run.metadata)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_run).transpose()
    }

    pub async fn list_running_runs(&self) -> Result<Vec<Run>> {
        let rows = sqlx::query("SELECT * FROM runs WHERE status = 'running' ORDER BY started_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_run).collect()
    }

    /// Finish a run, set the task's resulting status and release the
    /// worker's claim as one transaction, so a reader never observes a
    /// released claim alongside a still-running run.
    #[allow(clippy::too_many_arguments)]
    pub async fn finish_work(
        &self,
        run_id: &str,
        task_id: &str,
        worker_id: &str,
        run_status: RunStatus,
        exit_code: Option<i64>,
        error_message: Option<String>,
        output_path: Option<String>,
        task_status: TaskStatus,
    ) -> Result<()> {
        let now = fmt_ts(Utc::now());
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE runs SET status = ?, ended_at = ?, exit_code = ?, error_message = ?,
                             output_path = COALESCE(?, output_path)
             WHERE id = ? AND status = 'running'",
        )
        .bind(run_status.as_str())
        .bind(&now)
        .bind(exit_code)
        .bind(&error_message)
        .bind(&output_path)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE tasks SET status = ?, updated_at = ?,
                              completed_at = CASE WHEN ? = 'done' THEN ? ELSE completed_at END
             WHERE id = ?",
        )
        .bind(task_status.as_str())
        .bind(&now)
        .bind(task_status.as_str())
        .bind(&now)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;
        let released = sqlx::query(
            "UPDATE claims SET status = 'released'
             WHERE task_id = ? AND worker_id = ? AND status = 'active'",
        )
        .bind(task_id)
        .bind(worker_id)
        .execute(&mut *tx)
        .await?;
        if released.rows_affected() == 0 {
            // Claim was expired out from under us; record the work but do not
            // resurrect history.
            debug!(task_id, worker_id, "finish_work found no active claim to release");
        }
        tx.commit().await?;
        Ok(())
    }

    /// Reconciliation triad: cancel an orphaned run, expire its claim and
    /// reset the task to a workable status, in one transaction.
    pub async fn cancel_orphaned_run(&self, run: &Run, reason: &str) -> Result<()> {
        let now = fmt_ts(Utc::now());
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE runs SET status = 'cancelled', ended_at = ?, error_message = ?
             WHERE id = ? AND status = 'running'",
        )
        .bind(&now)
        .bind(reason)
        .bind(&run.id)
        .execute(&mut *tx)
        .await?;
        if let Some(task_id) = &run.task_id {
            // Only claims predating the run can belong to it; a claim taken
            // after the run started is a live re-claim by another worker.
            sqlx::query(
                "UPDATE claims SET status = 'expired'
                 WHERE task_id = ? AND status = 'active' AND claimed_at <= ?",
            )
            .bind(task_id)
            .bind(fmt_ts(run.started_at))
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "UPDATE tasks SET status = 'ready', updated_at = ?
                 WHERE id = ? AND status != 'done'
                   AND NOT EXISTS (SELECT 1 FROM claims c
                                   WHERE c.task_id = tasks.id AND c.status = 'active')",
            )
            .bind(&now)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ---- claims (row mapping shared with the claim protocol) ----

    pub(crate) fn row_to_claim(row: &SqliteRow) -> Result<Claim> {
        Ok(Claim {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            worker_id: row.try_get("worker_id")?,
            status: ClaimStatus::parse(row.try_get::<String, _>("status")?.as_str())?,
            claimed_at: parse_ts(row.try_get::<String, _>("claimed_at")?.as_str())?,
            lease_expires_at: parse_ts(row.try_get::<String, _>("lease_expires_at")?.as_str())?,
            renewed_count: row.try_get("renewed_count")?,
        })
    }

    // ---- sync watermark ----

    pub(crate) async fn last_export_at(&self) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT last_export_at FROM sync_state WHERE id = 1")
                .fetch_one(&self.pool)
                .await?;
        parse_ts_opt(raw)
    }

    pub(crate) async fn set_last_export_at(&self, ts: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE sync_state SET last_export_at = ? WHERE id = 1")
            .bind(fmt_ts(ts))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gantry.db");
        let store = SqliteStore::open(&path).await.unwrap();
        let v1 = store.schema_version().await.unwrap();
        drop(store);

        let store = SqliteStore::open(&path).await.unwrap();
        assert_eq!(store.schema_version().await.unwrap(), v1);
        assert_eq!(v1, MIGRATIONS.len() as i64);
    }

    #[tokio::test]
    async fn test_task_crud() {
        let (store, _dir) = open_store().await;
        let task = seed_task(&store, "write schema", 700).await;

        let fetched = store.require_task(&task.id).await.unwrap();
        assert_eq!(fetched.title, "write schema");
        assert_eq!(fetched.score, 700);
        assert_eq!(fetched.status, TaskStatus::Ready);

        let done = store.update_status(&task.id, TaskStatus::Done).await.unwrap();
        assert_eq!(done.status, TaskStatus::Done);
        assert!(done.completed_at.is_some());
        assert!(done.updated_at >= task.updated_at);

        assert!(store.delete_task(&task.id).await.unwrap());
        assert!(store.get_task(&task.id).await.unwrap().is_none());
        assert!(!store.delete_task(&task.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_parent_must_exist_and_not_cycle() {
        let (store, _dir) = open_store().await;
        let parent = seed_task(&store, "parent", 0).await;

        // Missing parent
        let missing = store
            .create_task(NewTask {
                title: "orphan".to_string(),
                parent_id: Some("nope".to_string()),
                ..Default::default()
            })
            .await;
        assert!(matches!(missing, Err(GantryError::NotFound { .. })));

        // Valid child
        let child = store
            .create_task(NewTask {
                title: "child".to_string(),
                parent_id: Some(parent.id.clone()),
                ..Default::default()
            })
            .await
            .unwrap();

        // Re-parenting the root under its own child closes a cycle
        let mut cycled = parent.clone();
        cycled.parent_id = Some(child.id.clone());
        let err = store.update_task(&cycled).await;
        assert!(matches!(err, Err(GantryError::Validation(_))));

        // Self-parenting is rejected outright
        let mut selfed = parent.clone();
        selfed.parent_id = Some(parent.id.clone());
        assert!(matches!(
            store.update_task(&selfed).await,
            Err(GantryError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_task_detail_contract_fields() {
        let (store, _dir) = open_store().await;
        let a = seed_task(&store, "a", 10).await;
        let b = seed_task(&store, "b", 20).await;
        let child = store
            .create_task(NewTask {
                title: "child of b".to_string(),
                parent_id: Some(b.id.clone()),
                status: Some(TaskStatus::Backlog),
                ..Default::default()
            })
            .await
            .unwrap();
        crate::graph::add_blocker(&store, &b.id, &a.id).await.unwrap();

        let detail = store.task_detail(&b.id).await.unwrap();
        assert_eq!(detail.blocked_by, vec![a.id.clone()]);
        assert!(detail.blocks.is_empty());
        assert_eq!(detail.children, vec![child.id.clone()]);
        assert!(!detail.is_ready);

        let detail_a = store.task_detail(&a.id).await.unwrap();
        assert_eq!(detail_a.blocks, vec![b.id.clone()]);
        assert!(detail_a.is_ready);
    }

    #[tokio::test]
    async fn test_cancel_orphaned_run_spares_a_newer_claim() {
        let (store, _dir) = open_store().await;
        let task = seed_task(&store, "t", 0).await;

        // First worker claims, starts a run, then its lease ages out
        let stale = crate::claim::claim(&store, &task.id, "w-1", 30).await.unwrap();
        let orphan = Run {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: Some(task.id.clone()),
            agent: "w-1".to_string(),
            pid: Some(0),
            proc_started_at: None,
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            exit_code: None,
            output_path: None,
            error_message: None,
            metadata: Metadata::new(),
        };
        store.insert_run(&orphan).await.unwrap();
        crate::claim::expire(&store, &stale.id).await.unwrap();

        // Second worker re-claims the task and is actively working it
        crate::claim::claim(&store, &task.id, "w-2", 30).await.unwrap();
        store.update_status(&task.id, TaskStatus::Active).await.unwrap();

        store
            .cancel_orphaned_run(&orphan, "recorded process is gone")
            .await
            .unwrap();

        // The stale run closes out; the live claim and task are untouched
        let run = store.get_run(&orphan.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        let holder = crate::claim::get_active_claim(&store, &task.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(holder.worker_id, "w-2");
        assert_eq!(
            store.require_task(&task.id).await.unwrap().status,
            TaskStatus::Active
        );
    }

    #[tokio::test]
    async fn test_worker_registry_rows() {
        let (store, _dir) = open_store().await;
        let worker = Worker {
            id: "w-1".to_string(),
            host: "localhost".to_string(),
            pid: 4242,
            status: WorkerStatus::Idle,
            registered_at: Utc::now(),
            last_heartbeat_at: Utc::now(),
            capabilities: vec!["rust".to_string()],
            metadata: Metadata::new(),
        };
        store.insert_worker(&worker).await.unwrap();

        let fetched = store.get_worker("w-1").await.unwrap().unwrap();
        assert_eq!(fetched.pid, 4242);
        assert_eq!(fetched.capabilities, vec!["rust".to_string()]);

        store.heartbeat_worker("w-1").await.unwrap();
        let beat = store.get_worker("w-1").await.unwrap().unwrap();
        assert!(beat.last_heartbeat_at >= fetched.last_heartbeat_at);

        let stale = store
            .stale_workers(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);

        assert!(store.delete_worker("w-1").await.unwrap());
    }
}
