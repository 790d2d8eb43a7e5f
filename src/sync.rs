//! Operation-log sync: export the task graph as an append-friendly JSONL
//! log, import a log with timestamp-based last-writer-wins merging, and
//! compact a log down to the latest entry per key. The log carries tasks and
//! dependency edges only; claims, workers and runs are local runtime state
//! and never travel.

use chrono::{DateTime, Utc};
use sqlx::Row;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{
    LogDependencyFields, LogEntry, LogOp, LogTaskFields, Task, LOG_FORMAT_VERSION,
};
use crate::store::{fmt_ts, parse_ts, SqliteStore};

/// Counters from one import pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportReport {
    /// Entries applied to the store.
    pub imported: usize,
    /// Entries the local copy won against.
    pub conflicts: usize,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Lines that failed to parse and were skipped.
    pub malformed: usize,
}

/// Snapshot of sync freshness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    /// Whether any task or edge changed since the last export.
    pub dirty: bool,
    pub tasks: usize,
    pub dependencies: usize,
    pub last_export_at: Option<DateTime<Utc>>,
}

/// Export every task and dependency edge to `path` as one JSON object per
/// line, ordered by timestamp. Returns the number of entries written.
pub async fn export(store: &SqliteStore, path: impl AsRef<Path>) -> Result<usize> {
    let mut entries = Vec::new();

    for task in store.list_tasks().await? {
        entries.push(LogEntry {
            v: LOG_FORMAT_VERSION,
            op: LogOp::Upsert,
            ts: task.updated_at,
            id: task.id.clone(),
            payload: serde_json::to_value(task_fields(&task))?,
        });
    }

    for (blocker_id, blocked_id, created_at) in list_edges(store).await? {
        entries.push(LogEntry {
            v: LOG_FORMAT_VERSION,
            op: LogOp::DependencyAdd,
            ts: created_at,
            id: edge_id(&blocker_id, &blocked_id),
            payload: serde_json::to_value(LogDependencyFields {
                blocker_id,
                blocked_id,
            })?,
        });
    }

    entries.sort_by(|a, b| a.ts.cmp(&b.ts).then_with(|| a.id.cmp(&b.id)));

    let mut out = String::new();
    for entry in &entries {
        out.push_str(&serde_json::to_string(entry)?);
        out.push('\n');
    }
    tokio::fs::write(path.as_ref(), out).await?;

    store.set_last_export_at(Utc::now()).await?;
    info!(path = %path.as_ref().display(), entries = entries.len(), "exported operation log");
    Ok(entries.len())
}

/// Import a log, merging by timestamp: an entry wins only when its timestamp
/// is strictly newer than the local row's `updated_at`. Ties and older
/// entries leave the local copy in place and count as conflicts. Dependency
/// operations are idempotent set operations and apply unconditionally.
pub async fn import(store: &SqliteStore, path: impl AsRef<Path>) -> Result<ImportReport> {
    let raw = tokio::fs::read_to_string(path.as_ref()).await?;
    let mut report = ImportReport::default();

    let mut entries: Vec<LogEntry> = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<LogEntry>(line) {
            Ok(entry) if entry.v <= LOG_FORMAT_VERSION => entries.push(entry),
            Ok(entry) => {
                warn!(version = entry.v, "skipping entry from a newer log format");
                report.malformed += 1;
            }
            Err(e) => {
                warn!(error = %e, "skipping malformed log line");
                report.malformed += 1;
            }
        }
    }

    // Oldest first, so later entries in the same log supersede earlier ones.
    entries.sort_by(|a, b| a.ts.cmp(&b.ts));

    for entry in entries {
        apply_entry(store, entry, &mut report).await?;
    }

    info!(
        path = %path.as_ref().display(),
        imported = report.imported,
        conflicts = report.conflicts,
        malformed = report.malformed,
        "imported operation log"
    );
    Ok(report)
}

async fn apply_entry(store: &SqliteStore, entry: LogEntry, report: &mut ImportReport) -> Result<()> {
    match entry.op {
        LogOp::Upsert => {
            let fields: LogTaskFields = serde_json::from_value(entry.payload)?;
            let incoming = Task {
                id: entry.id.clone(),
                title: fields.title,
                description: fields.description,
                status: fields.status,
                parent_id: fields.parent_id,
                score: fields.score,
                metadata: fields.metadata,
                created_at: fields.created_at,
                updated_at: entry.ts,
                completed_at: fields.completed_at,
            };
            match store.get_task(&entry.id).await? {
                None => {
                    store.insert_task(&incoming).await?;
                    report.created += 1;
                    report.imported += 1;
                }
                Some(local) if entry.ts > local.updated_at => {
                    store.overwrite_task(&incoming).await?;
                    report.updated += 1;
                    report.imported += 1;
                }
                Some(local) => {
                    debug!(task_id = %entry.id, local_ts = %fmt_ts(local.updated_at), "local copy wins");
                    report.conflicts += 1;
                }
            }
        }
        LogOp::Delete => match store.get_task(&entry.id).await? {
            Some(local) if entry.ts > local.updated_at => {
                store.delete_task(&entry.id).await?;
                report.deleted += 1;
                report.imported += 1;
            }
            Some(_) => report.conflicts += 1,
            None => {}
        },
        LogOp::DependencyAdd => {
            let dep: LogDependencyFields = serde_json::from_value(entry.payload)?;
            sqlx::query(
                "INSERT OR IGNORE INTO dependencies (blocker_id, blocked_id, created_at)
                 VALUES (?, ?, ?)",
            )
            .bind(&dep.blocker_id)
            .bind(&dep.blocked_id)
            .bind(fmt_ts(entry.ts))
            .execute(store.pool())
            .await?;
            report.imported += 1;
        }
        LogOp::DependencyRemove => {
            let dep: LogDependencyFields = serde_json::from_value(entry.payload)?;
            sqlx::query("DELETE FROM dependencies WHERE blocker_id = ? AND blocked_id = ?")
                .bind(&dep.blocker_id)
                .bind(&dep.blocked_id)
                .execute(store.pool())
                .await?;
            report.imported += 1;
        }
    }
    Ok(())
}

/// Rewrite a log keeping only the latest entry per key: per task id for
/// upsert/delete, per edge for dependency operations. Returns the entry
/// counts before and after.
pub async fn compact(path: impl AsRef<Path>) -> Result<(usize, usize)> {
    let raw = tokio::fs::read_to_string(path.as_ref()).await?;
    let mut latest: HashMap<String, LogEntry> = HashMap::new();
    let mut before = 0usize;
    let mut malformed = 0usize;

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        before += 1;
        let entry = match serde_json::from_str::<LogEntry>(line) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "dropping malformed log line during compaction");
                malformed += 1;
                continue;
            }
        };
        let key = match entry.op {
            LogOp::Upsert | LogOp::Delete => format!("task:{}", entry.id),
            LogOp::DependencyAdd | LogOp::DependencyRemove => format!("edge:{}", entry.id),
        };
        match latest.get(&key) {
            // Later line wins on equal timestamps: log order is write order.
            Some(existing) if existing.ts > entry.ts => {}
            _ => {
                latest.insert(key, entry);
            }
        }
    }

    let mut entries: Vec<LogEntry> = latest.into_values().collect();
    entries.sort_by(|a, b| a.ts.cmp(&b.ts).then_with(|| a.id.cmp(&b.id)));
    let after = entries.len();

    let mut out = String::new();
    for entry in &entries {
        out.push_str(&serde_json::to_string(entry)?);
        out.push('\n');
    }
    tokio::fs::write(path.as_ref(), out).await?;
    info!(path = %path.as_ref().display(), before, after, malformed, "compacted operation log");
    Ok((before, after))
}

/// Report whether local state changed since the last export.
pub async fn status(store: &SqliteStore) -> Result<SyncStatus> {
    let tasks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
        .fetch_one(store.pool())
        .await?;
    let dependencies: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dependencies")
        .fetch_one(store.pool())
        .await?;
    let last_export_at = store.last_export_at().await?;

    let dirty = match last_export_at {
        None => tasks > 0 || dependencies > 0,
        Some(watermark) => {
            let marker = fmt_ts(watermark);
            let changed_tasks: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE updated_at > ?")
                    .bind(&marker)
                    .fetch_one(store.pool())
                    .await?;
            let changed_edges: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM dependencies WHERE created_at > ?")
                    .bind(&marker)
                    .fetch_one(store.pool())
                    .await?;
            changed_tasks > 0 || changed_edges > 0
        }
    };

    Ok(SyncStatus {
        dirty,
        tasks: tasks as usize,
        dependencies: dependencies as usize,
        last_export_at,
    })
}

fn task_fields(task: &Task) -> LogTaskFields {
    LogTaskFields {
        title: task.title.clone(),
        description: task.description.clone(),
        status: task.status,
        parent_id: task.parent_id.clone(),
        score: task.score,
        metadata: task.metadata.clone(),
        created_at: task.created_at,
        completed_at: task.completed_at,
    }
}

fn edge_id(blocker_id: &str, blocked_id: &str) -> String {
    format!("{blocker_id}->{blocked_id}")
}

async fn list_edges(store: &SqliteStore) -> Result<Vec<(String, String, DateTime<Utc>)>> {
    let rows = sqlx::query(
        "SELECT blocker_id, blocked_id, created_at FROM dependencies
         ORDER BY created_at ASC, blocker_id ASC, blocked_id ASC",
    )
    .fetch_all(store.pool())
    .await?;
    rows.iter()
        .map(|row| {
            Ok((
                row.try_get("blocker_id")?,
                row.try_get("blocked_id")?,
                parse_ts(row.try_get::<String, _>("created_at")?.as_str())?,
            ))
        })
        .collect()
}
