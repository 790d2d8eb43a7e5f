//! Dependency graph over tasks: directed blocker -> blocked edges. Rejects
//! self-loops at the door and cycles of any length by walking the stored
//! edge set before inserting.

use chrono::Utc;
use std::collections::{HashSet, VecDeque};
use tracing::debug;

use crate::error::{GantryError, Result};
use crate::store::{fmt_ts, SqliteStore};

/// Add a blocker edge: `blocker` must reach `Done` before `blocked` is
/// workable.
///
/// Fails with `Validation` when the task blocks itself or the edge already
/// exists, and with `CircularDependency` when a path blocked -> ... -> blocker
/// already exists in the edge set.
pub async fn add_blocker(store: &SqliteStore, blocked: &str, blocker: &str) -> Result<()> {
    if blocked == blocker {
        return Err(GantryError::validation(format!(
            "task {blocked} cannot block itself"
        )));
    }
    store.require_task(blocked).await?;
    store.require_task(blocker).await?;

    if edge_exists(store, blocker, blocked).await? {
        return Err(GantryError::validation(format!(
            "dependency {blocker} -> {blocked} already exists"
        )));
    }

    // Inserting blocker -> blocked closes a cycle iff blocker is already
    // reachable from blocked over the existing edges.
    if let Some(path) = find_path(store, blocked, blocker).await? {
        return Err(GantryError::CircularDependency {
            cycle: path.join(" -> "),
        });
    }

    sqlx::query("INSERT INTO dependencies (blocker_id, blocked_id, created_at) VALUES (?, ?, ?)")
        .bind(blocker)
        .bind(blocked)
        .bind(fmt_ts(Utc::now()))
        .execute(store.pool())
        .await?;
    debug!(blocker, blocked, "added dependency edge");
    Ok(())
}

/// Remove a blocker edge. No-op when the edge is absent.
pub async fn remove_blocker(store: &SqliteStore, blocked: &str, blocker: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM dependencies WHERE blocker_id = ? AND blocked_id = ?")
        .bind(blocker)
        .bind(blocked)
        .execute(store.pool())
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Ids of tasks blocking `task_id`.
pub async fn blockers_of(store: &SqliteStore, task_id: &str) -> Result<Vec<String>> {
    store.blockers_of(task_id).await
}

/// Ids of tasks that `task_id` blocks.
pub async fn blocked_by(store: &SqliteStore, task_id: &str) -> Result<Vec<String>> {
    store.blocked_by_task(task_id).await
}

async fn edge_exists(store: &SqliteStore, blocker: &str, blocked: &str) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM dependencies WHERE blocker_id = ? AND blocked_id = ?",
    )
    .bind(blocker)
    .bind(blocked)
    .fetch_one(store.pool())
    .await?;
    Ok(count > 0)
}

/// BFS over blocker -> blocked edges from `from`, looking for `to`. Returns
/// the path when one exists. Covers chains of arbitrary length.
async fn find_path(store: &SqliteStore, from: &str, to: &str) -> Result<Option<Vec<String>>> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<Vec<String>> = VecDeque::new();
    visited.insert(from.to_string());
    queue.push_back(vec![from.to_string()]);

    while let Some(path) = queue.pop_front() {
        let current = path.last().expect("path is never empty").clone();
        let downstream = store.blocked_by_task(&current).await?;
        for next in downstream {
            if next == to {
                let mut found = path.clone();
                found.push(next);
                return Ok(Some(found));
            }
            if visited.insert(next.clone()) {
                let mut extended = path.clone();
                extended.push(next);
                queue.push_back(extended);
            }
        }
    }
    Ok(None)
}
