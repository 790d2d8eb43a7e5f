//! Ready-state computation: pure read-side queries, recomputed on every call
//! since task and edge state change independently underneath.

use crate::error::Result;
use crate::model::Task;
use crate::store::SqliteStore;

/// Tagged readiness result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Blocked { open_blockers: Vec<String> },
}

/// A task is ready iff its status is workable and every blocker edge
/// pointing at it references a `Done` task. A blocker edge whose task row is
/// missing counts as open.
pub async fn is_ready(store: &SqliteStore, task_id: &str) -> Result<Readiness> {
    let task = store.require_task(task_id).await?;
    let open_blockers = open_blockers(store, task_id).await?;
    if task.status.is_workable() && open_blockers.is_empty() {
        Ok(Readiness::Ready)
    } else {
        Ok(Readiness::Blocked { open_blockers })
    }
}

/// All ready tasks ordered by score descending, with creation order then id
/// as the stable tiebreak, optionally capped at `limit`.
pub async fn get_ready(store: &SqliteStore, limit: Option<i64>) -> Result<Vec<Task>> {
    let limit = limit.unwrap_or(-1);
    let rows = sqlx::query(
        "SELECT id, title, description, status, parent_id, score, metadata,
                created_at, updated_at, completed_at
         FROM tasks t
         WHERE t.status NOT IN ('done', 'active')
           AND NOT EXISTS (
               SELECT 1 FROM dependencies d
               LEFT JOIN tasks b ON b.id = d.blocker_id
               WHERE d.blocked_id = t.id
                 AND (b.status IS NULL OR b.status != 'done'))
         ORDER BY t.score DESC, t.created_at ASC, t.id ASC
         LIMIT ?",
    )
    .bind(limit)
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(SqliteStore::row_to_task).collect()
}

async fn open_blockers(store: &SqliteStore, task_id: &str) -> Result<Vec<String>> {
    let rows = sqlx::query(
        "SELECT d.blocker_id FROM dependencies d
         LEFT JOIN tasks b ON b.id = d.blocker_id
         WHERE d.blocked_id = ?
           AND (b.status IS NULL OR b.status != 'done')
         ORDER BY d.blocker_id",
    )
    .bind(task_id)
    .fetch_all(store.pool())
    .await?;
    use sqlx::Row;
    rows.iter()
        .map(|r| r.try_get("blocker_id").map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::add_blocker;
    use crate::model::TaskStatus;
    use crate::store::test_util::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_task_with_no_blockers_is_ready() {
        let (store, _dir) = open_store().await;
        let a = seed_task(&store, "a", 0).await;
        assert_eq!(is_ready(&store, &a.id).await.unwrap(), Readiness::Ready);
    }

    #[tokio::test]
    async fn test_open_blocker_gates_readiness() {
        let (store, _dir) = open_store().await;
        let a = seed_task(&store, "a", 0).await;
        let b = seed_task(&store, "b", 0).await;
        add_blocker(&store, &b.id, &a.id).await.unwrap();

        match is_ready(&store, &b.id).await.unwrap() {
            Readiness::Blocked { open_blockers } => assert_eq!(open_blockers, vec![a.id.clone()]),
            other => panic!("expected blocked, got {other:?}"),
        }

        store.update_status(&a.id, TaskStatus::Done).await.unwrap();
        assert_eq!(is_ready(&store, &b.id).await.unwrap(), Readiness::Ready);
    }

    #[tokio::test]
    async fn test_done_task_is_never_ready() {
        let (store, _dir) = open_store().await;
        let a = seed_task(&store, "a", 0).await;
        store.update_status(&a.id, TaskStatus::Done).await.unwrap();
        assert!(matches!(
            is_ready(&store, &a.id).await.unwrap(),
            Readiness::Blocked { .. }
        ));
    }

    #[tokio::test]
    async fn test_get_ready_score_ordering_scenario() {
        // Task A has no blockers (score 800), B is blocked by A (score 600).
        let (store, _dir) = open_store().await;
        let a = seed_task(&store, "a", 800).await;
        let b = seed_task(&store, "b", 600).await;
        add_blocker(&store, &b.id, &a.id).await.unwrap();

        let ready: Vec<String> = get_ready(&store, None)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ready, vec![a.id.clone()]);

        store.update_status(&a.id, TaskStatus::Done).await.unwrap();
        let ready: Vec<String> = get_ready(&store, None)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ready, vec![b.id.clone()]);
    }

    #[tokio::test]
    async fn test_get_ready_orders_by_score_and_caps_at_limit() {
        let (store, _dir) = open_store().await;
        let low = seed_task(&store, "low", 100).await;
        let high = seed_task(&store, "high", 900).await;
        let mid = seed_task(&store, "mid", 500).await;

        let ready: Vec<String> = get_ready(&store, None)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ready, vec![high.id.clone(), mid.id.clone(), low.id.clone()]);

        let capped = get_ready(&store, Some(2)).await.unwrap();
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[0].id, high.id);
    }

    #[tokio::test]
    async fn test_active_task_is_not_offered() {
        let (store, _dir) = open_store().await;
        let a = seed_task(&store, "a", 0).await;
        store.update_status(&a.id, TaskStatus::Active).await.unwrap();
        assert!(get_ready(&store, None).await.unwrap().is_empty());
    }
}
