//! Atomic claim/lease protocol. The at-most-one-active-claim-per-task
//! invariant is the central correctness property: acquisition is a single
//! guarded INSERT evaluated inside the store's own transaction, backed by a
//! partial unique index, never a read followed by a write.

use chrono::{Duration, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{GantryError, Result};
use crate::model::Claim;
use crate::store::{fmt_ts, SqliteStore};

/// Claim a task for a worker with a lease of `lease_minutes`.
///
/// The existence check and insert are one statement, so concurrent callers
/// for the same task are totally ordered by the store: exactly one wins, the
/// rest get `AlreadyClaimed` carrying the winner's worker id.
pub async fn claim(
    store: &SqliteStore,
    task_id: &str,
    worker_id: &str,
    lease_minutes: i64,
) -> Result<Claim> {
    if lease_minutes <= 0 {
        return Err(GantryError::validation(format!(
            "lease duration must be positive, got {lease_minutes}"
        )));
    }
    store.require_task(task_id).await?;

    let now = Utc::now();
    let expires = now + Duration::minutes(lease_minutes);
    let claim_id = Uuid::new_v4().to_string();

    let inserted = sqlx::query(
        "INSERT INTO claims (id, task_id, worker_id, status, claimed_at, lease_expires_at, renewed_count)
         SELECT ?, ?, ?, 'active', ?, ?, 0
         WHERE NOT EXISTS (SELECT 1 FROM claims WHERE task_id = ? AND status = 'active')",
    )
    .bind(&claim_id)
    .bind(task_id)
    .bind(worker_id)
    .bind(fmt_ts(now))
    .bind(fmt_ts(expires))
    .bind(task_id)
    .execute(store.pool())
    .await;

    let conflicted = match inserted {
        Ok(result) => result.rows_affected() == 0,
        // The partial unique index backstops the guard: a concurrent insert
        // that slipped past the NOT EXISTS surfaces as a unique violation.
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => true,
        Err(e) => return Err(e.into()),
    };

    if conflicted {
        let holder = get_active_claim(store, task_id)
            .await?
            .map(|c| c.worker_id)
            .unwrap_or_else(|| "unknown".to_string());
        return Err(GantryError::AlreadyClaimed {
            task_id: task_id.to_string(),
            holder,
        });
    }

    debug!(task_id, worker_id, claim_id = %claim_id, "claimed task");
    Ok(Claim {
        id: claim_id,
        task_id: task_id.to_string(),
        worker_id: worker_id.to_string(),
        status: crate::model::ClaimStatus::Active,
        claimed_at: now,
        lease_expires_at: expires,
        renewed_count: 0,
    })
}

/// Renew the lease on an active claim owned by `worker_id`.
pub async fn renew(
    store: &SqliteStore,
    task_id: &str,
    worker_id: &str,
    extend_minutes: i64,
    max_renewals: u32,
) -> Result<Claim> {
    let current = get_active_claim(store, task_id).await?;
    let Some(current) = current.filter(|c| c.worker_id == worker_id) else {
        return Err(GantryError::ClaimNotFound {
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
        });
    };

    let now = Utc::now();
    if now > current.lease_expires_at {
        return Err(GantryError::LeaseExpired {
            task_id: task_id.to_string(),
            expired_at: fmt_ts(current.lease_expires_at),
        });
    }
    if current.renewed_count >= max_renewals as i64 {
        return Err(GantryError::MaxRenewalsExceeded {
            task_id: task_id.to_string(),
            max: max_renewals,
        });
    }

    let new_expiry = now + Duration::minutes(extend_minutes);
    let result = sqlx::query(
        "UPDATE claims SET lease_expires_at = ?, renewed_count = renewed_count + 1
         WHERE id = ? AND status = 'active'",
    )
    .bind(fmt_ts(new_expiry))
    .bind(&current.id)
    .execute(store.pool())
    .await?;
    if result.rows_affected() == 0 {
        // Expired or released between the read and the update.
        return Err(GantryError::ClaimNotFound {
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
        });
    }

    debug!(task_id, worker_id, renewed = current.renewed_count + 1, "renewed lease");
    Ok(Claim {
        lease_expires_at: new_expiry,
        renewed_count: current.renewed_count + 1,
        ..current
    })
}

/// Release an active claim. Ownership is strict: a worker can never release
/// another worker's claim.
pub async fn release(store: &SqliteStore, task_id: &str, worker_id: &str) -> Result<()> {
    let result = sqlx::query(
        "UPDATE claims SET status = 'released'
         WHERE task_id = ? AND worker_id = ? AND status = 'active'",
    )
    .bind(task_id)
    .bind(worker_id)
    .execute(store.pool())
    .await?;
    if result.rows_affected() == 0 {
        return Err(GantryError::ClaimNotFound {
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
        });
    }
    debug!(task_id, worker_id, "released claim");
    Ok(())
}

/// The active claim on a task, if any.
pub async fn get_active_claim(store: &SqliteStore, task_id: &str) -> Result<Option<Claim>> {
    let row = sqlx::query("SELECT * FROM claims WHERE task_id = ? AND status = 'active'")
        .bind(task_id)
        .fetch_optional(store.pool())
        .await?;
    row.as_ref().map(SqliteStore::row_to_claim).transpose()
}

/// All active claims whose lease has passed.
pub async fn get_expired(store: &SqliteStore) -> Result<Vec<Claim>> {
    let rows = sqlx::query(
        "SELECT * FROM claims WHERE status = 'active' AND lease_expires_at < ?
         ORDER BY lease_expires_at ASC",
    )
    .bind(fmt_ts(Utc::now()))
    .fetch_all(store.pool())
    .await?;
    rows.iter().map(SqliteStore::row_to_claim).collect()
}

/// Transition one claim from active to expired. Expired claims are immutable
/// history and the task becomes reclaimable.
pub async fn expire(store: &SqliteStore, claim_id: &str) -> Result<()> {
    let result = sqlx::query("UPDATE claims SET status = 'expired' WHERE id = ? AND status = 'active'")
        .bind(claim_id)
        .execute(store.pool())
        .await?;
    if result.rows_affected() == 0 {
        return Err(GantryError::NotFound {
            kind: "claim",
            id: claim_id.to_string(),
        });
    }
    warn!(claim_id, "expired claim");
    Ok(())
}

/// Release every active claim owned by a worker. Used on deregistration and
/// when a worker is declared dead. Returns the number released.
pub async fn release_by_worker(store: &SqliteStore, worker_id: &str) -> Result<u64> {
    let result =
        sqlx::query("UPDATE claims SET status = 'released' WHERE worker_id = ? AND status = 'active'")
            .bind(worker_id)
            .execute(store.pool())
            .await?;
    let count = result.rows_affected();
    if count > 0 {
        debug!(worker_id, count, "released claims in bulk");
    }
    Ok(count)
}


#[cfg(test)]
mod tests {
    use super::test_util::backdate_lease;
    use super::*;
    use crate::model::ClaimStatus;
    use crate::store::test_util::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_claim_and_conflict_carries_holder() {
        let (store, _dir) = open_store().await;
        let task = seed_task(&store, "t", 0).await;

        let won = claim(&store, &task.id, "w-1", 30).await.unwrap();
        assert_eq!(won.renewed_count, 0);
        assert!(won.lease_expires_at > won.claimed_at);

        let err = claim(&store, &task.id, "w-2", 30).await;
        match err {
            Err(GantryError::AlreadyClaimed { holder, .. }) => assert_eq!(holder, "w-1"),
            other => panic!("expected AlreadyClaimed, got {other:?}"),
        }

        let active = get_active_claim(&store, &task.id).await.unwrap().unwrap();
        assert_eq!(active.worker_id, "w-1");
        assert_eq!(active.status, ClaimStatus::Active);
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        // 5 workers race claim() on the same task: exactly 1 winner, 4
        // AlreadyClaimed, one active row.
        let (store, _dir) = open_store().await;
        let store = Arc::new(store);
        let task = seed_task(&store, "tx-1", 0).await;

        let mut handles = Vec::new();
        for i in 0..5 {
            let store = store.clone();
            let task_id = task.id.clone();
            handles.push(tokio::spawn(async move {
                claim(&store, &task_id, &format!("w-{i}"), 30).await
            }));
        }
        let results = futures::future::join_all(handles).await;

        let mut winners = 0;
        let mut conflicts = 0;
        for res in results {
            match res.unwrap() {
                Ok(_) => winners += 1,
                Err(GantryError::AlreadyClaimed { .. }) => conflicts += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(conflicts, 4);

        let active_rows: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM claims WHERE task_id = ? AND status = 'active'",
        )
        .bind(&task.id)
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(active_rows, 1);

        let winner = get_active_claim(&store, &task.id).await.unwrap().unwrap();
        assert!(winner.worker_id.starts_with("w-"));
    }

    #[tokio::test]
    async fn test_renew_extends_and_counts() {
        let (store, _dir) = open_store().await;
        let task = seed_task(&store, "t", 0).await;
        let first = claim(&store, &task.id, "w-1", 30).await.unwrap();

        let renewed = renew(&store, &task.id, "w-1", 30, 3).await.unwrap();
        assert_eq!(renewed.renewed_count, 1);
        assert!(renewed.lease_expires_at >= first.lease_expires_at);

        // Renewal by a non-owner is a ClaimNotFound, not a silent no-op
        assert!(matches!(
            renew(&store, &task.id, "w-2", 30, 3).await,
            Err(GantryError::ClaimNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_renew_respects_cap_and_expiry() {
        let (store, _dir) = open_store().await;
        let task = seed_task(&store, "t", 0).await;
        let c = claim(&store, &task.id, "w-1", 30).await.unwrap();

        renew(&store, &task.id, "w-1", 30, 2).await.unwrap();
        renew(&store, &task.id, "w-1", 30, 2).await.unwrap();
        assert!(matches!(
            renew(&store, &task.id, "w-1", 30, 2).await,
            Err(GantryError::MaxRenewalsExceeded { max: 2, .. })
        ));

        backdate_lease(&store, &c.id, 10).await;
        assert!(matches!(
            renew(&store, &task.id, "w-1", 30, 99).await,
            Err(GantryError::LeaseExpired { .. })
        ));
    }

    #[tokio::test]
    async fn test_release_ownership_is_strict() {
        let (store, _dir) = open_store().await;
        let task = seed_task(&store, "t", 0).await;
        claim(&store, &task.id, "w-1", 30).await.unwrap();

        assert!(matches!(
            release(&store, &task.id, "w-2").await,
            Err(GantryError::ClaimNotFound { .. })
        ));
        // Claim still active and owned by the original worker
        let active = get_active_claim(&store, &task.id).await.unwrap().unwrap();
        assert_eq!(active.worker_id, "w-1");

        release(&store, &task.id, "w-1").await.unwrap();
        assert!(get_active_claim(&store, &task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_lease_flow() {
        let (store, _dir) = open_store().await;
        let task = seed_task(&store, "t", 0).await;
        let c = claim(&store, &task.id, "w-1", 30).await.unwrap();

        assert!(get_expired(&store).await.unwrap().is_empty());
        backdate_lease(&store, &c.id, 5).await;

        let expired = get_expired(&store).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, c.id);

        expire(&store, &c.id).await.unwrap();
        assert!(get_expired(&store).await.unwrap().is_empty());
        assert!(get_active_claim(&store, &task.id).await.unwrap().is_none());

        // Expired claims are history: expiring again fails
        assert!(matches!(
            expire(&store, &c.id).await,
            Err(GantryError::NotFound { .. })
        ));

        // Task is reclaimable after expiry
        claim(&store, &task.id, "w-2", 30).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_by_worker_counts() {
        let (store, _dir) = open_store().await;
        let t1 = seed_task(&store, "t1", 0).await;
        let t2 = seed_task(&store, "t2", 0).await;
        let t3 = seed_task(&store, "t3", 0).await;
        claim(&store, &t1.id, "w-1", 30).await.unwrap();
        claim(&store, &t2.id, "w-1", 30).await.unwrap();
        claim(&store, &t3.id, "w-2", 30).await.unwrap();

        assert_eq!(release_by_worker(&store, "w-1").await.unwrap(), 2);
        assert_eq!(release_by_worker(&store, "w-1").await.unwrap(), 0);
        assert!(get_active_claim(&store, &t3.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_claim_missing_task() {
        let (store, _dir) = open_store().await;
        assert!(matches!(
            claim(&store, "ghost", "w-1", 30).await,
            Err(GantryError::NotFound { .. })
        ));
    }
}
