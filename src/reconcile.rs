//! Reconciliation sweep: detects runs whose owning process is gone, not
//! ours, or stale, and restores consistent state. Each orphan produces a
//! cancelled run, an expired claim and a task reset to a workable status.
//! The sweep is idempotent and isolates per-orphan failures so one bad row
//! never aborts the pass.

use chrono::{Duration as ChronoDuration, Utc};
use std::fs;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::claim;
use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::model::{Run, TaskStatus, WorkerStatus};
use crate::store::SqliteStore;

/// Identity verdict for a recorded pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcIdentity {
    /// No such process.
    Dead,
    /// Process exists and matches the recorded start time.
    AliveMatch,
    /// Process exists but cannot be confirmed as ours (pid reuse or an
    /// unreadable start time). Treated as orphaned without touching the
    /// live process.
    AliveMismatch,
}

/// Seam for process liveness probes, so the sweep is testable without
/// spawning real processes.
pub trait ProcessProbe: Send + Sync {
    /// Classify a pid against the start-time ticks recorded when the run
    /// was created.
    fn identify(&self, pid: i64, recorded_start_ticks: Option<i64>) -> ProcIdentity;

    /// Start-time ticks of the calling process, recorded into new runs.
    fn self_start_ticks(&self) -> Option<i64>;
}

/// Probe backed by /proc. Field 22 of /proc/<pid>/stat is the process start
/// time in clock ticks since boot, which together with the pid identifies a
/// process across pid reuse.
pub struct ProcProbe;

impl ProcProbe {
    fn start_ticks(pid: i64) -> Option<i64> {
        let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        // comm may contain spaces; fields are stable after the closing paren.
        let after = stat.rsplit_once(')')?.1;
        after.split_whitespace().nth(19)?.parse().ok()
    }
}

impl ProcessProbe for ProcProbe {
    fn identify(&self, pid: i64, recorded_start_ticks: Option<i64>) -> ProcIdentity {
        if pid <= 0 {
            return ProcIdentity::Dead;
        }
        if !std::path::Path::new(&format!("/proc/{pid}")).exists() {
            return ProcIdentity::Dead;
        }
        match (Self::start_ticks(pid), recorded_start_ticks) {
            (Some(actual), Some(recorded)) if actual == recorded => ProcIdentity::AliveMatch,
            // Alive but unverifiable ownership: conservative mismatch.
            _ => ProcIdentity::AliveMismatch,
        }
    }

    fn self_start_ticks(&self) -> Option<i64> {
        Self::start_ticks(std::process::id() as i64)
    }
}

/// Statistics from one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepStats {
    pub orphaned_missing_pid: usize,
    pub orphaned_dead: usize,
    pub orphaned_unowned: usize,
    pub orphaned_stale: usize,
    pub leases_expired: usize,
    pub tasks_reset: usize,
    pub workers_marked_dead: usize,
    pub errors: usize,
}

impl SweepStats {
    pub fn changed_anything(&self) -> bool {
        *self != SweepStats::default()
    }
}

/// The reconciliation sweep.
pub struct Reconciler {
    store: Arc<SqliteStore>,
    config: OrchestratorConfig,
    probe: Arc<dyn ProcessProbe>,
}

impl Reconciler {
    pub fn new(
        store: Arc<SqliteStore>,
        config: OrchestratorConfig,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        Self {
            store,
            config,
            probe,
        }
    }

    /// Run one sweep. Transient store failures on a single orphan are logged
    /// and the orphan is left for the next sweep.
    pub async fn sweep(&self) -> Result<SweepStats> {
        let mut stats = SweepStats::default();

        self.sweep_orphaned_runs(&mut stats).await?;
        self.sweep_expired_leases(&mut stats).await?;
        self.sweep_claimless_active_tasks(&mut stats).await?;
        self.sweep_stale_workers(&mut stats).await?;

        if stats.changed_anything() {
            info!(?stats, "reconciliation sweep repaired state");
        } else {
            debug!("reconciliation sweep found nothing to repair");
        }
        Ok(stats)
    }

    async fn sweep_orphaned_runs(&self, stats: &mut SweepStats) -> Result<()> {
        let running = self.store.list_running_runs().await?;
        let stale_cutoff = Utc::now()
            - ChronoDuration::seconds(self.config.run_stale_after.as_secs() as i64);

        for run in running {
            let verdict = self.classify(&run, stale_cutoff);
            let Some((reason, bucket)) = verdict else {
                continue;
            };
            match self.store.cancel_orphaned_run(&run, &reason).await {
                Ok(()) => {
                    warn!(run_id = %run.id, task_id = ?run.task_id, reason, "reconciled orphaned run");
                    match bucket {
                        OrphanBucket::MissingPid => stats.orphaned_missing_pid += 1,
                        OrphanBucket::Dead => stats.orphaned_dead += 1,
                        OrphanBucket::Unowned => stats.orphaned_unowned += 1,
                        OrphanBucket::Stale => stats.orphaned_stale += 1,
                    }
                }
                Err(e) => {
                    error!(run_id = %run.id, error = %e, "failed to reconcile run, will retry next sweep");
                    stats.errors += 1;
                }
            }
        }
        Ok(())
    }

    fn classify(
        &self,
        run: &Run,
        stale_cutoff: chrono::DateTime<Utc>,
    ) -> Option<(String, OrphanBucket)> {
        match run.pid {
            None | Some(0) => Some((
                format!("run {} has no recorded process id", run.id),
                OrphanBucket::MissingPid,
            )),
            Some(pid) => match self.probe.identify(pid, run.proc_started_at) {
                ProcIdentity::Dead => Some((
                    format!("process {pid} for run {} is not alive", run.id),
                    OrphanBucket::Dead,
                )),
                ProcIdentity::AliveMismatch => Some((
                    format!(
                        "process {pid} for run {} is alive but not confirmed as the run's owner",
                        run.id
                    ),
                    OrphanBucket::Unowned,
                )),
                ProcIdentity::AliveMatch if run.started_at < stale_cutoff => Some((
                    format!(
                        "run {} exceeded the staleness threshold (started {})",
                        run.id, run.started_at
                    ),
                    OrphanBucket::Stale,
                )),
                ProcIdentity::AliveMatch => None,
            },
        }
    }

    /// Expire every active claim whose lease has passed.
    async fn sweep_expired_leases(&self, stats: &mut SweepStats) -> Result<()> {
        for expired in claim::get_expired(&self.store).await? {
            match claim::expire(&self.store, &expired.id).await {
                Ok(()) => stats.leases_expired += 1,
                Err(e) => {
                    // Another sweeper or the triad above got there first.
                    debug!(claim_id = %expired.id, error = %e, "claim already transitioned");
                }
            }
        }
        Ok(())
    }

    /// Reset tasks stuck in `Active` with no live claim.
    async fn sweep_claimless_active_tasks(&self, stats: &mut SweepStats) -> Result<()> {
        use sqlx::Row;
        let rows = sqlx::query(
            "SELECT id FROM tasks t
             WHERE t.status = 'active'
               AND NOT EXISTS (SELECT 1 FROM claims c
                               WHERE c.task_id = t.id AND c.status = 'active')",
        )
        .fetch_all(self.store.pool())
        .await?;

        for row in rows {
            let task_id: String = row.try_get("id")?;
            match self.store.update_status(&task_id, TaskStatus::Ready).await {
                Ok(_) => {
                    warn!(task_id = %task_id, "reset claimless active task to ready");
                    stats.tasks_reset += 1;
                }
                Err(e) => {
                    error!(task_id = %task_id, error = %e, "failed to reset task");
                    stats.errors += 1;
                }
            }
        }
        Ok(())
    }

    /// Mark workers with stale heartbeats dead and force-release their
    /// claims.
    async fn sweep_stale_workers(&self, stats: &mut SweepStats) -> Result<()> {
        let cutoff = Utc::now()
            - ChronoDuration::seconds(self.config.worker_stale_after.as_secs().max(1) as i64);
        for worker in self.store.stale_workers(cutoff).await? {
            match self.store.set_worker_status(&worker.id, WorkerStatus::Dead).await {
                Ok(()) => {
                    let released = claim::release_by_worker(&self.store, &worker.id).await?;
                    warn!(worker_id = %worker.id, released, "marked stale worker dead");
                    stats.workers_marked_dead += 1;
                }
                Err(e) => {
                    error!(worker_id = %worker.id, error = %e, "failed to mark worker dead");
                    stats.errors += 1;
                }
            }
        }
        Ok(())
    }
}

enum OrphanBucket {
    MissingPid,
    Dead,
    Unowned,
    Stale,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::test_util::backdate_lease;
    use crate::model::{ClaimStatus, Metadata, RunStatus, Worker};
    use crate::store::test_util::*;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    /// Probe scripted by verdict.
    struct FakeProbe(ProcIdentity);

    impl ProcessProbe for FakeProbe {
        fn identify(&self, _pid: i64, _recorded: Option<i64>) -> ProcIdentity {
            self.0
        }
        fn self_start_ticks(&self) -> Option<i64> {
            Some(1)
        }
    }

    async fn seed_running_run(
        store: &SqliteStore,
        task_id: &str,
        pid: Option<i64>,
    ) -> Run {
        let run = Run {
            id: Uuid::new_v4().to_string(),
            task_id: Some(task_id.to_string()),
            agent: "tester".to_string(),
            pid,
            proc_started_at: Some(1),
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            exit_code: None,
            output_path: None,
            error_message: None,
            metadata: Metadata::new(),
        };
        store.insert_run(&run).await.unwrap();
        run
    }

    fn reconciler(store: Arc<SqliteStore>, verdict: ProcIdentity) -> Reconciler {
        Reconciler::new(
            store,
            OrchestratorConfig::development(),
            Arc::new(FakeProbe(verdict)),
        )
    }

    #[tokio::test]
    async fn test_missing_pid_run_is_reconciled() {
        // Scenario from the claim protocol contract: a running run with pid 0
        // is cancelled with a message naming the missing pid, its claim is
        // expired and its task returns to a workable status.
        let (store, _dir) = open_store().await;
        let store = Arc::new(store);
        let task = seed_task(&store, "t", 0).await;
        claim::claim(&store, &task.id, "w-1", 30).await.unwrap();
        store
            .update_status(&task.id, TaskStatus::Active)
            .await
            .unwrap();
        let run = seed_running_run(&store, &task.id, Some(0)).await;

        let stats = reconciler(store.clone(), ProcIdentity::AliveMatch)
            .sweep()
            .await
            .unwrap();
        assert_eq!(stats.orphaned_missing_pid, 1);

        let run = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.error_message.unwrap().contains("no recorded process id"));

        assert!(claim::get_active_claim(&store, &task.id)
            .await
            .unwrap()
            .is_none());
        let task = store.require_task(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Ready);
    }

    #[tokio::test]
    async fn test_dead_process_run_is_reconciled() {
        let (store, _dir) = open_store().await;
        let store = Arc::new(store);
        let task = seed_task(&store, "t", 0).await;
        claim::claim(&store, &task.id, "w-1", 30).await.unwrap();
        seed_running_run(&store, &task.id, Some(12345)).await;

        let stats = reconciler(store.clone(), ProcIdentity::Dead)
            .sweep()
            .await
            .unwrap();
        assert_eq!(stats.orphaned_dead, 1);
    }

    #[tokio::test]
    async fn test_unowned_live_process_is_conservatively_orphaned() {
        let (store, _dir) = open_store().await;
        let store = Arc::new(store);
        let task = seed_task(&store, "t", 0).await;
        let run = seed_running_run(&store, &task.id, Some(12345)).await;

        let stats = reconciler(store.clone(), ProcIdentity::AliveMismatch)
            .sweep()
            .await
            .unwrap();
        assert_eq!(stats.orphaned_unowned, 1);

        let run = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.error_message.unwrap().contains("not confirmed"));
    }

    #[tokio::test]
    async fn test_healthy_run_is_left_alone_and_sweep_is_idempotent() {
        let (store, _dir) = open_store().await;
        let store = Arc::new(store);
        let task = seed_task(&store, "t", 0).await;
        claim::claim(&store, &task.id, "w-1", 30).await.unwrap();
        let run = seed_running_run(&store, &task.id, Some(std::process::id() as i64)).await;

        let rec = reconciler(store.clone(), ProcIdentity::AliveMatch);
        let stats = rec.sweep().await.unwrap();
        assert!(!stats.changed_anything());

        let run = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(claim::get_active_claim(&store, &task.id)
            .await
            .unwrap()
            .is_some());

        // Second pass with nothing new: no further changes
        let stats = rec.sweep().await.unwrap();
        assert!(!stats.changed_anything());
    }

    #[tokio::test]
    async fn test_stale_run_is_swept_despite_live_process() {
        let (store, _dir) = open_store().await;
        let store = Arc::new(store);
        let task = seed_task(&store, "t", 0).await;
        let run = seed_running_run(&store, &task.id, Some(1)).await;
        // Backdate the run start past run_stale_after (5s in development())
        sqlx::query("UPDATE runs SET started_at = ? WHERE id = ?")
            .bind(crate::store::fmt_ts(Utc::now() - ChronoDuration::hours(1)))
            .bind(&run.id)
            .execute(store.pool())
            .await
            .unwrap();

        let stats = reconciler(store.clone(), ProcIdentity::AliveMatch)
            .sweep()
            .await
            .unwrap();
        assert_eq!(stats.orphaned_stale, 1);
    }

    #[tokio::test]
    async fn test_expired_leases_and_claimless_active_tasks() {
        let (store, _dir) = open_store().await;
        let store = Arc::new(store);

        // An active claim with a past lease
        let t1 = seed_task(&store, "t1", 0).await;
        let c1 = claim::claim(&store, &t1.id, "w-1", 30).await.unwrap();
        backdate_lease(&store, &c1.id, 5).await;

        // An active task with no claim at all
        let t2 = seed_task(&store, "t2", 0).await;
        store.update_status(&t2.id, TaskStatus::Active).await.unwrap();

        let stats = reconciler(store.clone(), ProcIdentity::AliveMatch)
            .sweep()
            .await
            .unwrap();
        assert_eq!(stats.leases_expired, 1);
        assert_eq!(stats.tasks_reset, 1);

        let c1 = claim::get_active_claim(&store, &t1.id).await.unwrap();
        assert!(c1.is_none());
        assert_eq!(
            store.require_task(&t2.id).await.unwrap().status,
            TaskStatus::Ready
        );
    }

    #[tokio::test]
    async fn test_stale_worker_marked_dead_and_claims_released() {
        let (store, _dir) = open_store().await;
        let store = Arc::new(store);
        let task = seed_task(&store, "t", 0).await;

        let worker = Worker {
            id: "w-stale".to_string(),
            host: "localhost".to_string(),
            pid: 1,
            status: WorkerStatus::Busy,
            registered_at: Utc::now() - ChronoDuration::hours(1),
            last_heartbeat_at: Utc::now() - ChronoDuration::hours(1),
            capabilities: vec![],
            metadata: Metadata::new(),
        };
        store.insert_worker(&worker).await.unwrap();
        claim::claim(&store, &task.id, "w-stale", 30).await.unwrap();

        let stats = reconciler(store.clone(), ProcIdentity::AliveMatch)
            .sweep()
            .await
            .unwrap();
        assert_eq!(stats.workers_marked_dead, 1);

        let worker = store.get_worker("w-stale").await.unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Dead);
        let released = claim::get_active_claim(&store, &task.id).await.unwrap();
        assert!(released.is_none());
        let row: String =
            sqlx::query_scalar("SELECT status FROM claims WHERE worker_id = 'w-stale'")
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(ClaimStatus::parse(&row).unwrap(), ClaimStatus::Released);
    }
}
