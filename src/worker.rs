//! Worker pool and orchestrator loop. Each worker loop polls the ready set,
//! races for a claim, records a run and drives the execution hook, renewing
//! its lease while the hook is in flight. The orchestrator owns the pool plus
//! the heartbeat and reconciliation tickers and coordinates shutdown over a
//! watch channel.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::claim;
use crate::config::OrchestratorConfig;
use crate::error::{GantryError, Result};
use crate::model::{Metadata, Run, RunStatus, Task, TaskStatus, Worker, WorkerStatus};
use crate::ready;
use crate::reconcile::{ProcProbe, ProcessProbe, Reconciler};
use crate::store::SqliteStore;

/// Shared state handed to the execution hook for one unit of work.
pub struct WorkContext {
    pub task_id: String,
    pub worker_id: String,
    pub run_id: String,
    /// Caller-supplied values, passed through to every hook unmodified.
    pub values: Metadata,
    /// Scratch space for the hook, keyed by name.
    scratch: DashMap<String, Value>,
}

impl WorkContext {
    fn new(task_id: &str, worker_id: &str, run_id: &str, values: Metadata) -> Self {
        Self {
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
            run_id: run_id.to_string(),
            values,
            scratch: DashMap::new(),
        }
    }

    pub fn insert_value(&self, key: impl Into<String>, value: Value) {
        self.scratch.insert(key.into(), value);
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.scratch.get(key).map(|v| v.clone())
    }
}

/// Result of one hook execution.
#[derive(Debug, Clone, Default)]
pub struct HookOutcome {
    pub success: bool,
    pub exit_code: Option<i64>,
    pub output_path: Option<String>,
    pub error_message: Option<String>,
    /// Status the task should land in. Defaults to `Done` on success and
    /// `Blocked` on failure.
    pub task_status: Option<TaskStatus>,
}

impl HookOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            ..Default::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: Some(1),
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_task_status(mut self, status: TaskStatus) -> Self {
        self.task_status = Some(status);
        self
    }

    pub fn with_output_path(mut self, path: impl Into<String>) -> Self {
        self.output_path = Some(path.into());
        self
    }
}

/// The seam where callers plug in actual work: spawning an agent, running a
/// build, calling out to a service. The orchestrator handles claims, runs and
/// task status; the hook only does the work.
#[async_trait]
pub trait ExecutionHook: Send + Sync {
    async fn execute(&self, task: Task, ctx: Arc<WorkContext>) -> anyhow::Result<HookOutcome>;
}

/// Registration and liveness for worker identities.
pub struct WorkerRegistry {
    store: Arc<SqliteStore>,
}

impl WorkerRegistry {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }

    /// Register a worker identity, replacing any previous registration under
    /// the same id.
    pub async fn register(&self, worker_id: &str, capabilities: Vec<String>) -> Result<Worker> {
        let now = Utc::now();
        let worker = Worker {
            id: worker_id.to_string(),
            host: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            pid: std::process::id() as i64,
            status: WorkerStatus::Idle,
            registered_at: now,
            last_heartbeat_at: now,
            capabilities,
            metadata: Metadata::new(),
        };
        self.store.insert_worker(&worker).await?;
        info!(worker_id, "registered worker");
        Ok(worker)
    }

    pub async fn heartbeat(&self, worker_id: &str) -> Result<()> {
        self.store.heartbeat_worker(worker_id).await
    }

    /// Deregister a worker: release everything it holds, then drop the row.
    pub async fn deregister(&self, worker_id: &str) -> Result<()> {
        let released = claim::release_by_worker(&self.store, worker_id).await?;
        self.store.delete_worker(worker_id).await?;
        info!(worker_id, released, "deregistered worker");
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<Worker>> {
        self.store.list_workers().await
    }
}

/// How many ready tasks a worker considers per poll before conceding the
/// round. Claim conflicts make it skip to the next candidate.
const CLAIM_CANDIDATES: i64 = 16;

enum HookDrive {
    Finished(anyhow::Result<HookOutcome>),
    Aborted,
}

/// One worker poll: fetch ready candidates, race for a claim, execute the
/// first win. Returns whether any work was performed.
pub(crate) async fn run_one(
    store: &SqliteStore,
    config: &OrchestratorConfig,
    hook: &Arc<dyn ExecutionHook>,
    probe: &Arc<dyn ProcessProbe>,
    worker_id: &str,
    values: &Metadata,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<bool> {
    let candidates = ready::get_ready(store, Some(CLAIM_CANDIDATES)).await?;
    for task in candidates {
        match claim::claim(store, &task.id, worker_id, config.lease_minutes).await {
            Ok(_) => {
                execute_claimed(store, config, hook, probe, worker_id, values, task, shutdown)
                    .await?;
                return Ok(true);
            }
            // Lost the race for this one; try the next candidate.
            Err(GantryError::AlreadyClaimed { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(false)
}

async fn execute_claimed(
    store: &SqliteStore,
    config: &OrchestratorConfig,
    hook: &Arc<dyn ExecutionHook>,
    probe: &Arc<dyn ProcessProbe>,
    worker_id: &str,
    values: &Metadata,
    task: Task,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let task_id = task.id.clone();
    store.update_status(&task_id, TaskStatus::Active).await?;
    let _ = store.set_worker_status(worker_id, WorkerStatus::Busy).await;

    let run = Run {
        id: Uuid::new_v4().to_string(),
        task_id: Some(task_id.clone()),
        agent: worker_id.to_string(),
        pid: Some(std::process::id() as i64),
        proc_started_at: probe.self_start_ticks(),
        status: RunStatus::Running,
        started_at: Utc::now(),
        ended_at: None,
        exit_code: None,
        output_path: None,
        error_message: None,
        metadata: Metadata::new(),
    };
    store.insert_run(&run).await?;

    let ctx = Arc::new(WorkContext::new(&task_id, worker_id, &run.id, values.clone()));
    debug!(task_id = %task_id, worker_id, run_id = %run.id, "executing task");

    let drive = drive_hook(store, config, hook, worker_id, task, ctx, shutdown).await;
    let finish = match drive {
        HookDrive::Finished(Ok(outcome)) if outcome.success => (
            RunStatus::Completed,
            outcome.exit_code,
            outcome.error_message,
            outcome.output_path,
            outcome.task_status.unwrap_or(TaskStatus::Done),
        ),
        HookDrive::Finished(Ok(outcome)) => (
            RunStatus::Failed,
            outcome.exit_code,
            outcome.error_message,
            outcome.output_path,
            outcome.task_status.unwrap_or(TaskStatus::Blocked),
        ),
        HookDrive::Finished(Err(e)) => {
            warn!(task_id = %task_id, error = %e, "hook execution failed");
            (
                RunStatus::Failed,
                None,
                Some(e.to_string()),
                None,
                TaskStatus::Blocked,
            )
        }
        HookDrive::Aborted => (
            RunStatus::Cancelled,
            None,
            Some("abandoned on shutdown".to_string()),
            None,
            TaskStatus::Ready,
        ),
    };
    let (run_status, exit_code, error_message, output_path, task_status) = finish;

    store
        .finish_work(
            &run.id,
            &task_id,
            worker_id,
            run_status,
            exit_code,
            error_message,
            output_path,
            task_status,
        )
        .await?;
    let _ = store.set_worker_status(worker_id, WorkerStatus::Idle).await;
    Ok(())
}

/// Drive the hook future, renewing the lease at half-life while it runs. A
/// renewal failure is logged and left for the sweep rather than aborting work
/// already in progress.
async fn drive_hook(
    store: &SqliteStore,
    config: &OrchestratorConfig,
    hook: &Arc<dyn ExecutionHook>,
    worker_id: &str,
    task: Task,
    ctx: Arc<WorkContext>,
    shutdown: &mut watch::Receiver<bool>,
) -> HookDrive {
    let renew_every = Duration::from_secs(((config.lease_minutes * 60) / 2).max(1) as u64);
    let mut renew = tokio::time::interval(renew_every);
    renew.tick().await;

    let task_id = task.id.clone();
    let exec = hook.execute(task, ctx);
    tokio::pin!(exec);
    loop {
        tokio::select! {
            result = &mut exec => return HookDrive::Finished(result),
            _ = renew.tick() => {
                if let Err(e) = claim::renew(
                    store, &task_id, worker_id, config.lease_minutes, config.max_renewals,
                ).await
                {
                    warn!(task_id = %task_id, worker_id, error = %e, "lease renewal failed");
                }
            }
            _ = shutdown.changed(), if config.abandon_inflight_on_shutdown => {
                return HookDrive::Aborted;
            }
        }
    }
}

async fn worker_loop(
    store: Arc<SqliteStore>,
    config: OrchestratorConfig,
    hook: Arc<dyn ExecutionHook>,
    probe: Arc<dyn ProcessProbe>,
    worker_id: String,
    values: Metadata,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        match run_one(&store, &config, &hook, &probe, &worker_id, &values, &mut shutdown).await {
            Ok(true) => {}
            Ok(false) => {
                tokio::select! {
                    _ = tokio::time::sleep(config.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "worker poll failed");
                tokio::time::sleep(config.poll_interval).await;
            }
        }
    }
    debug!(worker_id = %worker_id, "worker loop exited");
}

/// Owns the worker pool and its background tickers.
pub struct Orchestrator {
    store: Arc<SqliteStore>,
    config: OrchestratorConfig,
    hook: Arc<dyn ExecutionHook>,
    probe: Arc<dyn ProcessProbe>,
    registry: WorkerRegistry,
    context: Metadata,
    worker_ids: Vec<String>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<SqliteStore>,
        config: OrchestratorConfig,
        hook: Arc<dyn ExecutionHook>,
    ) -> Result<Self> {
        Self::with_probe(store, config, hook, Arc::new(ProcProbe))
    }

    pub fn with_probe(
        store: Arc<SqliteStore>,
        config: OrchestratorConfig,
        hook: Arc<dyn ExecutionHook>,
        probe: Arc<dyn ProcessProbe>,
    ) -> Result<Self> {
        config.validate().map_err(GantryError::validation)?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            registry: WorkerRegistry::new(store.clone()),
            store,
            config,
            hook,
            probe,
            context: Metadata::new(),
            worker_ids: Vec::new(),
            shutdown_tx,
            handles: Vec::new(),
        })
    }

    /// Values handed through to every execution hook, unmodified.
    pub fn with_context(mut self, values: Metadata) -> Self {
        self.context = values;
        self
    }

    /// Register the worker identities and spawn the pool plus the heartbeat
    /// and reconciliation tickers.
    pub async fn start(&mut self) -> Result<()> {
        let base = format!("w-{}-{}", std::process::id(), &Uuid::new_v4().to_string()[..8]);
        for i in 0..self.config.pool_size {
            let worker_id = format!("{base}-{i}");
            self.registry.register(&worker_id, Vec::new()).await?;
            self.handles.push(tokio::spawn(worker_loop(
                self.store.clone(),
                self.config.clone(),
                self.hook.clone(),
                self.probe.clone(),
                worker_id.clone(),
                self.context.clone(),
                self.shutdown_tx.subscribe(),
            )));
            self.worker_ids.push(worker_id);
        }

        self.handles.push(tokio::spawn(heartbeat_loop(
            self.store.clone(),
            self.worker_ids.clone(),
            self.config.heartbeat_interval,
            self.shutdown_tx.subscribe(),
        )));

        if !self.config.sweep_interval.is_zero() {
            self.handles.push(tokio::spawn(sweep_loop(
                Reconciler::new(self.store.clone(), self.config.clone(), self.probe.clone()),
                self.config.sweep_interval,
                self.shutdown_tx.subscribe(),
            )));
        }

        info!(pool_size = self.config.pool_size, "orchestrator started");
        Ok(())
    }

    /// Stop the pool: signal every loop, wait for them, deregister the
    /// workers.
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        for worker_id in &self.worker_ids {
            self.registry.deregister(worker_id).await?;
        }
        info!("orchestrator stopped");
        Ok(())
    }
}

async fn heartbeat_loop(
    store: Arc<SqliteStore>,
    worker_ids: Vec<String>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                for worker_id in &worker_ids {
                    if let Err(e) = store.heartbeat_worker(worker_id).await {
                        warn!(worker_id = %worker_id, error = %e, "heartbeat failed");
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn sweep_loop(
    reconciler: Reconciler,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(interval);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Err(e) = reconciler.sweep().await {
                    error!(error = %e, "reconciliation sweep failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
