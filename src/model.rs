use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{GantryError, Result};

/// Free-form metadata attached to tasks, workers and runs.
///
/// Kept as an explicit string-keyed map with JSON values so the schema
/// boundary at the store layer stays visible.
pub type Metadata = BTreeMap<String, Value>;

/// Task workflow status. `Done` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Backlog,
    Ready,
    Planning,
    Active,
    Blocked,
    Review,
    HumanReview,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::Ready => "ready",
            TaskStatus::Planning => "planning",
            TaskStatus::Active => "active",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Review => "review",
            TaskStatus::HumanReview => "human-review",
            TaskStatus::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "backlog" => Ok(TaskStatus::Backlog),
            "ready" => Ok(TaskStatus::Ready),
            "planning" => Ok(TaskStatus::Planning),
            "active" => Ok(TaskStatus::Active),
            "blocked" => Ok(TaskStatus::Blocked),
            "review" => Ok(TaskStatus::Review),
            "human-review" => Ok(TaskStatus::HumanReview),
            "done" => Ok(TaskStatus::Done),
            other => Err(GantryError::validation(format!(
                "unknown task status: {other}"
            ))),
        }
    }

    /// Statuses eligible for claiming. A done task is never workable, and a
    /// task already being worked (`Active`) is not offered again.
    pub fn is_workable(&self) -> bool {
        !matches!(self, TaskStatus::Done | TaskStatus::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done)
    }
}

/// A unit of work in the dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub parent_id: Option<String>,
    pub score: i64,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Specification for creating a new task.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub status: Option<TaskStatus>,
    pub parent_id: Option<String>,
    pub score: i64,
    pub metadata: Metadata,
}

impl Task {
    /// Create a task from a specification, minting a fresh id.
    pub fn from_spec(spec: NewTask) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: spec.title,
            description: spec.description,
            status: spec.status.unwrap_or(TaskStatus::Backlog),
            parent_id: spec.parent_id,
            score: spec.score,
            metadata: spec.metadata,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// One task plus the dependency information every task-returning call must
/// expose: blocker ids, blocked ids, child ids and the computed ready flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDetail {
    pub task: Task,
    pub blocked_by: Vec<String>,
    pub blocks: Vec<String>,
    pub children: Vec<String>,
    pub is_ready: bool,
}

/// A directed blocker edge: `blocker_id` must reach `Done` before
/// `blocked_id` is workable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub blocker_id: String,
    pub blocked_id: String,
    pub created_at: DateTime<Utc>,
}

/// Claim lifecycle: `Active` transitions to `Released` or `Expired`, both of
/// which are immutable history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    Active,
    Released,
    Expired,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimStatus::Active => "active",
            ClaimStatus::Released => "released",
            ClaimStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(ClaimStatus::Active),
            "released" => Ok(ClaimStatus::Released),
            "expired" => Ok(ClaimStatus::Expired),
            other => Err(GantryError::validation(format!(
                "unknown claim status: {other}"
            ))),
        }
    }
}

/// An exclusive, leased assignment of one task to one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub id: String,
    pub task_id: String,
    pub worker_id: String,
    pub status: ClaimStatus,
    pub claimed_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
    pub renewed_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Dead,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(WorkerStatus::Idle),
            "busy" => Ok(WorkerStatus::Busy),
            "dead" => Ok(WorkerStatus::Dead),
            other => Err(GantryError::validation(format!(
                "unknown worker status: {other}"
            ))),
        }
    }
}

/// A registered worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub host: String,
    pub pid: i64,
    pub status: WorkerStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub capabilities: Vec<String>,
    pub metadata: Metadata,
}

/// Run terminal states. Everything past `Running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Timeout => "timeout",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "timeout" => Ok(RunStatus::Timeout),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(GantryError::validation(format!(
                "unknown run status: {other}"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// One execution attempt of a task by a worker.
///
/// `proc_started_at` records the process start-time ticks captured alongside
/// the pid, so the reconciliation sweep can tell a live owner apart from an
/// unrelated process that reused the pid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub task_id: Option<String>,
    pub agent: String,
    pub pid: Option<i64>,
    pub proc_started_at: Option<i64>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub output_path: Option<String>,
    pub error_message: Option<String>,
    pub metadata: Metadata,
}

/// Operation-log format version written by this build.
pub const LOG_FORMAT_VERSION: u32 = 1;

/// Operation kinds in the sync log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOp {
    #[serde(rename = "upsert")]
    Upsert,
    #[serde(rename = "delete")]
    Delete,
    #[serde(rename = "dependency-add")]
    DependencyAdd,
    #[serde(rename = "dependency-remove")]
    DependencyRemove,
}

/// One serialized change in the operation log. One JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub v: u32,
    pub op: LogOp,
    pub ts: DateTime<Utc>,
    pub id: String,
    pub payload: Value,
}

/// Task fields carried in an `upsert` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTaskFields {
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub parent_id: Option<String>,
    pub score: i64,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Blocker/blocked pair carried in dependency payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogDependencyFields {
    pub blocker_id: String,
    pub blocked_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            TaskStatus::Backlog,
            TaskStatus::Ready,
            TaskStatus::Planning,
            TaskStatus::Active,
            TaskStatus::Blocked,
            TaskStatus::Review,
            TaskStatus::HumanReview,
            TaskStatus::Done,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(TaskStatus::parse("nope").is_err());
    }

    #[test]
    fn test_workable_subset() {
        assert!(TaskStatus::Backlog.is_workable());
        assert!(TaskStatus::Ready.is_workable());
        assert!(!TaskStatus::Active.is_workable());
        assert!(!TaskStatus::Done.is_workable());
        assert!(TaskStatus::Done.is_terminal());
    }

    #[test]
    fn test_log_entry_wire_format() {
        let entry = LogEntry {
            v: LOG_FORMAT_VERSION,
            op: LogOp::DependencyAdd,
            ts: Utc::now(),
            id: "a->b".to_string(),
            payload: serde_json::json!({"blocker_id": "a", "blocked_id": "b"}),
        };
        let line = serde_json::to_string(&entry).unwrap();
        assert!(line.contains("\"dependency-add\""));
        let back: LogEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(back.op, LogOp::DependencyAdd);
        assert_eq!(back.id, "a->b");
    }

    #[test]
    fn test_task_from_spec_defaults() {
        let task = Task::from_spec(NewTask {
            title: "build".to_string(),
            score: 500,
            ..Default::default()
        });
        assert_eq!(task.status, TaskStatus::Backlog);
        assert_eq!(task.score, 500);
        assert!(task.completed_at.is_none());
        assert!(!task.id.is_empty());
    }
}
