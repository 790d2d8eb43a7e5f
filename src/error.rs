use thiserror::Error;

/// Orchestration errors surfaced to callers as typed failures.
///
/// Validation and state-machine violations are returned to the immediate
/// caller and never coerced into a default. Storage failures wrap the
/// underlying driver message.
#[derive(Error, Debug)]
pub enum GantryError {
    // Input and graph invariants
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Circular dependency detected: {cycle}")]
    CircularDependency { cycle: String },

    // Claim protocol
    #[error("Task {task_id} is already claimed by worker {holder}")]
    AlreadyClaimed { task_id: String, holder: String },

    #[error("No active claim on task {task_id} owned by worker {worker_id}")]
    ClaimNotFound { task_id: String, worker_id: String },

    #[error("Lease on task {task_id} expired at {expired_at}")]
    LeaseExpired { task_id: String, expired_at: String },

    #[error("Claim on task {task_id} has reached the renewal cap of {max}")]
    MaxRenewalsExceeded { task_id: String, max: u32 },

    // Entity lookup
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    // Store and serialization
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GantryError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a not-found error for a task
    pub fn task_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "task",
            id: id.into(),
        }
    }

    /// Whether the failed operation is worth retrying on a later pass.
    ///
    /// The reconciliation sweep uses this to decide between logging an orphan
    /// for the next sweep and treating the failure as a caller bug.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Io(_) | Self::Other(_))
    }
}

impl From<sqlx::Error> for GantryError {
    fn from(e: sqlx::Error) -> Self {
        GantryError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for GantryError {
    fn from(e: serde_json::Error) -> Self {
        GantryError::Serialization(e.to_string())
    }
}

/// Result type alias for GantryError
pub type Result<T> = std::result::Result<T, GantryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(GantryError::storage("disk full").is_retryable());
        assert!(!GantryError::task_not_found("tx-1").is_retryable());
        assert!(!GantryError::AlreadyClaimed {
            task_id: "tx-1".to_string(),
            holder: "w-1".to_string(),
        }
        .is_retryable());
    }

    #[test]
    fn test_error_display_carries_identifiers() {
        let err = GantryError::AlreadyClaimed {
            task_id: "tx-9".to_string(),
            holder: "worker-3".to_string(),
        };
        let display = err.to_string();
        assert!(display.contains("tx-9"));
        assert!(display.contains("worker-3"));

        let err = GantryError::MaxRenewalsExceeded {
            task_id: "tx-9".to_string(),
            max: 12,
        };
        assert!(err.to_string().contains("12"));
    }
}
