// Error handling framework
//
// One enum per concern. Construction errors surface synchronously to the
// caller; execution errors are recorded on the Job and never leave the pool.

use thiserror::Error;
use uuid::Uuid;

/// Malformed trigger arguments, reported before a trigger is ever started
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("Invalid timestamp '{value}': {reason}")]
    InvalidTimestamp { value: String, reason: String },

    #[error("Invalid duration '{value}': {reason}")]
    InvalidDuration { value: String, reason: String },

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid event selector '{selector}': {reason}")]
    InvalidEventSelector { selector: String, reason: String },

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Debounce is only allowed on event triggers, got '{0}'")]
    DebounceNotAllowed(String),
}

/// Trigger registry errors
#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(#[from] ArgumentError),

    #[error("Unknown trigger type: {0}")]
    UnknownType(String),

    #[error("Trigger not found: {domain}/{id}")]
    NotFound { domain: String, id: Uuid },

    #[error("Trigger already registered: {0}")]
    AlreadyExists(Uuid),

    #[error("Trigger store error: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to enqueue job: {0}")]
    Queue(#[from] QueueError),
}

/// Persistent store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Revision conflict: expected {expected}, found {actual}")]
    Conflict { expected: String, actual: String },

    #[error("Document already exists: {0}")]
    AlreadyExists(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// Broker / job queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue for worker '{worker_type}' is full ({limit} jobs waiting)")]
    QueueFull { worker_type: String, limit: usize },

    #[error("No worker registered for type '{0}'")]
    UnknownWorker(String),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),
}

/// Failure of a single job attempt, or the terminal reason a job gave up
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Execution timeout after {0} ms")]
    Timeout(u64),

    #[error("Execution failed: {0}")]
    Failure(String),

    #[error("Maximum execution count ({0}) reached")]
    ExhaustedRetries(u32),

    #[error("Maximum execution time of {0} ms exceeded")]
    OverallTimeout(u64),
}

impl ExecutionError {
    /// Stable machine-readable tag persisted on the job
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::Timeout(_) => "execution_timeout",
            ExecutionError::Failure(_) => "execution_failure",
            ExecutionError::ExhaustedRetries(_) => "exhausted_retries",
            ExecutionError::OverallTimeout(_) => "overall_timeout",
        }
    }
}

impl StoreError {
    /// Whether the same write may succeed if tried again later
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Database(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            sqlx::Error::Database(db_err) => {
                if db_err.code().as_deref() == Some("23505") {
                    StoreError::AlreadyExists(db_err.message().to_string())
                } else {
                    StoreError::Database(db_err.message().to_string())
                }
            }
            _ => StoreError::Database(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argument_error_display() {
        let err = ArgumentError::InvalidCronExpression {
            expression: "* * * *".to_string(),
            reason: "invalid format".to_string(),
        };
        assert!(err.to_string().contains("Invalid cron expression"));
    }

    #[test]
    fn test_trigger_error_from_argument_error() {
        let err: TriggerError = ArgumentError::InvalidTimezone("Mars/Olympus".to_string()).into();
        assert!(matches!(err, TriggerError::InvalidArgument(_)));
    }

    #[test]
    fn test_execution_error_kinds() {
        assert_eq!(ExecutionError::Timeout(10).kind(), "execution_timeout");
        assert_eq!(
            ExecutionError::Failure("boom".into()).kind(),
            "execution_failure"
        );
        assert_eq!(ExecutionError::ExhaustedRetries(3).kind(), "exhausted_retries");
        assert_eq!(ExecutionError::OverallTimeout(1000).kind(), "overall_timeout");
    }

    #[test]
    fn test_only_database_errors_are_transient() {
        assert!(StoreError::Database("connection reset".into()).is_transient());
        assert!(!StoreError::NotFound("job".into()).is_transient());
        assert!(!StoreError::Serialization("bad json".into()).is_transient());
        assert!(!StoreError::Conflict {
            expected: "1-a".into(),
            actual: "2-b".into(),
        }
        .is_transient());
    }

    #[test]
    fn test_queue_full_display() {
        let err = QueueError::QueueFull {
            worker_type: "thumbnail".to_string(),
            limit: 100,
        };
        assert!(err.to_string().contains("thumbnail"));
        assert!(err.to_string().contains("100"));
    }
}
