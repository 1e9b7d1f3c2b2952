use std::time::Duration;

/// Outcome classes of a single upstream call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// Network fault, 5xx or rate limited. Safe to retry.
    #[error("{source_name}: transient failure: {detail}")]
    Transient {
        source_name: String,
        detail: String,
        retry_after: Option<Duration>,
    },

    /// Bad request or unknown entity. Never retried.
    #[error("{source_name}: permanent failure: {detail}")]
    Permanent { source_name: String, detail: String },

    #[error("{source_name}: gave up after {attempts} attempts: {last_error}")]
    ExhaustedRetries {
        source_name: String,
        attempts: u32,
        last_error: String,
    },
}

impl FetchError {
    pub fn transient(source_name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Transient {
            source_name: source_name.into(),
            detail: detail.into(),
            retry_after: None,
        }
    }

    pub fn permanent(source_name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Permanent {
            source_name: source_name.into(),
            detail: detail.into(),
        }
    }
}

/// A single malformed record. Dropped by the caller, never fatal to a batch.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid {record} record {key}: {field} {reason}")]
pub struct ValidationError {
    pub record: &'static str,
    pub key: String,
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    pub fn new(
        record: &'static str,
        key: impl Into<String>,
        field: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            record,
            key: key.into(),
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error during {op}: {source}")]
    Database {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("storage fault during {op}: {detail}")]
    Fault { op: &'static str, detail: String },
}

impl StorageError {
    pub fn db(op: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| Self::Database { op, source }
    }
}

/// Why a ticker ended in `Failed`.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("run deadline exceeded during {stage}")]
    DeadlineExceeded { stage: &'static str },
}
