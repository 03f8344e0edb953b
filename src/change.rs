use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::value::Row;

/// Logical operation recorded in the change log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OpType {
    Insert,
    Update,
    Delete,
}

impl OpType {
    pub fn as_str(self) -> &'static str {
        match self {
            OpType::Insert => "insert",
            OpType::Update => "update",
            OpType::Delete => "delete",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(OpType::Insert),
            "update" => Some(OpType::Update),
            "delete" => Some(OpType::Delete),
            _ => None,
        }
    }
}

/// A single recorded mutation against a tracked table.
///
/// `id` is assigned at record time and is unique across the log for the
/// process lifetime; `timestamp` is milliseconds since the Unix epoch,
/// non-decreasing for changes recorded by the same producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub id: String,
    pub table: String,
    pub op: OpType,
    pub timestamp: i64,
    pub data: Row,
    pub old_data: Option<Row>,
    pub synced: bool,
}

/// Caller-supplied fields for [`crate::change_log::ChangeLog::record`]; the
/// log itself assigns `id`, `timestamp`, and `synced`.
#[derive(Debug, Clone)]
pub struct ChangeDescriptor {
    pub table: String,
    pub op: OpType,
    pub data: Row,
    pub old_data: Option<Row>,
}

impl ChangeDescriptor {
    pub fn new(table: impl Into<String>, op: OpType, data: Row) -> Self {
        Self {
            table: table.into(),
            op,
            data,
            old_data: None,
        }
    }

    pub fn with_old_data(mut self, old_data: Row) -> Self {
        self.old_data = Some(old_data);
        self
    }
}

pub fn new_change_id() -> String {
    Uuid::new_v4().to_string()
}

/// Error taxonomy (spec §7). Kinds, not names: low-level components return
/// their narrowest kind; the sync engine attaches operational context
/// (table, batch index, attempt number) without ever discarding the kind.
#[derive(Debug, Error, Clone)]
pub enum SyncError {
    #[error("network error (retryable={retryable}, status={status:?}): {message}")]
    Network {
        retryable: bool,
        status: Option<u16>,
        message: String,
    },

    #[error("authentication error (requires_refresh={requires_refresh}): {message}")]
    Auth {
        requires_refresh: bool,
        message: String,
    },

    #[error("{} unresolved conflict(s)", .list.len())]
    Conflict { list: Vec<crate::conflict::Conflict> },

    #[error("quota exceeded: used {used} of {limit}")]
    Quota { limit: u64, used: u64 },

    #[error("validation error{}: {}", field.as_deref().map(|f| format!(" on {f}")).unwrap_or_default(), summarize_details(details))]
    Validation {
        field: Option<String>,
        details: Vec<ValidationDetail>,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("{0} conflict requires manual resolution")]
    RequiresManual(String),

    #[error("unknown error: {cause}")]
    Unknown { cause: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationDetail {
    pub path: String,
    pub message: String,
}

fn summarize_details(details: &[ValidationDetail]) -> String {
    details
        .iter()
        .map(|d| format!("{}: {}", d.path, d.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl SyncError {
    /// Whether the Batch/Retry layer should retry an operation that failed
    /// with this error (spec §4.7: "network-retryable true, or
    /// auth-requires-refresh").
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network { retryable, .. } => *retryable,
            SyncError::Auth { requires_refresh, .. } => *requires_refresh,
            _ => false,
        }
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        SyncError::Storage(msg.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        SyncError::Validation {
            field: None,
            details: vec![ValidationDetail {
                path: String::new(),
                message: message.into(),
            }],
        }
    }

    pub fn unknown(cause: impl Into<String>) -> Self {
        SyncError::Unknown { cause: cause.into() }
    }

    /// Attach operational context to an error without changing its kind.
    pub fn with_context(self, context: &str) -> Self {
        match self {
            SyncError::Network { retryable, status, message } => SyncError::Network {
                retryable,
                status,
                message: format!("{context}: {message}"),
            },
            SyncError::Storage(message) => SyncError::Storage(format!("{context}: {message}")),
            SyncError::Unknown { cause } => SyncError::Unknown {
                cause: format!("{context}: {cause}"),
            },
            other => other,
        }
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Validation {
            field: None,
            details: vec![ValidationDetail {
                path: "json".to_string(),
                message: e.to_string(),
            }],
        }
    }
}
