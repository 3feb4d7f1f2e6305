//! Error taxonomy for a backup run.
//!
//! Fatal conditions are [`SyncError`] values and abort the run. Everything
//! else is a [`SyncIssue`]: recorded, logged, and surfaced in the run
//! summary without stopping the run.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A fatal run error. The store is left in its pre-run state.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Discovery root missing or unreachable. Raised before any store work.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Another run already holds the store's write lock.
    #[error("store is locked by another run: {0}")]
    StoreLocked(String),

    /// The run's transaction failed and was rolled back.
    #[error("store transaction failed: {0}")]
    StoreTransaction(#[from] sqlx::Error),
}

impl SyncError {
    /// Classify a sqlx error raised while acquiring the write lock.
    pub fn from_lock_attempt(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if is_busy(db.message()) => {
                SyncError::StoreLocked(db.message().to_string())
            }
            _ => SyncError::StoreTransaction(err),
        }
    }
}

fn is_busy(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("database is locked") || lower.contains("busy")
}

/// Kind of a non-fatal problem encountered during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    SourceRead,
    Normalization,
    ChangeDetectionInconsistency,
    DuplicateSession,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::SourceRead => "source_read",
            IssueKind::Normalization => "normalization",
            IssueKind::ChangeDetectionInconsistency => "change_detection_inconsistency",
            IssueKind::DuplicateSession => "duplicate_session",
        }
    }
}

/// A non-fatal problem, attributed to a workspace where possible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncIssue {
    pub kind: IssueKind,
    pub workspace: Option<String>,
    pub detail: String,
}

impl SyncIssue {
    pub fn source_read(workspace: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: IssueKind::SourceRead,
            workspace: Some(workspace.into()),
            detail: detail.into(),
        }
    }

    pub fn normalization(workspace: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: IssueKind::Normalization,
            workspace: Some(workspace.into()),
            detail: detail.into(),
        }
    }

    pub fn inconsistency(workspace: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: IssueKind::ChangeDetectionInconsistency,
            workspace: Some(workspace.into()),
            detail: detail.into(),
        }
    }

    pub fn duplicate(workspace: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: IssueKind::DuplicateSession,
            workspace: Some(workspace.into()),
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for SyncIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.workspace {
            Some(ws) => write!(f, "[{}] {}: {}", self.kind.as_str(), ws, self.detail),
            None => write!(f, "[{}] {}", self.kind.as_str(), self.detail),
        }
    }
}

/// Raised by the normalizer when a payload is unusable even best-effort.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizationError {
    #[error("empty payload")]
    Empty,
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("unsupported payload shape: {0}")]
    UnsupportedShape(&'static str),
}
