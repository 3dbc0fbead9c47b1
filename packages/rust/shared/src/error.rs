//! Error types for kernelsync.
//!
//! Library crates use [`SyncError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

use crate::types::{RecordKind, SyncStage};

/// Top-level error type for all kernelsync operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Transport or non-success HTTP error while talking to the kernel.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The kernel answered 404 for a resource.
    #[error("not found upstream: {resource}")]
    NotFound { resource: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// A record references an owner that does not exist in the target store yet.
    #[error("missing {kind} '{id}' in target store")]
    MissingDependency { kind: RecordKind, id: String },

    /// An ordering token is neither numeric nor derivable from the PID v2.
    #[error("invalid order value {order:?} for member '{member_id}'")]
    InvalidOrderValue {
        member_id: String,
        order: Option<String>,
    },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A run-aborting failure, tagged with the stage it happened in.
    #[error("sync failed during {stage} stage: {source}")]
    Stage {
        stage: SyncStage,
        #[source]
        source: Box<SyncError>,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn missing(kind: RecordKind, id: impl Into<String>) -> Self {
        Self::MissingDependency {
            kind,
            id: id.into(),
        }
    }

    /// Tag this error with the stage that produced it. Already-tagged errors
    /// keep their original stage.
    pub fn in_stage(self, stage: SyncStage) -> Self {
        match self {
            Self::Stage { .. } => self,
            other => Self::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    pub fn is_missing_dependency(&self) -> bool {
        matches!(self, Self::MissingDependency { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
