//! Application-wide error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::domain::JobStatus;
use crate::engine::ExtractionError;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed submission, rejected before a job is created.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    /// The job already reached a terminal status.
    #[error("Job {id} is already {status}")]
    AlreadyTerminal { id: String, status: JobStatus },

    /// A conditional update lost the race against another transition.
    #[error("Conflict on job {id}: expected {expected}, found {actual}")]
    Conflict {
        id: String,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: JobStatus, to: JobStatus },

    #[error("Duplicate job id: {0}")]
    DuplicateId(String),

    #[error("Extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    /// History snapshot could not be read or written.
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error while {op} {path}: {source}")]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether this error only means a concurrent transition won.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
